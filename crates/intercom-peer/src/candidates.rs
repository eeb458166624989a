use std::collections::VecDeque;

use crate::error::PeerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    /// No remote description yet; candidates are held.
    AwaitingDescription,
    /// Remote description applied; candidates pass straight through.
    Flushed,
    /// Session ended; nothing is accepted until [`CandidateQueue::restart`].
    Discarded,
}

/// What the caller should do with a candidate handed to [`CandidateQueue::enqueue`].
#[derive(Debug, PartialEq)]
pub enum Admission<C> {
    /// Held until the next flush.
    Queued,
    /// Apply now; the remote description is already in place.
    Apply(C),
    /// Belongs to an ended session and must not be applied.
    Stale(C),
}

/// Per-connection buffer for candidates that arrive before the remote
/// description. Drained once, in arrival order.
#[derive(Debug)]
pub struct CandidateQueue<C> {
    pending: VecDeque<C>,
    phase: QueuePhase,
}

impl<C> Default for CandidateQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CandidateQueue<C> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            phase: QueuePhase::AwaitingDescription,
        }
    }

    pub fn phase(&self) -> QueuePhase {
        self.phase
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn enqueue(&mut self, candidate: C) -> Admission<C> {
        match self.phase {
            QueuePhase::AwaitingDescription => {
                self.pending.push_back(candidate);
                Admission::Queued
            }
            QueuePhase::Flushed => Admission::Apply(candidate),
            QueuePhase::Discarded => Admission::Stale(candidate),
        }
    }

    /// Hand back every held candidate in arrival order. Valid once per
    /// negotiation cycle.
    pub fn flush(&mut self) -> Result<Vec<C>, PeerError> {
        match self.phase {
            QueuePhase::AwaitingDescription => {
                self.phase = QueuePhase::Flushed;
                Ok(self.pending.drain(..).collect())
            }
            QueuePhase::Flushed => Err(PeerError::AlreadyFlushed),
            QueuePhase::Discarded => Err(PeerError::QueueDiscarded),
        }
    }

    /// Drop everything on hangup. Returns how many candidates were thrown away.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.phase = QueuePhase::Discarded;
        dropped
    }

    /// Begin a new negotiation cycle, forgetting anything from the last one.
    pub fn restart(&mut self) {
        self.pending.clear();
        self.phase = QueuePhase::AwaitingDescription;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn flush_returns_candidates_in_arrival_order() {
        let mut queue = CandidateQueue::new();
        for candidate in ["c1", "c2", "c3"] {
            assert_eq!(queue.enqueue(candidate), Admission::Queued);
        }
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.flush().unwrap(), vec!["c1", "c2", "c3"]);
        assert!(queue.is_empty());
        assert_eq!(queue.phase(), QueuePhase::Flushed);
    }

    #[test_timeout::timeout]
    fn candidates_after_flush_pass_through() {
        let mut queue = CandidateQueue::new();
        queue.enqueue("early");
        queue.flush().unwrap();

        assert_eq!(queue.enqueue("late"), Admission::Apply("late"));
        assert!(queue.is_empty());
    }

    #[test_timeout::timeout]
    fn flush_happens_exactly_once() {
        let mut queue: CandidateQueue<&str> = CandidateQueue::new();
        assert!(queue.flush().unwrap().is_empty());
        assert!(matches!(queue.flush(), Err(PeerError::AlreadyFlushed)));
    }

    #[test_timeout::timeout]
    fn discarded_queue_is_empty_and_rejects_flush() {
        let mut queue = CandidateQueue::new();
        queue.enqueue("old-1");
        queue.enqueue("old-2");

        assert_eq!(queue.discard(), 2);
        assert!(queue.is_empty());
        assert!(matches!(queue.flush(), Err(PeerError::QueueDiscarded)));
        assert_eq!(queue.enqueue("in-flight"), Admission::Stale("in-flight"));
        assert!(queue.is_empty());
    }

    #[test_timeout::timeout]
    fn restart_never_leaks_previous_session() {
        let mut queue = CandidateQueue::new();
        queue.enqueue("old");
        queue.restart();
        queue.enqueue("new");

        assert_eq!(queue.flush().unwrap(), vec!["new"]);

        queue.discard();
        queue.restart();
        assert_eq!(queue.phase(), QueuePhase::AwaitingDescription);
        assert_eq!(queue.enqueue("next"), Admission::Queued);
    }
}
