use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use intercom_proto::{Envelope, Notice, Role};
use parking_lot::Mutex;
use serde::Serialize;
use slab::Slab;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifies one transport connection. Never reused, unlike slab keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Work queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Envelope(Envelope),
    Notice(Notice),
}

/// Out-of-band request to close a connection. Never waits on queue space, so
/// a peer that stopped reading can still be evicted.
#[derive(Debug, Clone, Default)]
pub struct CloseSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<&'static str>>,
}

impl CloseSignal {
    /// First reason wins; later calls only re-cancel.
    pub fn close(&self, reason: &'static str) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves with the close reason once `close` has been called.
    pub async fn closed(&self) -> &'static str {
        self.token.cancelled().await;
        self.reason.get().copied().unwrap_or("closed")
    }
}

/// Write side of a live connection, owned by its registry entry.
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
    close: CloseSignal,
}

impl EndpointHandle {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(depth);
        (
            Self {
                id: ConnectionId::new(),
                sender,
                close: CloseSignal::default(),
            },
            receiver,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_writable(&self) -> bool {
        !self.sender.is_closed() && !self.close.is_closed()
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.close.clone()
    }

    pub fn close(&self, reason: &'static str) {
        self.close.close(reason);
    }

    pub fn try_send(&self, message: Outbound) -> Result<(), TrySendError<Outbound>> {
        self.sender.try_send(message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub role: Role,
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
}

struct Endpoint {
    role: Role,
    handle: EndpointHandle,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
}

/// Live endpoints by role, with a reverse index by connection so close
/// events (which only know the connection) can find their entry.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    slab: Slab<Endpoint>,
    by_role: HashMap<Role, usize>,
    by_handle: HashMap<ConnectionId, usize>,
}

impl RegistryInner {
    fn remove_slot(&mut self, key: usize) -> Endpoint {
        let endpoint = self.slab.remove(key);
        self.by_role.remove(&endpoint.role);
        self.by_handle.remove(&endpoint.handle.id);
        endpoint
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` for `role`. An existing handle for the role is told
    /// to close and evicted first; its id is returned.
    pub fn register(&self, role: Role, handle: EndpointHandle, now: Instant) -> Option<ConnectionId> {
        let mut inner = self.inner.lock();

        let displaced = match inner.by_role.get(&role).copied() {
            Some(key) => {
                let old = inner.remove_slot(key);
                old.handle.close("replaced");
                Some(old.handle.id)
            }
            None => None,
        };

        let id = handle.id;
        let key = inner.slab.insert(Endpoint {
            role,
            handle,
            connected_at: Utc::now(),
            last_activity: now,
        });
        inner.by_role.insert(role, key);
        inner.by_handle.insert(id, key);

        displaced
    }

    pub fn lookup(&self, role: Role) -> Option<EndpointHandle> {
        let inner = self.inner.lock();
        let key = inner.by_role.get(&role)?;
        inner.slab.get(*key).map(|endpoint| endpoint.handle.clone())
    }

    /// Remove whichever role `id` is registered under. Returns `None` when
    /// the connection was already removed or replaced.
    pub fn unregister(&self, id: ConnectionId) -> Option<Role> {
        let mut inner = self.inner.lock();
        let key = inner.by_handle.get(&id).copied()?;
        Some(inner.remove_slot(key).role)
    }

    /// Record inbound activity. Returns `false` when `id` is no longer the
    /// registered connection for any role.
    pub fn touch(&self, id: ConnectionId, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let Some(key) = inner.by_handle.get(&id).copied() else {
            return false;
        };
        match inner.slab.get_mut(key) {
            Some(endpoint) => {
                endpoint.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Endpoints with no inbound activity for longer than `timeout`.
    pub fn idle(&self, now: Instant, timeout: Duration) -> Vec<(Role, EndpointHandle)> {
        let inner = self.inner.lock();
        inner
            .slab
            .iter()
            .filter(|(_, endpoint)| now.saturating_duration_since(endpoint.last_activity) > timeout)
            .map(|(_, endpoint)| (endpoint.role, endpoint.handle.clone()))
            .collect()
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let inner = self.inner.lock();
        let mut endpoints: Vec<EndpointInfo> = inner
            .slab
            .iter()
            .map(|(_, endpoint)| EndpointInfo {
                role: endpoint.role,
                connection_id: endpoint.handle.id,
                connected_at: endpoint.connected_at,
            })
            .collect();
        endpoints.sort_by_key(|info| info.role.as_str());
        endpoints
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(registry: &Registry) {
        let inner = registry.inner.lock();
        assert_eq!(inner.slab.len(), inner.by_role.len());
        assert_eq!(inner.slab.len(), inner.by_handle.len());
        for (role, key) in &inner.by_role {
            assert_eq!(inner.slab[*key].role, *role);
        }
        for (id, key) in &inner.by_handle {
            assert_eq!(inner.slab[*key].handle.id, *id);
        }
    }

    #[test_timeout::timeout]
    fn register_and_lookup() {
        let registry = Registry::new();
        let (handle, _rx) = EndpointHandle::channel(4);
        let id = handle.id();

        assert!(registry.register(Role::Caller, handle, Instant::now()).is_none());
        assert_eq!(registry.lookup(Role::Caller).map(|h| h.id()), Some(id));
        assert!(registry.lookup(Role::Callee).is_none());
    }

    #[test_timeout::timeout]
    fn replacement_closes_old_handle() {
        let registry = Registry::new();
        let (first, mut first_rx) = EndpointHandle::channel(4);
        let (second, _second_rx) = EndpointHandle::channel(4);
        let first_id = first.id();
        let second_id = second.id();

        registry.register(Role::Callee, first.clone(), Instant::now());
        let displaced = registry.register(Role::Callee, second, Instant::now());

        assert_eq!(displaced, Some(first_id));
        assert!(first.close_signal().is_closed());
        assert!(!first.is_writable());
        assert!(first_rx.try_recv().is_err());
        assert_eq!(registry.lookup(Role::Callee).map(|h| h.id()), Some(second_id));
        assert_eq!(registry.len(), 1);

        // The evicted connection's close event must not remove its successor.
        assert_eq!(registry.unregister(first_id), None);
        assert_eq!(registry.lookup(Role::Callee).map(|h| h.id()), Some(second_id));
    }

    #[test_timeout::timeout]
    fn replacement_closes_old_handle_even_with_full_queue() {
        let registry = Registry::new();
        let (first, _first_rx) = EndpointHandle::channel(1);
        first
            .try_send(Outbound::Notice(Notice::PeerUnavailable { peer: Role::Caller }))
            .unwrap();
        let signal = first.close_signal();
        registry.register(Role::Callee, first, Instant::now());

        let (second, _second_rx) = EndpointHandle::channel(1);
        registry.register(Role::Callee, second, Instant::now());

        assert!(signal.is_closed());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn close_signal_reports_first_reason() {
        let signal = CloseSignal::default();
        signal.close("replaced");
        signal.close("idle timeout");
        assert_eq!(signal.closed().await, "replaced");
    }

    #[test_timeout::timeout]
    fn touch_reports_unknown_connections() {
        let registry = Registry::new();
        let (handle, _rx) = EndpointHandle::channel(4);
        let id = handle.id();

        assert!(!registry.touch(id, Instant::now()));
        registry.register(Role::Caller, handle, Instant::now());
        assert!(registry.touch(id, Instant::now()));
        registry.unregister(id);
        assert!(!registry.touch(id, Instant::now()));
    }

    #[test_timeout::timeout]
    fn unregister_is_idempotent() {
        let registry = Registry::new();
        let (handle, _rx) = EndpointHandle::channel(4);
        let id = handle.id();
        registry.register(Role::Caller, handle, Instant::now());

        assert_eq!(registry.unregister(id), Some(Role::Caller));
        assert_eq!(registry.unregister(id), None);
        assert!(registry.is_empty());
    }

    #[test_timeout::timeout]
    fn idle_reports_stale_endpoints() {
        let registry = Registry::new();
        let start = Instant::now();
        let (caller, _caller_rx) = EndpointHandle::channel(4);
        let (callee, _callee_rx) = EndpointHandle::channel(4);
        let callee_id = callee.id();
        registry.register(Role::Caller, caller, start);
        registry.register(Role::Callee, callee, start);

        registry.touch(callee_id, start + Duration::from_secs(50));
        let idle = registry.idle(start + Duration::from_secs(61), Duration::from_secs(60));

        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].0, Role::Caller);
    }

    #[test_timeout::timeout]
    fn at_most_one_handle_per_role_for_any_sequence() {
        #[derive(Clone, Copy)]
        enum Op {
            Register(Role),
            UnregisterOldest,
            UnregisterNewest,
        }
        let alphabet = [
            Op::Register(Role::Caller),
            Op::Register(Role::Callee),
            Op::UnregisterOldest,
            Op::UnregisterNewest,
        ];

        let len = 5;
        for mut code in 0..alphabet.len().pow(len) {
            let registry = Registry::new();
            let mut issued: Vec<ConnectionId> = Vec::new();
            let mut receivers = Vec::new();

            for _ in 0..len {
                match alphabet[code % alphabet.len()] {
                    Op::Register(role) => {
                        let (handle, rx) = EndpointHandle::channel(4);
                        issued.push(handle.id());
                        receivers.push(rx);
                        registry.register(role, handle, Instant::now());
                    }
                    Op::UnregisterOldest => {
                        if let Some(id) = issued.first() {
                            registry.unregister(*id);
                        }
                    }
                    Op::UnregisterNewest => {
                        if let Some(id) = issued.last() {
                            registry.unregister(*id);
                        }
                    }
                }
                code /= alphabet.len();

                assert_consistent(&registry);
                assert!(registry.len() <= Role::ALL.len());
            }
        }
    }
}
