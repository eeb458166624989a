//! Signaling relay for a two-party intercom: forwards offers, answers,
//! candidates and hangups between one caller and one callee, and tracks the
//! single call session they share.

pub mod call;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod poll;
pub mod registry;
pub mod relay;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod websocket;

pub use call::{CallEvent, CallMachine, CallSnapshot, CallStatus, Transition, View};
pub use relay::{Relay, RelaySettings};
pub use router::{DropReason, RouteOutcome};
