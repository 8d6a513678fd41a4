//! Shared vocabulary for the chat relay.
//!
//! This crate holds everything that both the server-side distribution core and
//! the client-side connection need to agree on, without depending on either.
//!
//! # Architecture
//!
//! - **message**: `ChatMessage`, the `Envelope` wire union and time-value helpers
//! - **clock**: the `Clock` capability (`TokioClock` for production, `ManualClock` for tests)
//! - **idle_timer**: the reusable fire-if-idle primitive shared by keep-alives and liveness checks
//! - **channel**: the cross-process pub/sub port (`Channel`, `LocalChannel`)
//!
//! This crate has no dependencies on internal crates, avoiding circular dependencies.

pub mod channel;
pub mod clock;
pub mod idle_timer;
pub mod message;

pub use channel::{Channel, ChannelHandler, ChannelMessage, LocalChannel};
pub use clock::{Clock, ManualClock, TimerHandle, TokioClock};
pub use idle_timer::IdleTimer;
pub use message::{ChatMessage, Envelope, EventType, TimeMs};
