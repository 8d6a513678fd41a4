//! Message distribution core for real-time chat over event streams and long-polls.
//!
//! This crate owns everything between "a message was published" and "a reader
//! received it": retained history, live subscriber registries, and the
//! handshake that decides whether a reconnecting reader gets an incremental
//! replay or a full resync. It is transport-independent; the `web` crate maps
//! HTTP requests onto it.
//!
//! # Architecture
//!
//! - **Single owner per process**: one `Manager` owns the registries and the
//!   ring of recent history. Cross-process fan-out goes through an injected
//!   `events::Channel`.
//! - **Gap-safe replay**: readers present the timestamp of the last event they
//!   saw. If `HistoryStore` can prove nothing is missing they get exactly the
//!   newer messages, otherwise a `welcome` with the full retained history.
//! - **Two transports**: push subscribers receive every message as it is
//!   distributed; long-polls are held and released in batches.
//! - **Deterministic time**: all timers go through `events::Clock`, so every
//!   schedule can be driven from tests.
//!
//! # Message Flow
//!
//! 1. `Publisher::publish` stamps a message and posts it on the channel
//! 2. The engine's channel handler accepts it (ignoring duplicates by timestamp)
//! 3. The message is appended to the ring, sent to every push subscriber and
//!    counted toward every pending poll
//! 4. Polls past their minimum wait are released with a `chat` of everything
//!    newer than their last event id
//!
//! # Modules
//!
//! - `history`: `HistoryStore`, the growable ring with its `lower_bound`
//! - `connection`: `PushRegistry` and the `ConnectionId` / `PushSink` types
//! - `poll`: `PollRegistry` with its single sweep timer
//! - `handshake`: `HandshakeCoordinator`, the welcome/reconnect protocol
//! - `manager`: `Manager`, which composes all of the above
//! - `publisher`: `Publisher`, the publishing side of the channel
//! - `subscription`: idempotent unregister handles

mod channel_handler;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod history;
pub mod manager;
pub mod message;
pub mod poll;
pub mod publisher;
pub mod subscription;

pub use manager::{ConnectRequest, EngineConfig, Manager, Stats};
pub use publisher::Publisher;
pub use subscription::Subscription;
