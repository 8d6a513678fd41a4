//! Event stream and long-poll HTTP handlers.
//!
//! The distribution engine itself (registries, handshake, history) lives in
//! the `sse` crate; this module only adapts it to axum.

pub mod handler;
