//! Component B: transport listener & per-client I/O (spec §4.B).
//!
//! Realized on top of `tokio`'s readiness-driven reactor rather than a
//! hand-rolled `epoll`/`select` loop — the spec's "one single-threaded
//! event loop" requirement is met by running everything on a
//! `current_thread` runtime (`src/server.rs`) and never calling
//! `tokio::spawn`, so there is still exactly one task polling exactly one
//! set of sockets, just as the original C core has exactly one `epoll_wait`
//! call site.

pub mod client;
pub mod listener;

pub use client::{ClientIo, OutboundQueue};
pub use listener::Listener;

/// Refuses new connections past this count (spec §4.B "Accept policy").
pub const MAX_CLIENTS_EACH: usize = 512;

/// Outbound queue byte threshold past which a client is flagged
/// *throttling* (spec §4.B).
pub const THROTTLE_THRESHOLD: usize = 1024 * 1024;
