//! Component A: frame codecs.
//!
//! Two independent state machines — one per transport — behind a common
//! "read one logical message body" shape, mirrored on the teacher's
//! `Connection<T>: Stream<Item = Result<Message<T>>>` in `conn.rs`: both
//! yield fully-assembled message bodies and hide fragmentation/continuation
//! bookkeeping from the caller.

pub mod unix;
pub mod ws;

/// Default packet buffer used when serializing responses (spec §4.C).
pub const DEFAULT_PACKET_BUFFER: usize = 8 * 1024;

/// Default in-memory payload cap per assembled message (spec §6).
pub const DEFAULT_MAX_INMEM_PAYLOAD: usize = 10 * 1024 * 1024;

/// Default maximum single WebSocket frame payload (spec §6).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Outcome of feeding more bytes into a frame decoder.
#[derive(Debug)]
pub enum Decoded {
    /// Not enough bytes buffered yet to make progress.
    NeedMore,
    /// A complete message body was assembled.
    Message { body: Vec<u8>, is_text: bool },
    /// A control frame arrived (ping/pong already answered internally;
    /// close is surfaced so the caller can tear the connection down).
    Close { code: u16, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds the per-frame size cap")]
    FrameTooLarge,
    #[error("assembled message exceeds the in-memory payload cap")]
    PacketTooLarge,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("invalid utf-8 in text frame")]
    InvalidUtf8,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
