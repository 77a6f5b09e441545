//! Internal error type for the server core.
//!
//! Mirrors the shape of the teacher's `CdpError`: one `thiserror` enum with
//! `#[from]` conversions for the handful of things that can actually go
//! wrong at this layer, plus a `Protocol` variant that carries the
//! [`RetCode`] a handler wants to answer with instead of unwinding the
//! connection.

use thiserror::Error;

pub use purcmc_types::RetCode;

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Frame(#[from] crate::frame::FrameError),
    #[error("protocol error: {0}")]
    Parse(#[from] purcmc_types::ParseError),
    #[error("{0}")]
    ChannelSend(#[from] ChannelError),
    /// Surfaced by a handler that wants to answer with a specific ret code
    /// rather than propagate a hard I/O failure.
    #[error("request failed with ret code {0}")]
    Protocol(RetCode),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("send on a closed channel")]
    Send,
    #[error("sender was dropped")]
    Canceled,
}

impl ServerError {
    pub fn ret_code(&self) -> RetCode {
        match self {
            ServerError::Protocol(code) => *code,
            ServerError::Json(_) => RetCode::UnprocessablePacket,
            ServerError::Parse(_) => RetCode::BadRequest,
            ServerError::Io(_) | ServerError::Frame(_) | ServerError::ChannelSend(_) => {
                RetCode::InternalServerError
            }
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ServerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ServerError::ChannelSend(ChannelError::Send)
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ServerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ServerError::ChannelSend(ChannelError::Canceled)
    }
}
