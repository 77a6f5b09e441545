//! PurCMC protocol server core for the advanced HVML renderer.
//!
//! A single-threaded, cooperatively-scheduled implementation of the PurCMC
//! wire protocol: one [`server::Server`] owns every accepted connection,
//! every workspace, and every session, and drives them all from one
//! `tokio::select!` loop with no per-connection `tokio::spawn`.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod dom;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod model;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use server::Server;
