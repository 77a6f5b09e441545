//! Command-line configuration (spec §6 "External interfaces").
//!
//! Mirrors the shape of the teacher's [`BrowserConfig`](crate) in spirit —
//! one plain struct with a `Default` impl — but parsed straight off
//! `std::env::args` with `clap::Parser` rather than assembled through a
//! builder, since this binary has no embedding API to serve.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Startup configuration for the PurCMC server core.
#[derive(Parser, Debug, Clone)]
#[command(name = "purcmc-server", about = "PurCMC protocol server core for the advanced HVML renderer")]
pub struct ServerConfig {
    /// Path of the Unix domain socket to listen on. Omit to disable the
    /// Unix transport.
    #[arg(long, value_name = "PATH")]
    pub unix_socket: Option<PathBuf>,

    /// Address to bind the WebSocket listener to. Omit to disable the
    /// WebSocket transport.
    #[arg(long, value_name = "IP")]
    pub addr: Option<IpAddr>,

    /// Port for the WebSocket listener.
    #[arg(long, default_value_t = 7687)]
    pub port: u16,

    /// Path to a TLS certificate to terminate WebSocket connections with.
    /// Requires `--tls-key`.
    #[arg(long, value_name = "PATH")]
    pub tls_cert: Option<PathBuf>,

    /// Path to the TLS private key matching `--tls-cert`.
    #[arg(long, value_name = "PATH")]
    pub tls_key: Option<PathBuf>,

    /// Listen backlog passed to `listen(2)` for the Unix socket.
    #[arg(long, default_value_t = 128)]
    pub backlog: u32,

    /// Largest payload a single frame may carry before the codec splits it
    /// into continuation frames.
    #[arg(long, default_value_t = crate::frame::DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,

    /// Logs every request/response pair to a second `tracing` layer.
    #[arg(long)]
    pub accesslog: bool,

    /// Raises the default log level to `debug` for this crate, equivalent
    /// to `RUST_LOG=purcmc_server=debug`.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Product name reported in the feature manifest sent on accept.
    #[arg(long, default_value = "PurCMC Renderer")]
    pub product_name: String,
}

impl ServerConfig {
    /// Whether both halves of a TLS configuration were supplied. `main.rs`
    /// treats one without the other as a startup error.
    pub fn tls_configured(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn tls_partially_configured(&self) -> bool {
        self.tls_cert.is_some() != self.tls_key.is_some()
    }

    pub fn socket_addr(&self) -> Option<std::net::SocketAddr> {
        self.addr.map(|ip| std::net::SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_neither_transport() {
        let cfg = ServerConfig::parse_from(["purcmc-server"]);
        assert!(cfg.unix_socket.is_none());
        assert!(cfg.addr.is_none());
        assert_eq!(cfg.port, 7687);
        assert!(!cfg.accesslog);
    }

    #[test]
    fn tls_requires_both_flags() {
        let cfg = ServerConfig::parse_from(["purcmc-server", "--tls-cert", "a.pem"]);
        assert!(cfg.tls_partially_configured());
        assert!(!cfg.tls_configured());
    }

    #[test]
    fn addr_and_port_combine_into_a_socket_addr() {
        let cfg = ServerConfig::parse_from(["purcmc-server", "--addr", "127.0.0.1", "--port", "9000"]);
        assert_eq!(cfg.socket_addr(), Some(([127, 0, 0, 1], 9000).into()));
    }
}
