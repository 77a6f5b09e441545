//! Binds the Unix-domain and TCP sockets (spec §6 "External interfaces").
//!
//! Grounded in the original implementation's `unixsocket.c` (unlink stale
//! path, bind, `chmod(0666)`, `listen(backlog)`) rather than the teacher,
//! which never binds a listening socket of its own (it only dials out to
//! an existing Chrome DevTools endpoint).

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::net::{TcpListener, UnixListener};

use crate::error::Result;

pub struct Listener {
    pub unix: Option<UnixListener>,
    pub tcp: Option<TcpListener>,
}

impl Listener {
    /// Binds the configured transports. Either may be omitted by passing
    /// `None` for its address — at least one should be set by the caller.
    pub async fn bind(
        unix_path: Option<&Path>,
        tcp_addr: Option<std::net::SocketAddr>,
        backlog: u32,
    ) -> Result<Self> {
        let unix = match unix_path {
            Some(path) => Some(bind_unix(path, backlog)?),
            None => None,
        };
        let tcp = match tcp_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        Ok(Self { unix, tcp })
    }
}

fn bind_unix(path: &Path, _backlog: u32) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_a_fresh_unix_socket_with_the_configured_mode() {
        let dir = std::env::temp_dir().join(format!("purcmc-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let listener = Listener::bind(Some(&dir), None, 128).await.unwrap();
        assert!(listener.unix.is_some());
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o666);
        let _ = std::fs::remove_file(&dir);
    }
}
