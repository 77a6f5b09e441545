//! Endpoint identity and lifecycle state (spec §3 "Endpoint", §4.D, §4.E).

use std::fmt;
use std::time::Instant;

use crate::session::Session;

/// Opaque id for one connected peer, stable for the life of the TCP/Unix
/// connection regardless of authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

/// The canonical `@host/app/runner` name an endpoint claims at handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointName {
    pub host: String,
    pub app: String,
    pub runner: String,
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}/{}/{}", self.host, self.app, self.runner)
    }
}

/// Grammar resolved from spec §9 Open Question: identifiers are
/// `[A-Za-z_][A-Za-z0-9_.]*`, capped at 63 bytes. Dots are allowed (not as
/// the leading character) so reverse-domain `appName`s like `com.example`
/// validate; `host` and `runner` happen to never use them in practice.
pub fn is_valid_identifier(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

impl EndpointName {
    pub fn is_syntactically_valid(&self) -> bool {
        is_valid_identifier(&self.host)
            && is_valid_identifier(&self.app)
            && is_valid_identifier(&self.runner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Accepted, initial response sent, awaiting `startSession`.
    Authenticating,
    /// Same as `Authenticating`, but a confirmation dialog is pending
    /// (`duplicate:true` deferred path, spec §4.E).
    AwaitingConfirmation,
    Ready,
}

/// One connected peer. Carries its own [`Session`] once `Ready`.
pub struct Endpoint {
    pub id: EndpointId,
    pub name: Option<EndpointName>,
    pub state: AuthState,
    pub session: Option<Session>,
    pub created_at: Instant,
    pub last_activity: Instant,
    /// Stashed when the `duplicate:true` path defers the reply; resolved by
    /// an external `accept_endpoint` call.
    pub deferred_request_id: Option<String>,
}

impl Endpoint {
    pub fn new(id: EndpointId, now: Instant) -> Self {
        Self {
            id,
            name: None,
            state: AuthState::Authenticating,
            session: None,
            created_at: now,
            last_activity: now,
            deferred_request_id: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, AuthState::Ready) && self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_grammar_rejects_bad_names() {
        assert!(is_valid_identifier("my_app"));
        assert!(is_valid_identifier("_x9"));
        assert!(!is_valid_identifier("9x"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier(&"a".repeat(64)));
    }

    #[test]
    fn endpoint_name_display_matches_wire_form() {
        let n = EndpointName {
            host: "localhost".into(),
            app: "com.example".into(),
            runner: "main".into(),
        };
        assert_eq!(n.to_string(), "@localhost/com.example/main");
    }
}
