//! Per-endpoint session state (spec §3 "Session", §9 handle allocation).
//!
//! A session owns the handle table for every object created on behalf of
//! one authenticated endpoint: plain windows, widgets, web views. Handles
//! are 64-bit opaque IDs drawn from a generation counter and never
//! reissued, mirroring the teacher's preference for typed ids
//! (`TargetId`, `SessionId`) over raw pointers.

use std::collections::HashMap;

use purcmc_types::{HandleId, HandleKind};

use crate::error::{Result, ServerError};
use crate::message::CodecError;

/// Allocates and validates [`HandleId`]s for one session.
#[derive(Debug, Default)]
pub struct HandleTable {
    next: u64,
    entries: HashMap<HandleId, HandleKind>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }

    /// Mints a fresh handle of the given kind, recording it as live.
    pub fn alloc(&mut self, kind: HandleKind) -> HandleId {
        let id = HandleId(self.next);
        self.next += 1;
        self.entries.insert(id, kind);
        id
    }

    /// Validates that `id` is live and of `expected` kind, per spec §4.F
    /// step 1 ("validate that target/targetValue map to a live handle of a
    /// compatible kind").
    pub fn check(&self, id: HandleId, expected: HandleKind) -> Result<()> {
        match self.entries.get(&id) {
            Some(kind) if *kind == expected => Ok(()),
            Some(_) => Err(ServerError::Protocol(crate::error::RetCode::BadRequest)),
            None => Err(ServerError::Protocol(crate::error::RetCode::NotFound)),
        }
    }

    pub fn kind_of(&self, id: HandleId) -> Option<HandleKind> {
        self.entries.get(&id).copied()
    }

    /// Removes a handle at destruction time (spec §4.G "removed at
    /// destruction").
    pub fn free(&mut self, id: HandleId) {
        self.entries.remove(&id);
    }

    pub fn is_live(&self, id: HandleId) -> bool {
        self.entries.contains_key(&id)
    }
}

/// An identifier for a pending asynchronous request, used as the key of the
/// per-session pending-response table (spec §4.H).
pub type PendingKey = String;

/// A slot installed when a handler defers its reply to the DOM pipeline
/// (spec §4.F step 3, §4.H step 2).
#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub result_value: HandleId,
    /// Plaintext to report alongside the eventual response body, used by
    /// `load`/`loadFromUrl` to surface a suppressed coroutine handle.
    pub plaintext: Option<String>,
}

/// All per-endpoint state that survives for the life of an authenticated
/// session: its handle table and its table of in-flight async requests.
#[derive(Debug, Default)]
pub struct Session {
    pub handles: HandleTable,
    pub pending: HashMap<PendingKey, PendingResponse>,
    /// Every handle the session created, independent of kind — the
    /// `all_handles` set of spec §4.G, used for bulk teardown on
    /// `endSession`/disconnect.
    pub all_handles: Vec<HandleId>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            handles: HandleTable::new(),
            pending: HashMap::new(),
            all_handles: Vec::new(),
        }
    }

    pub fn register_handle(&mut self, kind: HandleKind) -> HandleId {
        let id = self.handles.alloc(kind);
        self.all_handles.push(id);
        id
    }

    /// Records a handle minted by an external collaborator (e.g. the
    /// widget backend's own container/view ids) as live in this session,
    /// without drawing from the session's own generation counter.
    pub fn adopt_handle(&mut self, id: HandleId, kind: HandleKind) {
        self.handles.entries.insert(id, kind);
        self.all_handles.push(id);
    }

    pub fn destroy_handle(&mut self, id: HandleId) {
        self.handles.free(id);
        self.all_handles.retain(|h| *h != id);
    }

    /// Installs a pending-response slot; rejects a duplicate `request_id`,
    /// per spec §5 "the server guarantees no duplicate requestId is ever
    /// pending at the same time for the same endpoint".
    pub fn pend_response(
        &mut self,
        request_id: impl Into<PendingKey>,
        result_value: HandleId,
        plaintext: Option<String>,
    ) -> Result<()> {
        let key = request_id.into();
        if self.pending.contains_key(&key) {
            return Err(ServerError::Protocol(crate::error::RetCode::Conflict));
        }
        self.pending
            .insert(key, PendingResponse { result_value, plaintext });
        Ok(())
    }

    pub fn take_pending(&mut self, request_id: &str) -> Option<PendingResponse> {
        self.pending.remove(request_id)
    }
}

impl From<CodecError> for ServerError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Incomplete => ServerError::Protocol(crate::error::RetCode::BadRequest),
            CodecError::Parse(p) => ServerError::Parse(p),
            CodecError::BadDataLen(_) => ServerError::Protocol(crate::error::RetCode::BadRequest),
            CodecError::Json(j) => ServerError::Json(j),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_never_reissued() {
        let mut t = HandleTable::new();
        let a = t.alloc(HandleKind::PlainWin);
        t.free(a);
        let b = t.alloc(HandleKind::PlainWin);
        assert_ne!(a, b);
    }

    #[test]
    fn check_rejects_wrong_kind_and_unknown_handle() {
        let mut t = HandleTable::new();
        let a = t.alloc(HandleKind::PlainWin);
        assert!(t.check(a, HandleKind::PaneOrTab).is_err());
        assert!(t.check(HandleId(9999), HandleKind::PlainWin).is_err());
        assert!(t.check(a, HandleKind::PlainWin).is_ok());
    }

    #[test]
    fn pend_response_rejects_duplicate_request_id() {
        let mut s = Session::new();
        s.pend_response("1", HandleId::ZERO, None).unwrap();
        assert!(s.pend_response("1", HandleId::ZERO, None).is_err());
    }
}
