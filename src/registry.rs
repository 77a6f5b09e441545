//! Component D: the endpoint registry (spec §4.D).
//!
//! Two views over the same set of ready endpoints — a name-keyed map for
//! handshake collision checks, and an activity-ordered index for the idle
//! sweep — plus a separate dangling list for peers that haven't finished
//! `startSession` yet. Mirrors the split the teacher keeps between
//! `targets: HashMap<TargetId, Target>` and `sessions: HashMap<SessionId,
//! Session>` in `handler/mod.rs`, generalized to the two registry views
//! spec §4.D calls for.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use purcmc_types::HandleId;

use crate::endpoint::{Endpoint, EndpointId, EndpointName};
use crate::error::{Result, ServerError};

/// The authoritative table of connected peers.
#[derive(Default)]
pub struct Registry {
    by_name: HashMap<EndpointName, EndpointId>,
    endpoints: HashMap<EndpointId, Endpoint>,
    /// `(last_activity, id)` so re-ordering on activity update is a
    /// remove+reinsert, same cost profile as the spec's balanced tree.
    by_activity: BTreeMap<(Instant, EndpointId), ()>,
    dangling: VecDeque<EndpointId>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Accepts a new connection, placing it on the dangling list.
    pub fn accept(&mut self, now: Instant) -> EndpointId {
        let id = EndpointId(self.next_id);
        self.next_id += 1;
        self.endpoints.insert(id, Endpoint::new(id, now));
        self.dangling.push_back(id);
        id
    }

    pub fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    pub fn get_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(&id)
    }

    /// Moves an authenticated endpoint from the dangling list into the main
    /// map, rejecting a name collision (spec §4.D "Name collisions are
    /// rejected at authentication").
    pub fn promote(&mut self, id: EndpointId, name: EndpointName) -> Result<()> {
        if self.by_name.contains_key(&name) {
            return Err(ServerError::Protocol(crate::error::RetCode::Conflict));
        }
        self.dangling.retain(|d| *d != id);
        let endpoint = self
            .endpoints
            .get_mut(&id)
            .ok_or(ServerError::Protocol(crate::error::RetCode::NotFound))?;
        self.by_activity.insert((endpoint.last_activity, id), ());
        endpoint.name = Some(name.clone());
        self.by_name.insert(name, id);
        Ok(())
    }

    /// Bumps an endpoint's activity timestamp, re-ordering the
    /// activity-indexed view.
    pub fn touch(&mut self, id: EndpointId, now: Instant) {
        if let Some(endpoint) = self.endpoints.get_mut(&id) {
            if endpoint.name.is_some() {
                self.by_activity.remove(&(endpoint.last_activity, id));
                self.by_activity.insert((now, id), ());
            }
            endpoint.touch(now);
        }
    }

    /// Removes an endpoint entirely. Callers must have already run session
    /// teardown (spec §4.D "Removal... runs session teardown before
    /// freeing the endpoint record").
    pub fn remove(&mut self, id: EndpointId) -> Option<Endpoint> {
        self.dangling.retain(|d| *d != id);
        let endpoint = self.endpoints.remove(&id)?;
        if let Some(name) = &endpoint.name {
            self.by_name.remove(name);
            self.by_activity.remove(&(endpoint.last_activity, id));
        }
        Some(endpoint)
    }

    pub fn find_by_name(&self, name: &EndpointName) -> Option<EndpointId> {
        self.by_name.get(name).copied()
    }

    /// Finds the ready endpoint whose session has a pending-response slot
    /// installed under `request_id`, used to correlate a `page-ready` reply
    /// back to the endpoint that sent the original request (spec §4.H step
    /// 4).
    pub fn find_pending(&self, request_id: &str) -> Option<EndpointId> {
        self.endpoints.iter().find_map(|(id, endpoint)| {
            endpoint
                .session
                .as_ref()
                .filter(|s| s.pending.contains_key(request_id))
                .map(|_| *id)
        })
    }

    /// Finds the ready endpoint whose session owns `handle` as a live
    /// handle, used to route an unsolicited subprocess event back to the
    /// session that registered the view (spec §4.H last paragraph).
    pub fn find_session_with_handle(&self, handle: HandleId) -> Option<EndpointId> {
        self.endpoints.iter().find_map(|(id, endpoint)| {
            endpoint
                .session
                .as_ref()
                .filter(|s| s.handles.is_live(handle))
                .map(|_| *id)
        })
    }

    /// Dangling endpoints older than `max_no_responding` (spec §4.B idle
    /// handler, 5-second sweep).
    pub fn expired_dangling(&self, now: Instant, max_no_responding: std::time::Duration) -> Vec<EndpointId> {
        self.dangling
            .iter()
            .copied()
            .filter(|id| {
                self.endpoints
                    .get(id)
                    .map(|e| now.duration_since(e.created_at) > max_no_responding)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Ready endpoints whose last activity exceeds `max_no_responding`
    /// (close) or `max_ping_time` (ping), in activity order, oldest first
    /// (spec §4.B idle handler, 10-second sweep).
    pub fn stale_ready(
        &self,
        now: Instant,
        max_ping_time: std::time::Duration,
        max_no_responding: std::time::Duration,
    ) -> (Vec<EndpointId>, Vec<EndpointId>) {
        let mut to_close = Vec::new();
        let mut to_ping = Vec::new();
        for (activity, id) in self.by_activity.keys() {
            let idle = now.duration_since(*activity);
            if idle > max_no_responding {
                to_close.push(*id);
            } else if idle > max_ping_time {
                to_ping.push(*id);
            } else {
                break;
            }
        }
        (to_close, to_ping)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn name(app: &str) -> EndpointName {
        EndpointName {
            host: "localhost".into(),
            app: app.into(),
            runner: "main".into(),
        }
    }

    #[test]
    fn promote_rejects_duplicate_name() {
        let mut reg = Registry::new();
        let now = Instant::now();
        let a = reg.accept(now);
        let b = reg.accept(now);
        reg.promote(a, name("com.example")).unwrap();
        assert!(reg.promote(b, name("com.example")).is_err());
    }

    #[test]
    fn dangling_endpoint_expires_after_timeout() {
        let mut reg = Registry::new();
        let now = Instant::now();
        let id = reg.accept(now);
        assert!(reg.expired_dangling(now, Duration::from_secs(10)).is_empty());
        let later = now + Duration::from_secs(20);
        assert_eq!(reg.expired_dangling(later, Duration::from_secs(10)), vec![id]);
    }

    #[test]
    fn remove_clears_both_views() {
        let mut reg = Registry::new();
        let now = Instant::now();
        let a = reg.accept(now);
        reg.promote(a, name("com.example")).unwrap();
        reg.remove(a);
        assert!(reg.find_by_name(&name("com.example")).is_none());
        assert!(reg.get(a).is_none());
    }
}
