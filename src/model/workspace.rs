//! `Workspace` and `PageOwnerStack` (spec §4.G).
//!
//! A workspace is shared by every endpoint belonging to the same
//! `(host, app)` pair (spec §5 "Shared resources"); its `page_owners` map
//! is the authoritative catalog of live pages and is only ever touched
//! from the single event loop, so no locking is needed.

use std::collections::HashMap;

use purcmc_types::HandleId;

use crate::endpoint::EndpointId;
use crate::model::page::Page;

/// One (session, coroutine) pair owning a page, per spec §4.G.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub session: EndpointId,
    pub coroutine: HandleId,
}

/// A strict LIFO stack of owners for one page id.
#[derive(Debug, Default)]
pub struct PageOwnerStack {
    stack: Vec<Owner>,
}

impl PageOwnerStack {
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    /// Pushes a new owner. If the stack was non-empty, the prior top is
    /// returned as *suppressed*.
    pub fn register(&mut self, owner: Owner) -> Option<Owner> {
        let suppressed = self.stack.last().copied();
        self.stack.push(owner);
        suppressed
    }

    /// Removes the matching `(session, coroutine)` pair wherever it sits in
    /// the stack. If it was on top, the new top is returned as *to_reload*.
    pub fn revoke(&mut self, owner: Owner) -> Option<Owner> {
        let Some(pos) = self.stack.iter().position(|o| *o == owner) else {
            return None;
        };
        let was_top = pos + 1 == self.stack.len();
        self.stack.remove(pos);
        if was_top {
            self.stack.last().copied()
        } else {
            None
        }
    }

    /// Removes every owner belonging to `session`. If the top changed, the
    /// new top is returned as *to_reload*.
    pub fn revoke_session(&mut self, session: EndpointId) -> Option<Owner> {
        let old_top = self.stack.last().copied();
        self.stack.retain(|o| o.session != session);
        let new_top = self.stack.last().copied();
        if old_top != new_top {
            new_top
        } else {
            None
        }
    }

    pub fn top(&self) -> Option<Owner> {
        self.stack.last().copied()
    }

    pub fn owners(&self) -> impl Iterator<Item = &Owner> {
        self.stack.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// One `(host, app)` workspace: its pages, their owner stacks, and
/// (optionally) a page-group layouter.
#[derive(Default)]
pub struct Workspace {
    pub pages: HashMap<HandleId, Page>,
    pub page_owners: HashMap<HandleId, PageOwnerStack>,
    /// Maps a page's `(name, group)` id to its container handle, so
    /// `createPlainWindow`/`createWidget` can detect an existing page by
    /// name instead of scanning `pages` (spec §3/§4.G "duplicate with same
    /// (name, group) returns the existing page").
    page_ids: HashMap<(String, Option<String>), HandleId>,
    /// `true` once `setPageGroups` has run; a second call is a `Conflict`.
    pub layouter_installed: bool,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owners_for(&mut self, page: HandleId) -> &mut PageOwnerStack {
        self.page_owners.entry(page).or_insert_with(PageOwnerStack::new)
    }

    /// Looks up a live page by its `(name, group)` id.
    pub fn find_page(&self, name: &str, group: Option<&str>) -> Option<Page> {
        let container = self.page_ids.get(&(name.to_string(), group.map(str::to_string)))?;
        self.pages.get(container).cloned()
    }

    /// Catalogs a newly created page under both its container handle and its
    /// `(name, group)` id.
    pub fn insert_page(&mut self, page: Page) {
        let key = (page.name().to_string(), page.group().map(str::to_string));
        self.page_ids.insert(key, page.container());
        self.pages.insert(page.container(), page);
    }

    /// Tears down a destroyed page's owner stack and catalog entry (spec
    /// §4.G destruction cascade).
    pub fn destroy_page(&mut self, page: HandleId) {
        if let Some(page) = self.pages.remove(&page) {
            self.page_ids.remove(&(page.name().to_string(), page.group().map(str::to_string)));
        }
        self.page_owners.remove(&page);
    }

    /// Revokes every ownership claim `session` holds across this
    /// workspace's pages, returning `(container, new_top)` for every stack
    /// whose top changed (spec §4.G "closing an endpoint that owns the top
    /// of K page-owner stacks causes exactly K reload events").
    pub fn revoke_all(&mut self, session: EndpointId) -> Vec<(HandleId, Owner)> {
        self.page_owners
            .iter_mut()
            .filter_map(|(&container, stack)| stack.revoke_session(session).map(|new_top| (container, new_top)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(session: u64, coroutine: u64) -> Owner {
        Owner {
            session: EndpointId(session),
            coroutine: HandleId(coroutine),
        }
    }

    #[test]
    fn register_suppresses_the_prior_top() {
        let mut s = PageOwnerStack::new();
        assert_eq!(s.register(owner(1, 1)), None);
        assert_eq!(s.register(owner(2, 2)), Some(owner(1, 1)));
    }

    #[test]
    fn revoke_of_top_reveals_new_top() {
        let mut s = PageOwnerStack::new();
        s.register(owner(1, 1));
        s.register(owner(2, 2));
        assert_eq!(s.revoke(owner(2, 2)), Some(owner(1, 1)));
    }

    #[test]
    fn revoke_of_non_top_does_not_reload() {
        let mut s = PageOwnerStack::new();
        s.register(owner(1, 1));
        s.register(owner(2, 2));
        assert_eq!(s.revoke(owner(1, 1)), None);
        assert_eq!(s.top(), Some(owner(2, 2)));
    }

    #[test]
    fn revoke_session_removes_all_its_owners() {
        let mut s = PageOwnerStack::new();
        s.register(owner(1, 1));
        s.register(owner(1, 2));
        s.register(owner(2, 3));
        let reload = s.revoke_session(EndpointId(1));
        assert_eq!(reload, None);
        assert_eq!(s.top(), Some(owner(2, 3)));

        let mut s2 = PageOwnerStack::new();
        s2.register(owner(1, 1));
        s2.register(owner(2, 2));
        assert_eq!(s2.revoke_session(EndpointId(2)), Some(owner(1, 1)));
    }
}
