//! Trait objects for the external collaborators spec §1 excludes from this
//! crate's scope: the GUI toolkit, the page-group layout engine, the
//! rendering subprocess channel, and the confirmation-dialog UI. Grounded
//! in the teacher's own pattern of keeping Chrome's actual process
//! launch/control behind `BrowserConfig`/`default_executable()` seams
//! rather than inlining it into the handler.

use async_trait::async_trait;
use purcmc_types::HandleId;

use crate::error::Result;
use crate::model::page::PageName;

/// Everything the server needs from the host toolkit to realize plain
/// windows and widgets. A real renderer implements this against its GUI
/// toolkit; tests implement it in-memory.
#[async_trait]
pub trait WidgetBackend: Send {
    /// Creates a plain window, returning its container and web-view
    /// handles. Called once `createPlainWindow` has resolved the page name
    /// and confirmed no existing page owns that `(name, group)` key.
    async fn create_plain_window(&mut self, name: &str, group: Option<&str>) -> Result<(HandleId, HandleId)>;

    async fn create_widget(&mut self, name: &str, group: Option<&str>) -> Result<(HandleId, HandleId)>;

    async fn destroy_container(&mut self, container: HandleId) -> Result<()>;

    /// Resolves `_first`/`_last`/`_active` within a page group by scanning
    /// creation time or focus state, per spec §4.G.
    async fn resolve_reserved(&self, name: &PageName, group: Option<&str>) -> Result<Option<HandleId>>;
}

/// The page-group layout engine instantiated by `setPageGroups`.
pub trait Layouter: Send {
    fn from_html(body: &str) -> Result<Self>
    where
        Self: Sized;

    fn add_groups(&mut self, body: &str) -> Result<()>;

    fn remove_group(&mut self, name: &str) -> Result<()>;
}

/// The private per-page messaging primitive to the rendering subprocess
/// (spec §4.H). `send` is fire-and-forget; replies arrive later on the
/// server's own reply channel, not through this trait.
#[async_trait]
pub trait RenderChannel: Send {
    async fn send(&mut self, view: HandleId, envelope: serde_json::Value) -> Result<()>;
}

/// One focus-change notification from the host toolkit: `container` gained
/// or lost focus, promoted to `pageActivated`/`pageDeactivated` for whichever
/// session currently owns the top of its owner stack (spec §4.I).
#[derive(Debug, Clone, Copy)]
pub struct FocusChange {
    pub container: HandleId,
    pub activated: bool,
}

/// Out-of-scope UI asked to accept/reject a `duplicate:true` handshake
/// (spec §4.E step 5). Grounded in the teacher's
/// `initiator: Option<oneshot::Sender<...>>` pattern: the dialog resolves a
/// stored channel rather than being polled.
#[async_trait]
pub trait ConfirmationDialog: Send {
    async fn confirm(&mut self, endpoint_name: &str, timeout_seconds: u32) -> bool;
}

/// A no-op backend used by tests and as a safe default when no real
/// toolkit is wired up; every call reports `NotImplemented`.
pub struct NullBackend;

#[async_trait]
impl WidgetBackend for NullBackend {
    async fn create_plain_window(&mut self, _name: &str, _group: Option<&str>) -> Result<(HandleId, HandleId)> {
        Err(crate::error::ServerError::Protocol(crate::error::RetCode::NotImplemented))
    }

    async fn create_widget(&mut self, _name: &str, _group: Option<&str>) -> Result<(HandleId, HandleId)> {
        Err(crate::error::ServerError::Protocol(crate::error::RetCode::NotImplemented))
    }

    async fn destroy_container(&mut self, _container: HandleId) -> Result<()> {
        Err(crate::error::ServerError::Protocol(crate::error::RetCode::NotImplemented))
    }

    async fn resolve_reserved(&self, _name: &PageName, _group: Option<&str>) -> Result<Option<HandleId>> {
        Ok(None)
    }
}

/// A [`RenderChannel`] that accepts and discards every envelope. Useful as a
/// placeholder until a real rendering subprocess is wired up, and in tests
/// that don't care what reaches the DOM pipeline.
pub struct NullRenderChannel;

#[async_trait]
impl RenderChannel for NullRenderChannel {
    async fn send(&mut self, _view: HandleId, _envelope: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

