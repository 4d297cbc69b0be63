//! Abstract contract over the embedded browser engine. The gateway core only
//! ever talks to a `Surface`; the concrete engine lives outside this
//! repository. `StubSurface` is an in-memory implementation used by the test
//! suite and by deployments without a real engine wired in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

mod directory;
mod stub;

pub use directory::PageDirectory;
pub use stub::StubSurface;

/// Opaque isolation namespace for storage.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PartitionHandle(pub String);

/// Engine-side page handle.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PageHandle(pub String);

impl PageHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl Default for PageHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// The single concrete debugger attachment for one page.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DebuggerBinding {
    pub page: PageHandle,
    pub token: String,
}

#[derive(Clone, Debug, Default)]
pub struct PageOptions {
    pub initial_url: Option<String>,
    pub user_agent: Option<String>,
}

/// Polled page state mirror.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub favicon: Option<String>,
    pub loading: bool,
    pub can_go_back: bool,
    pub can_go_forward: bool,
}

/// Navigation/title/favicon/load stream for one page.
#[derive(Clone, Debug)]
pub enum PageEvent {
    Navigated { url: String },
    TitleChanged { title: String },
    FaviconChanged { favicon: Option<String> },
    LoadStarted,
    LoadFinished { ok: bool },
    /// An in-page `window.open`-equivalent asked the host for a new page.
    PopupRequested { url: String },
    Closed,
}

/// One debugger notification in engine-emitted order.
#[derive(Clone, Debug)]
pub struct DebuggerEvent {
    pub method: String,
    pub params: Value,
}

#[derive(Clone, Debug, Error)]
pub enum SurfaceError {
    #[error("debugger already attached")]
    AlreadyAttached,
    #[error("no such page: {0}")]
    PageGone(String),
    #[error("no such binding: {0}")]
    BindingGone(String),
    #[error("{0}")]
    Command(String),
    #[error("engine failure: {0}")]
    Engine(String),
}

pub type SurfaceResult<T> = Result<T, SurfaceError>;

/// Narrow interface the core consumes. Implementations must deliver events on
/// a binding in engine-emitted order between `attach_debugger` and
/// `detach_debugger`.
#[async_trait]
pub trait Surface: Send + Sync {
    async fn new_partition(&self, key: &str) -> SurfaceResult<PartitionHandle>;
    async fn new_page(
        &self,
        partition: &PartitionHandle,
        opts: PageOptions,
    ) -> SurfaceResult<PageHandle>;

    /// Host-window view attachment; display only.
    async fn attach_view(&self, page: &PageHandle) -> SurfaceResult<()>;
    async fn detach_view(&self, page: &PageHandle) -> SurfaceResult<()>;

    async fn navigate(&self, page: &PageHandle, url: &str) -> SurfaceResult<()>;
    async fn reload(&self, page: &PageHandle) -> SurfaceResult<()>;
    async fn go_back(&self, page: &PageHandle) -> SurfaceResult<()>;
    async fn go_forward(&self, page: &PageHandle) -> SurfaceResult<()>;
    async fn close_page(&self, page: &PageHandle) -> SurfaceResult<()>;

    /// Acquires the single debugger channel; `AlreadyAttached` when busy.
    async fn attach_debugger(&self, page: &PageHandle) -> SurfaceResult<DebuggerBinding>;
    async fn detach_debugger(&self, binding: &DebuggerBinding) -> SurfaceResult<()>;
    async fn send_debugger_command(
        &self,
        binding: &DebuggerBinding,
        method: &str,
        params: Value,
    ) -> SurfaceResult<Value>;
    fn subscribe_debugger_events(
        &self,
        binding: &DebuggerBinding,
    ) -> SurfaceResult<broadcast::Receiver<DebuggerEvent>>;

    fn page_state(&self, page: &PageHandle) -> SurfaceResult<PageState>;
    fn page_events(&self, page: &PageHandle) -> SurfaceResult<broadcast::Receiver<PageEvent>>;
}
