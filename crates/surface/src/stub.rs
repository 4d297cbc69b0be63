//! In-memory engine. Pages are plain records; navigation succeeds instantly
//! unless a test puts the page into manual-load mode, and the debugger
//! answers every command with an empty result while mirroring the load
//! lifecycle as `Page.*` events.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::{
    DebuggerBinding, DebuggerEvent, PageEvent, PageHandle, PageOptions, PageState, PartitionHandle,
    Surface, SurfaceError, SurfaceResult,
};

const EVENT_CAPACITY: usize = 256;

struct StubDebugger {
    token: String,
    events: broadcast::Sender<DebuggerEvent>,
}

struct StubPage {
    partition: PartitionHandle,
    state: RwLock<PageState>,
    history: RwLock<Vec<String>>,
    history_idx: RwLock<usize>,
    events: broadcast::Sender<PageEvent>,
    debugger: Mutex<Option<StubDebugger>>,
    /// When set, navigations stay in the loading state until
    /// `complete_load` is called.
    manual_load: RwLock<bool>,
    view_attached: RwLock<bool>,
}

impl StubPage {
    fn new(partition: PartitionHandle) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            partition,
            state: RwLock::new(PageState::default()),
            history: RwLock::new(Vec::new()),
            history_idx: RwLock::new(0),
            events,
            debugger: Mutex::new(None),
            manual_load: RwLock::new(false),
            view_attached: RwLock::new(false),
        }
    }

    fn emit(&self, event: PageEvent) {
        let _ = self.events.send(event);
    }

    fn emit_debugger(&self, method: &str, params: Value) {
        if let Some(debugger) = self.debugger.lock().as_ref() {
            let _ = debugger.events.send(DebuggerEvent {
                method: method.to_string(),
                params,
            });
        }
    }

    fn begin_load(&self, url: &str) {
        {
            let mut state = self.state.write();
            state.url = url.to_string();
            state.loading = true;
        }
        self.emit(PageEvent::LoadStarted);
        self.emit(PageEvent::Navigated {
            url: url.to_string(),
        });
        self.emit_debugger("Page.frameStartedLoading", json!({ "frameId": "main" }));
    }

    fn finish_load(&self, ok: bool) {
        {
            let mut state = self.state.write();
            state.loading = false;
            let history = self.history.read();
            let idx = *self.history_idx.read();
            state.can_go_back = idx > 0;
            state.can_go_forward = idx + 1 < history.len();
        }
        if ok {
            self.emit_debugger("Page.loadEventFired", json!({ "timestamp": 0.0 }));
        }
        self.emit(PageEvent::LoadFinished { ok });
    }
}

/// In-memory `Surface` implementation.
#[derive(Default)]
pub struct StubSurface {
    pages: DashMap<PageHandle, Arc<StubPage>>,
}

impl StubSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn page(&self, handle: &PageHandle) -> SurfaceResult<Arc<StubPage>> {
        self.pages
            .get(handle)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SurfaceError::PageGone(handle.0.clone()))
    }

    /// Puts a page into manual-load mode so tests can observe the loading
    /// window of the attach-readiness gate.
    pub fn set_manual_load(&self, page: &PageHandle, manual: bool) -> SurfaceResult<()> {
        let page = self.page(page)?;
        *page.manual_load.write() = manual;
        Ok(())
    }

    /// Completes a manual-mode load.
    pub fn complete_load(&self, page: &PageHandle, ok: bool) -> SurfaceResult<()> {
        let page = self.page(page)?;
        page.finish_load(ok);
        Ok(())
    }

    /// Simulates an in-page `window.open`.
    pub fn request_popup(&self, page: &PageHandle, url: &str) -> SurfaceResult<()> {
        let page = self.page(page)?;
        page.emit(PageEvent::PopupRequested {
            url: url.to_string(),
        });
        Ok(())
    }

    /// Updates the title as a renderer would; emits the matching event.
    pub fn set_title(&self, page: &PageHandle, title: &str) -> SurfaceResult<()> {
        let page = self.page(page)?;
        page.state.write().title = title.to_string();
        page.emit(PageEvent::TitleChanged {
            title: title.to_string(),
        });
        Ok(())
    }

    /// Updates the favicon as a renderer would; emits the matching event.
    pub fn set_favicon(&self, page: &PageHandle, favicon: Option<&str>) -> SurfaceResult<()> {
        let page = self.page(page)?;
        let favicon = favicon.map(str::to_string);
        page.state.write().favicon = favicon.clone();
        page.emit(PageEvent::FaviconChanged { favicon });
        Ok(())
    }

    fn navigate_inner(&self, page: &Arc<StubPage>, url: &str, push_history: bool) {
        if push_history {
            let mut history = page.history.write();
            let mut idx = page.history_idx.write();
            let len = history.len();
            history.truncate(idx.saturating_add(1).min(len));
            history.push(url.to_string());
            *idx = history.len() - 1;
        }
        page.begin_load(url);
        if !*page.manual_load.read() {
            page.finish_load(true);
        }
    }
}

#[async_trait]
impl Surface for StubSurface {
    async fn new_partition(&self, key: &str) -> SurfaceResult<PartitionHandle> {
        Ok(PartitionHandle(key.to_string()))
    }

    async fn new_page(
        &self,
        partition: &PartitionHandle,
        opts: PageOptions,
    ) -> SurfaceResult<PageHandle> {
        let handle = PageHandle::new();
        let page = Arc::new(StubPage::new(partition.clone()));
        if let Some(url) = &opts.initial_url {
            page.state.write().url = url.clone();
        }
        self.pages.insert(handle.clone(), page);
        debug!(target: "stub-surface", page = %handle.0, "page created");
        Ok(handle)
    }

    async fn attach_view(&self, page: &PageHandle) -> SurfaceResult<()> {
        *self.page(page)?.view_attached.write() = true;
        Ok(())
    }

    async fn detach_view(&self, page: &PageHandle) -> SurfaceResult<()> {
        *self.page(page)?.view_attached.write() = false;
        Ok(())
    }

    async fn navigate(&self, page: &PageHandle, url: &str) -> SurfaceResult<()> {
        let page = self.page(page)?;
        self.navigate_inner(&page, url, true);
        Ok(())
    }

    async fn reload(&self, page: &PageHandle) -> SurfaceResult<()> {
        let page = self.page(page)?;
        let url = page.state.read().url.clone();
        self.navigate_inner(&page, &url, false);
        Ok(())
    }

    async fn go_back(&self, page: &PageHandle) -> SurfaceResult<()> {
        let page = self.page(page)?;
        let url = {
            let history = page.history.read();
            let mut idx = page.history_idx.write();
            if *idx == 0 {
                return Ok(());
            }
            *idx -= 1;
            history[*idx].clone()
        };
        self.navigate_inner(&page, &url, false);
        Ok(())
    }

    async fn go_forward(&self, page: &PageHandle) -> SurfaceResult<()> {
        let page = self.page(page)?;
        let url = {
            let history = page.history.read();
            let mut idx = page.history_idx.write();
            if *idx + 1 >= history.len() {
                return Ok(());
            }
            *idx += 1;
            history[*idx].clone()
        };
        self.navigate_inner(&page, &url, false);
        Ok(())
    }

    async fn close_page(&self, page: &PageHandle) -> SurfaceResult<()> {
        if let Some((_, record)) = self.pages.remove(page) {
            record.emit(PageEvent::Closed);
        }
        Ok(())
    }

    async fn attach_debugger(&self, page: &PageHandle) -> SurfaceResult<DebuggerBinding> {
        let record = self.page(page)?;
        let mut slot = record.debugger.lock();
        if slot.is_some() {
            return Err(SurfaceError::AlreadyAttached);
        }
        let token = Uuid::new_v4().simple().to_string();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        *slot = Some(StubDebugger {
            token: token.clone(),
            events,
        });
        Ok(DebuggerBinding {
            page: page.clone(),
            token,
        })
    }

    async fn detach_debugger(&self, binding: &DebuggerBinding) -> SurfaceResult<()> {
        let record = self.page(&binding.page)?;
        let mut slot = record.debugger.lock();
        match slot.as_ref() {
            Some(debugger) if debugger.token == binding.token => {
                *slot = None;
                Ok(())
            }
            _ => Err(SurfaceError::BindingGone(binding.token.clone())),
        }
    }

    async fn send_debugger_command(
        &self,
        binding: &DebuggerBinding,
        method: &str,
        params: Value,
    ) -> SurfaceResult<Value> {
        let record = self.page(&binding.page)?;
        {
            let slot = record.debugger.lock();
            match slot.as_ref() {
                Some(debugger) if debugger.token == binding.token => {}
                _ => return Err(SurfaceError::BindingGone(binding.token.clone())),
            }
        }
        match method {
            "Page.navigate" => {
                let url = params
                    .get("url")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SurfaceError::Command("Page.navigate needs url".into()))?
                    .to_string();
                self.navigate_inner(&record, &url, true);
                Ok(json!({ "frameId": "main" }))
            }
            "Page.reload" => {
                let url = record.state.read().url.clone();
                self.navigate_inner(&record, &url, false);
                Ok(json!({}))
            }
            _ => Ok(json!({})),
        }
    }

    fn subscribe_debugger_events(
        &self,
        binding: &DebuggerBinding,
    ) -> SurfaceResult<broadcast::Receiver<DebuggerEvent>> {
        let record = self.page(&binding.page)?;
        let slot = record.debugger.lock();
        match slot.as_ref() {
            Some(debugger) if debugger.token == binding.token => Ok(debugger.events.subscribe()),
            _ => Err(SurfaceError::BindingGone(binding.token.clone())),
        }
    }

    fn page_state(&self, page: &PageHandle) -> SurfaceResult<PageState> {
        Ok(self.page(page)?.state.read().clone())
    }

    fn page_events(&self, page: &PageHandle) -> SurfaceResult<broadcast::Receiver<PageEvent>> {
        Ok(self.page(page)?.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_page(surface: &StubSurface) -> PageHandle {
        let partition = surface.new_partition("test").await.unwrap();
        surface
            .new_page(&partition, PageOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn debugger_channel_is_exclusive() {
        let surface = StubSurface::new();
        let page = new_page(&surface).await;

        let binding = surface.attach_debugger(&page).await.unwrap();
        assert!(matches!(
            surface.attach_debugger(&page).await,
            Err(SurfaceError::AlreadyAttached)
        ));

        surface.detach_debugger(&binding).await.unwrap();
        surface.attach_debugger(&page).await.unwrap();
    }

    #[tokio::test]
    async fn navigation_emits_load_lifecycle_in_order() {
        let surface = StubSurface::new();
        let page = new_page(&surface).await;
        let mut events = surface.page_events(&page).unwrap();

        surface.navigate(&page, "https://example.com").await.unwrap();

        assert!(matches!(events.recv().await, Ok(PageEvent::LoadStarted)));
        assert!(matches!(events.recv().await, Ok(PageEvent::Navigated { .. })));
        assert!(matches!(
            events.recv().await,
            Ok(PageEvent::LoadFinished { ok: true })
        ));
        assert_eq!(surface.page_state(&page).unwrap().url, "https://example.com");
    }

    #[tokio::test]
    async fn debugger_observes_reload_events() {
        let surface = StubSurface::new();
        let page = new_page(&surface).await;
        surface.navigate(&page, "https://example.com").await.unwrap();

        let binding = surface.attach_debugger(&page).await.unwrap();
        let mut events = surface.subscribe_debugger_events(&binding).unwrap();

        surface
            .send_debugger_command(&binding, "Page.reload", json!({}))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.method, "Page.frameStartedLoading");
        let second = events.recv().await.unwrap();
        assert_eq!(second.method, "Page.loadEventFired");
    }

    #[tokio::test]
    async fn history_moves_back_and_forward() {
        let surface = StubSurface::new();
        let page = new_page(&surface).await;
        surface.navigate(&page, "https://a.example").await.unwrap();
        surface.navigate(&page, "https://b.example").await.unwrap();

        assert!(surface.page_state(&page).unwrap().can_go_back);
        surface.go_back(&page).await.unwrap();
        assert_eq!(surface.page_state(&page).unwrap().url, "https://a.example");
        assert!(surface.page_state(&page).unwrap().can_go_forward);
        surface.go_forward(&page).await.unwrap();
        assert_eq!(surface.page_state(&page).unwrap().url, "https://b.example");
    }

    #[tokio::test]
    async fn manual_load_holds_until_completed() {
        let surface = StubSurface::new();
        let page = new_page(&surface).await;
        surface.set_manual_load(&page, true).unwrap();

        surface.navigate(&page, "https://slow.example").await.unwrap();
        assert!(surface.page_state(&page).unwrap().loading);

        surface.complete_load(&page, false).unwrap();
        assert!(!surface.page_state(&page).unwrap().loading);
    }

    #[tokio::test]
    async fn popup_request_reaches_subscribers() {
        let surface = StubSurface::new();
        let page = new_page(&surface).await;
        let mut events = surface.page_events(&page).unwrap();

        surface.request_popup(&page, "https://pop.example").unwrap();
        assert!(matches!(
            events.recv().await,
            Ok(PageEvent::PopupRequested { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_commands_ack_with_empty_result() {
        let surface = StubSurface::new();
        let page = new_page(&surface).await;
        let binding = surface.attach_debugger(&page).await.unwrap();

        let result = surface
            .send_debugger_command(&binding, "Network.enable", json!({}))
            .await
            .unwrap();
        assert_eq!(result, json!({}));
    }
}
