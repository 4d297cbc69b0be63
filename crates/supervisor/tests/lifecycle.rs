//! Lifecycle integration: creation ordering, destruction cascades, popup
//! insertion and navigation mirroring over the stub engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::timeout;

use magi_core_types::{BrowserId, PageId};
use magi_event_bus::{EventBus, FleetBus, FleetEvent};
use magi_fleet_store::{BrowserSpec, FleetStore};
use magi_supervisor::{CreatePageOptions, SurfaceSupervisor};
use magi_surface::{
    DebuggerBinding, DebuggerEvent, PageDirectory, PageEvent, PageHandle, PageOptions, PageState,
    PartitionHandle, StubSurface, Surface, SurfaceError, SurfaceResult,
};

struct Harness {
    surface: Arc<StubSurface>,
    store: Arc<FleetStore>,
    bus: Arc<FleetBus>,
    directory: Arc<PageDirectory>,
    supervisor: Arc<SurfaceSupervisor>,
}

fn harness() -> Harness {
    let surface = StubSurface::new();
    let store = Arc::new(FleetStore::new());
    let bus = FleetBus::new(64);
    let directory = Arc::new(PageDirectory::new());
    let supervisor = SurfaceSupervisor::new(
        surface.clone() as Arc<dyn Surface>,
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&directory),
    );
    Harness {
        surface,
        store,
        bus,
        directory,
        supervisor,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<FleetEvent>) -> FleetEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within deadline")
        .expect("bus open")
}

#[tokio::test]
async fn browser_creation_produces_an_active_initial_page() {
    let h = harness();
    let mut rx = h.bus.subscribe();

    let record = h
        .supervisor
        .create_browser(BrowserSpec {
            name: "main".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(record.pages.len(), 1);
    let initial = record.pages[0].clone();
    assert_eq!(record.active_page, Some(initial.clone()));
    assert!(h.directory.contains(&initial));

    // Record and endpoint registration precede the creation event.
    assert!(matches!(next_event(&mut rx).await, FleetEvent::BrowserCreated { .. }));
    match next_event(&mut rx).await {
        FleetEvent::PageCreated { page, .. } => assert_eq!(page, initial),
        other => panic!("expected PageCreated, got {other:?}"),
    }
}

#[tokio::test]
async fn destroy_browser_cascades_page_destruction_in_list_order() {
    let h = harness();
    let record = h
        .supervisor
        .create_browser(BrowserSpec::default())
        .await
        .unwrap();
    let browser = record.id.clone();
    let p1 = record.pages[0].clone();
    let p2 = h
        .supervisor
        .create_page(CreatePageOptions {
            browser: browser.clone(),
            ..Default::default()
        })
        .await
        .unwrap()
        .id;
    let p3 = h
        .supervisor
        .create_page(CreatePageOptions {
            browser: browser.clone(),
            ..Default::default()
        })
        .await
        .unwrap()
        .id;

    let mut rx = h.bus.subscribe();
    h.supervisor.destroy_browser(&browser).await.unwrap();

    let mut destroyed = Vec::new();
    loop {
        match next_event(&mut rx).await {
            FleetEvent::PageDestroyed { page, .. } => destroyed.push(page),
            FleetEvent::BrowserDestroyed { browser: b } => {
                assert_eq!(b, browser);
                break;
            }
            // Late mirror events (navigation churn) may still be in flight.
            _ => {}
        }
    }
    assert_eq!(destroyed, vec![p1, p2, p3]);
    assert!(h.store.get_browser(&browser).is_none());
    assert_eq!(h.directory.len(), 0);
}

#[tokio::test]
async fn closing_the_active_page_emits_destruction_then_activation() {
    let h = harness();
    let record = h
        .supervisor
        .create_browser(BrowserSpec::default())
        .await
        .unwrap();
    let browser = record.id.clone();
    let p1 = record.pages[0].clone();
    let p2 = h
        .supervisor
        .create_page(CreatePageOptions {
            browser: browser.clone(),
            activate: true,
            ..Default::default()
        })
        .await
        .unwrap()
        .id;

    let mut rx = h.bus.subscribe();
    h.supervisor.close_page(&browser, &p2).await.unwrap();

    loop {
        match next_event(&mut rx).await {
            FleetEvent::PageDestroyed { page, .. } => {
                assert_eq!(page, p2);
                break;
            }
            _ => {}
        }
    }
    match next_event(&mut rx).await {
        FleetEvent::PageActivated { page, .. } => assert_eq!(page, Some(p1.clone())),
        other => panic!("expected PageActivated, got {other:?}"),
    }
    assert_eq!(h.store.get_browser(&browser).unwrap().active_page, Some(p1));
}

#[tokio::test]
async fn window_open_inserts_after_parent_and_activates() {
    let h = harness();
    let record = h
        .supervisor
        .create_browser(BrowserSpec::default())
        .await
        .unwrap();
    let browser = record.id.clone();
    let parent = record.pages[0].clone();
    let trailing = h
        .supervisor
        .create_page(CreatePageOptions {
            browser: browser.clone(),
            ..Default::default()
        })
        .await
        .unwrap()
        .id;

    let popup = h
        .supervisor
        .window_open(&parent, "https://pop.example")
        .await
        .unwrap()
        .id;

    let pages = h.store.get_browser(&browser).unwrap().pages;
    assert_eq!(pages, vec![parent, popup.clone(), trailing]);
    assert_eq!(h.store.get_browser(&browser).unwrap().active_page, Some(popup));
}

#[tokio::test]
async fn surface_popup_callback_drives_window_open() {
    let h = harness();
    let record = h
        .supervisor
        .create_browser(BrowserSpec::default())
        .await
        .unwrap();
    let browser = record.id.clone();
    let parent = record.pages[0].clone();
    let handle = h.directory.get(&parent).unwrap();

    h.surface.request_popup(&handle, "https://pop.example").unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            if h.store.get_browser(&browser).unwrap().pages.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("popup page appears");

    let pages = h.store.get_browser(&browser).unwrap().pages;
    assert_eq!(pages[0], parent);
    let popup = h.store.get_page(&pages[1]).unwrap();
    assert_eq!(popup.url, "https://pop.example");
}

#[tokio::test]
async fn navigation_and_title_changes_are_mirrored_into_the_store() {
    let h = harness();
    let record = h
        .supervisor
        .create_browser(BrowserSpec::default())
        .await
        .unwrap();
    let page = record.pages[0].clone();
    let handle = h.directory.get(&page).unwrap();

    h.supervisor
        .navigate_page(&page, "https://example.com")
        .await
        .unwrap();
    h.surface.set_title(&handle, "Example Domain").unwrap();
    h.surface
        .set_favicon(&handle, Some("https://example.com/favicon.ico"))
        .unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            let mirrored = h.store.get_page(&page).unwrap();
            if mirrored.url == "https://example.com"
                && mirrored.title == "Example Domain"
                && mirrored.favicon.as_deref() == Some("https://example.com/favicon.ico")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("store mirror catches up");
}

#[tokio::test]
async fn surface_initiated_close_removes_the_record() {
    let h = harness();
    let record = h
        .supervisor
        .create_browser(BrowserSpec::default())
        .await
        .unwrap();
    let browser = record.id.clone();
    let page = record.pages[0].clone();
    let handle = h.directory.get(&page).unwrap();

    h.surface.close_page(&handle).await.unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            if h.store.get_page(&page).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("record removed after engine-side close");
    assert!(h.store.get_browser(&browser).unwrap().pages.is_empty());
}

/// Surface whose page creation always fails; partition creation succeeds so
/// the browser-level rollback path is not hit.
struct PagelessSurface;

#[async_trait]
impl Surface for PagelessSurface {
    async fn new_partition(&self, key: &str) -> SurfaceResult<PartitionHandle> {
        Ok(PartitionHandle(key.to_string()))
    }
    async fn new_page(
        &self,
        _partition: &PartitionHandle,
        _opts: PageOptions,
    ) -> SurfaceResult<PageHandle> {
        Err(SurfaceError::Engine("page pool exhausted".into()))
    }
    async fn attach_view(&self, _page: &PageHandle) -> SurfaceResult<()> {
        Ok(())
    }
    async fn detach_view(&self, _page: &PageHandle) -> SurfaceResult<()> {
        Ok(())
    }
    async fn navigate(&self, _page: &PageHandle, _url: &str) -> SurfaceResult<()> {
        Ok(())
    }
    async fn reload(&self, _page: &PageHandle) -> SurfaceResult<()> {
        Ok(())
    }
    async fn go_back(&self, _page: &PageHandle) -> SurfaceResult<()> {
        Ok(())
    }
    async fn go_forward(&self, _page: &PageHandle) -> SurfaceResult<()> {
        Ok(())
    }
    async fn close_page(&self, _page: &PageHandle) -> SurfaceResult<()> {
        Ok(())
    }
    async fn attach_debugger(&self, page: &PageHandle) -> SurfaceResult<DebuggerBinding> {
        Err(SurfaceError::PageGone(page.0.clone()))
    }
    async fn detach_debugger(&self, _binding: &DebuggerBinding) -> SurfaceResult<()> {
        Ok(())
    }
    async fn send_debugger_command(
        &self,
        _binding: &DebuggerBinding,
        _method: &str,
        _params: Value,
    ) -> SurfaceResult<Value> {
        Err(SurfaceError::Command("no debugger".into()))
    }
    fn subscribe_debugger_events(
        &self,
        binding: &DebuggerBinding,
    ) -> SurfaceResult<broadcast::Receiver<DebuggerEvent>> {
        Err(SurfaceError::BindingGone(binding.token.clone()))
    }
    fn page_state(&self, _page: &PageHandle) -> SurfaceResult<PageState> {
        Ok(PageState::default())
    }
    fn page_events(&self, page: &PageHandle) -> SurfaceResult<broadcast::Receiver<PageEvent>> {
        Err(SurfaceError::PageGone(page.0.clone()))
    }
}

#[tokio::test]
async fn failed_page_creation_rolls_the_record_back() {
    let store = Arc::new(FleetStore::new());
    let bus = FleetBus::new(16);
    let directory = Arc::new(PageDirectory::new());
    let supervisor = SurfaceSupervisor::new(
        Arc::new(PagelessSurface),
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&directory),
    );

    // The browser itself comes up; its initial page fails and rolls back.
    let record = supervisor.create_browser(BrowserSpec::default()).await.unwrap();
    assert!(record.pages.is_empty());

    let err = supervisor
        .create_page(CreatePageOptions {
            browser: record.id.clone(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("page pool exhausted"));
    assert!(store.get_browser(&record.id).unwrap().pages.is_empty());
    assert_eq!(directory.len(), 0);
}

#[tokio::test]
async fn unknown_browser_is_reported_as_target_not_found() {
    let h = harness();
    let err = h
        .supervisor
        .create_page(CreatePageOptions {
            browser: BrowserId::new(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Target not found"));

    let ghost = PageId::new();
    assert!(h.supervisor.navigate_page(&ghost, "https://x").await.is_err());
}
