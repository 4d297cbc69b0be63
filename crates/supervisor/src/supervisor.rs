use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use magi_core_types::{BrowserId, GatewayError, GatewayResult, PageId};
use magi_event_bus::{EventBus, FleetBus, FleetEvent};
use magi_fleet_store::{BrowserRecord, BrowserSpec, FleetStore, PageInit, PageRecord};
use magi_surface::{
    PageDirectory, PageEvent, PageHandle, PageOptions, PartitionHandle, Surface,
};

pub const DEFAULT_HOME_URL: &str = "about:blank";

#[derive(Clone, Debug, Default)]
pub struct CreatePageOptions {
    pub browser: BrowserId,
    pub url: Option<String>,
    pub activate: bool,
    pub after: Option<PageId>,
}

struct PageTask {
    handle: PageHandle,
    mirror: JoinHandle<()>,
}

/// Owns the concrete browser/page surfaces. Lifecycle requests become
/// surface operations plus fleet mutations, in a fixed order so every
/// observer sees consistent state: the record and endpoint registration are
/// visible before the creation event goes out, and navigation starts only
/// after the view is attached.
#[derive(Clone)]
pub struct SurfaceSupervisor {
    surface: Arc<dyn Surface>,
    store: Arc<FleetStore>,
    bus: Arc<FleetBus>,
    directory: Arc<PageDirectory>,
    partitions: Arc<DashMap<BrowserId, PartitionHandle>>,
    pages: Arc<DashMap<PageId, PageTask>>,
    home_url: Arc<str>,
    shutdown: CancellationToken,
}

impl SurfaceSupervisor {
    pub fn new(
        surface: Arc<dyn Surface>,
        store: Arc<FleetStore>,
        bus: Arc<FleetBus>,
        directory: Arc<PageDirectory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            surface,
            store,
            bus,
            directory,
            partitions: Arc::new(DashMap::new()),
            pages: Arc::new(DashMap::new()),
            home_url: Arc::from(DEFAULT_HOME_URL),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Creates an isolated browser with its initial "new tab" page.
    pub async fn create_browser(&self, spec: BrowserSpec) -> GatewayResult<BrowserRecord> {
        let record = self.store.create_browser(spec);
        let partition = match self.surface.new_partition(&record.partition_key).await {
            Ok(partition) => partition,
            Err(err) => {
                // Roll the tentative record back before surfacing the error.
                self.store.delete_browser(&record.id);
                return Err(GatewayError::SurfaceUnavailable(err.to_string()));
            }
        };
        self.partitions.insert(record.id.clone(), partition);
        self.bus
            .publish(FleetEvent::BrowserCreated {
                browser: record.id.clone(),
            })
            .await;
        debug!(target: "supervisor", browser = %record.id, "browser created");

        if let Err(err) = self
            .create_page(CreatePageOptions {
                browser: record.id.clone(),
                url: None,
                activate: true,
                after: None,
            })
            .await
        {
            warn!(target: "supervisor", browser = %record.id, %err, "initial page creation failed");
        }

        self.store
            .get_browser(&record.id)
            .ok_or_else(|| GatewayError::internal("browser record vanished after create"))
    }

    /// Tears down all pages, then the browser record. Page destruction events
    /// go out in list order; activation churn is suppressed since the whole
    /// browser is going away.
    pub async fn destroy_browser(&self, browser: &BrowserId) -> GatewayResult<()> {
        let record = self
            .store
            .get_browser(browser)
            .ok_or_else(|| GatewayError::TargetNotFound(browser.to_string()))?;

        for page in record.pages {
            if let Err(err) = self.close_page_inner(browser, &page, false).await {
                warn!(target: "supervisor", browser = %browser, page = %page, %err, "page teardown failed");
            }
        }

        self.store.delete_browser(browser);
        self.partitions.remove(browser);
        self.bus
            .publish(FleetEvent::BrowserDestroyed {
                browser: browser.clone(),
            })
            .await;
        debug!(target: "supervisor", browser = %browser, "browser destroyed");
        Ok(())
    }

    /// Allocates the page record first so its id and endpoint are visible,
    /// then creates and binds the underlying surface page. The view is
    /// attached before navigation starts; navigating first loses early
    /// debugger events to the first session.
    pub async fn create_page(&self, opts: CreatePageOptions) -> GatewayResult<PageRecord> {
        let partition = self
            .partitions
            .get(&opts.browser)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::TargetNotFound(opts.browser.to_string()))?;
        let url = opts.url.clone().unwrap_or_else(|| self.home_url.to_string());

        let record = self.store.insert_page(
            &opts.browser,
            PageInit {
                url: url.clone(),
                title: url.clone(),
                favicon: None,
            },
            opts.after.as_ref(),
        )?;

        let handle = match self
            .surface
            .new_page(&partition, PageOptions::default())
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                self.store.remove_page(&opts.browser, &record.id);
                return Err(GatewayError::SurfaceUnavailable(err.to_string()));
            }
        };

        self.directory.insert(record.id.clone(), handle.clone());
        let mirror = self.spawn_mirror(record.id.clone(), opts.browser.clone(), handle.clone());
        self.pages.insert(
            record.id.clone(),
            PageTask {
                handle: handle.clone(),
                mirror,
            },
        );

        self.bus
            .publish(FleetEvent::PageCreated {
                browser: opts.browser.clone(),
                page: record.id.clone(),
                after: opts.after.clone(),
                url: url.clone(),
                title: record.title.clone(),
            })
            .await;

        if let Err(err) = self.surface.attach_view(&handle).await {
            warn!(target: "supervisor", page = %record.id, %err, "view attach failed");
        }
        if let Err(err) = self.surface.navigate(&handle, &url).await {
            warn!(target: "supervisor", page = %record.id, %err, "initial navigation failed");
        }

        if opts.activate {
            self.select_page(&opts.browser, &record.id).await?;
        }

        debug!(target: "supervisor", browser = %opts.browser, page = %record.id, "page created");
        self.store
            .get_page(&record.id)
            .ok_or_else(|| GatewayError::internal("page record vanished after create"))
    }

    pub async fn close_page(&self, browser: &BrowserId, page: &PageId) -> GatewayResult<()> {
        self.close_page_inner(browser, page, true).await
    }

    /// Pages opened by an in-page popup land immediately after their parent
    /// and are activated.
    pub async fn window_open(
        &self,
        parent: &PageId,
        url: &str,
    ) -> GatewayResult<PageRecord> {
        let parent_record = self
            .store
            .get_page(parent)
            .ok_or_else(|| GatewayError::TargetNotFound(parent.to_string()))?;
        self.create_page(CreatePageOptions {
            browser: parent_record.browser,
            url: Some(url.to_string()),
            activate: true,
            after: Some(parent.clone()),
        })
        .await
    }

    pub async fn navigate_page(&self, page: &PageId, url: &str) -> GatewayResult<()> {
        let handle = self.page_handle(page)?;
        self.surface
            .navigate(&handle, url)
            .await
            .map_err(|err| GatewayError::SurfaceUnavailable(err.to_string()))
    }

    pub async fn reload_page(&self, page: &PageId) -> GatewayResult<()> {
        let handle = self.page_handle(page)?;
        self.surface
            .reload(&handle)
            .await
            .map_err(|err| GatewayError::SurfaceUnavailable(err.to_string()))
    }

    pub async fn go_back(&self, page: &PageId) -> GatewayResult<()> {
        let handle = self.page_handle(page)?;
        self.surface
            .go_back(&handle)
            .await
            .map_err(|err| GatewayError::SurfaceUnavailable(err.to_string()))
    }

    pub async fn go_forward(&self, page: &PageId) -> GatewayResult<()> {
        let handle = self.page_handle(page)?;
        self.surface
            .go_forward(&handle)
            .await
            .map_err(|err| GatewayError::SurfaceUnavailable(err.to_string()))
    }

    pub async fn select_page(&self, browser: &BrowserId, page: &PageId) -> GatewayResult<()> {
        self.store.set_active_page(browser, Some(page))?;
        self.bus
            .publish(FleetEvent::PageActivated {
                browser: browser.clone(),
                page: Some(page.clone()),
            })
            .await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let browsers: Vec<BrowserId> = self
            .partitions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for browser in browsers {
            let _ = self.destroy_browser(&browser).await;
        }
    }

    fn page_handle(&self, page: &PageId) -> GatewayResult<PageHandle> {
        self.directory
            .get(page)
            .ok_or_else(|| GatewayError::TargetNotFound(page.to_string()))
    }

    async fn close_page_inner(
        &self,
        browser: &BrowserId,
        page: &PageId,
        emit_activation: bool,
    ) -> GatewayResult<()> {
        // Stop mirroring first so the engine-side close callback cannot race
        // the explicit removal below.
        let handle = match self.pages.remove(page) {
            Some((_, task)) => {
                task.mirror.abort();
                task.handle
            }
            None => self.page_handle(page)?,
        };
        self.surface
            .close_page(&handle)
            .await
            .map_err(|err| GatewayError::SurfaceUnavailable(err.to_string()))?;
        self.remove_page_record(browser, page, emit_activation).await;
        Ok(())
    }

    /// Removes the record and emits destruction (and, when requested and
    /// needed, activation) events. Idempotent; surface-initiated closes and
    /// explicit closes can race here.
    async fn remove_page_record(
        &self,
        browser: &BrowserId,
        page: &PageId,
        emit_activation: bool,
    ) {
        self.directory.remove(page);
        let Some(removal) = self.store.remove_page(browser, page) else {
            return;
        };
        self.bus
            .publish(FleetEvent::PageDestroyed {
                browser: browser.clone(),
                page: page.clone(),
            })
            .await;
        if emit_activation {
            if let Some(successor) = removal.activated {
                self.bus
                    .publish(FleetEvent::PageActivated {
                        browser: browser.clone(),
                        page: successor,
                    })
                    .await;
            }
        }
        debug!(target: "supervisor", browser = %browser, page = %page, "page destroyed");
    }

    /// One task per page mirrors surface callbacks into the fleet store and
    /// republished lifecycle events. All store writes go through here or the
    /// named operations; nothing bypasses the store.
    fn spawn_mirror(
        &self,
        page: PageId,
        browser: BrowserId,
        handle: PageHandle,
    ) -> JoinHandle<()> {
        let supervisor = self.clone();
        let mut events = match self.surface.page_events(&handle) {
            Ok(events) => events,
            Err(err) => {
                warn!(target: "supervisor", page = %page, %err, "page event subscription failed");
                return tokio::spawn(async {});
            }
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            supervisor
                                .handle_page_event(&browser, &page, &handle, event)
                                .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "supervisor", page = %page, skipped, "page mirror lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    async fn handle_page_event(
        &self,
        browser: &BrowserId,
        page: &PageId,
        handle: &PageHandle,
        event: PageEvent,
    ) {
        match event {
            PageEvent::Navigated { url } => {
                let state = self.surface.page_state(handle).ok();
                self.store.mutate_page(page, |record| {
                    record.url = url.clone();
                    if let Some(state) = &state {
                        record.navigation.can_go_back = state.can_go_back;
                        record.navigation.can_go_forward = state.can_go_forward;
                    }
                });
            }
            PageEvent::LoadStarted => {
                self.store.mutate_page(page, |record| {
                    record.navigation.is_loading = true;
                });
            }
            PageEvent::LoadFinished { ok } => {
                let state = self.surface.page_state(handle).ok();
                self.store.mutate_page(page, |record| {
                    record.navigation.is_loading = false;
                    if let Some(state) = &state {
                        record.navigation.can_go_back = state.can_go_back;
                        record.navigation.can_go_forward = state.can_go_forward;
                    }
                });
                let url = self
                    .store
                    .get_page(page)
                    .map(|record| record.url)
                    .unwrap_or_default();
                self.bus
                    .publish(FleetEvent::PageNavigated {
                        browser: browser.clone(),
                        page: page.clone(),
                        url,
                        failed: !ok,
                    })
                    .await;
            }
            PageEvent::TitleChanged { title } => {
                self.store.mutate_page(page, |record| {
                    record.title = title.clone();
                });
                self.bus
                    .publish(FleetEvent::PageTitleChanged {
                        browser: browser.clone(),
                        page: page.clone(),
                        title,
                    })
                    .await;
            }
            PageEvent::FaviconChanged { favicon } => {
                self.store.mutate_page(page, |record| {
                    record.favicon = favicon.clone();
                });
                self.bus
                    .publish(FleetEvent::PageFaviconChanged {
                        browser: browser.clone(),
                        page: page.clone(),
                        favicon,
                    })
                    .await;
            }
            PageEvent::PopupRequested { url } => {
                if let Err(err) = self.window_open(page, &url).await {
                    warn!(target: "supervisor", parent = %page, %err, "popup creation failed");
                }
            }
            PageEvent::Closed => {
                // Surface-initiated close (crash or engine-side teardown).
                // This runs on the page's own mirror task, so the task entry
                // is dropped without an abort; the loop ends when the event
                // stream closes.
                self.pages.remove(page);
                if self.store.get_page(page).is_some() {
                    self.remove_page_record(browser, page, true).await;
                }
            }
        }
    }
}
