use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use magi_core_types::{cdp_codes, ConnectionId, GatewayError, GatewayResult, PageId, SessionId};
use magi_event_bus::{EventBus, FleetBus, FleetEvent};
use magi_surface::{DebuggerBinding, PageDirectory, Surface, SurfaceError};

use crate::ready::{await_page_ready, ReadyConfig};

/// Per-connection writer handle. The gateway owns the receiving side and
/// drains it onto the WebSocket in enqueue order.
pub type OutboundSender = mpsc::UnboundedSender<String>;

struct SessionEntry {
    id: SessionId,
    page: PageId,
    owner: ConnectionId,
    flatten: bool,
    sender: OutboundSender,
    /// Fan-out starts only once the gateway has queued the attach response
    /// and the `Target.attachedToTarget` event.
    active: AtomicBool,
    next_internal: AtomicU64,
    /// internal command id -> client-chosen request id.
    pending: Mutex<HashMap<u64, Value>>,
}

impl SessionEntry {
    fn frame(&self, inner: &Value) -> String {
        if self.flatten {
            json!({
                "method": "Target.receivedMessageFromTarget",
                "params": {
                    "sessionId": self.id.to_string(),
                    "message": inner.to_string(),
                    "targetId": self.page.0,
                }
            })
            .to_string()
        } else {
            inner.to_string()
        }
    }

    fn deliver(&self, inner: &Value) {
        let _ = self.sender.send(self.frame(inner));
    }
}

struct PageBinding {
    binding: DebuggerBinding,
    sessions: RwLock<Vec<Arc<SessionEntry>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the single debugger binding per page and every session multiplexed
/// over it. Responses go to the session that issued the command; events fan
/// out to all sessions on the page. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionMultiplexer {
    surface: Arc<dyn Surface>,
    directory: Arc<PageDirectory>,
    bindings: Arc<DashMap<PageId, Arc<PageBinding>>>,
    sessions: Arc<DashMap<SessionId, Arc<SessionEntry>>>,
    attach_gates: Arc<DashMap<PageId, Arc<tokio::sync::Mutex<()>>>>,
    next_seq: Arc<AtomicU64>,
    ready_cfg: ReadyConfig,
    shutdown: CancellationToken,
}

impl SessionMultiplexer {
    pub fn new(surface: Arc<dyn Surface>, directory: Arc<PageDirectory>) -> Arc<Self> {
        Self::with_ready_config(surface, directory, ReadyConfig::default())
    }

    pub fn with_ready_config(
        surface: Arc<dyn Surface>,
        directory: Arc<PageDirectory>,
        ready_cfg: ReadyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            surface,
            directory,
            bindings: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
            attach_gates: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(1)),
            ready_cfg,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// True when at least one session references the page's binding. This is
    /// what discovery payloads report as `attached`.
    pub fn has_sessions(&self, page: &PageId) -> bool {
        self.bindings
            .get(page)
            .map(|binding| !binding.sessions.read().is_empty())
            .unwrap_or(false)
    }

    /// Registers a session for `page` owned by `owner`. Lazily acquires the
    /// debugger binding, waiting for surface readiness on first use. The
    /// session does not receive event fan-out until `activate_session`.
    pub async fn attach_client(
        &self,
        page: &PageId,
        owner: &ConnectionId,
        flatten: bool,
        sender: OutboundSender,
    ) -> GatewayResult<SessionId> {
        let binding = self.ensure_binding(page).await?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = SessionId::new(page.clone(), seq);
        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            page: page.clone(),
            owner: owner.clone(),
            flatten,
            sender,
            active: AtomicBool::new(false),
            next_internal: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        });
        self.sessions.insert(id.clone(), Arc::clone(&entry));
        binding.sessions.write().push(entry);
        debug!(target: "session-mux", session = %id, owner = %owner, "session attached");
        Ok(id)
    }

    /// Opens the session for event fan-out. Split from `attach_client` so the
    /// caller can order its attach acknowledgements ahead of any session
    /// traffic.
    pub fn activate_session(&self, id: &SessionId) {
        if let Some(entry) = self.sessions.get(id) {
            entry.active.store(true, Ordering::Release);
        }
    }

    pub fn session_owner(&self, id: &SessionId) -> Option<ConnectionId> {
        self.sessions.get(id).map(|entry| entry.owner.clone())
    }

    /// Removes a session; releases the debugger binding when it was the last
    /// one on its page. Session ids are visible to every discovering client,
    /// so only the owning connection may detach; anyone else sees the same
    /// error as for a session that never existed.
    pub async fn detach_session(&self, id: &SessionId, owner: &ConnectionId) -> GatewayResult<()> {
        let (_, entry) = self
            .sessions
            .remove_if(id, |_, entry| entry.owner == *owner)
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        let release = match self.bindings.get(&entry.page) {
            Some(binding) => {
                let mut sessions = binding.sessions.write();
                sessions.retain(|session| session.id != *id);
                sessions.is_empty()
            }
            None => false,
        };
        if release {
            self.release_binding(&entry.page).await;
        }
        debug!(target: "session-mux", session = %id, "session detached");
        Ok(())
    }

    /// Detaches every session owned by a closing connection.
    pub async fn detach_connection(&self, owner: &ConnectionId) {
        let owned: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().owner == *owner)
            .map(|entry| entry.key().clone())
            .collect();
        for id in owned {
            let _ = self.detach_session(&id, owner).await;
        }
    }

    /// Parses a raw client frame and forwards it to the debugger. The
    /// response is framed back to the owning session only; commands that
    /// carry no id get no response. A caller that is not the session's owner
    /// gets the unknown-session error, never a route into someone else's
    /// session.
    pub fn route_request(&self, id: &SessionId, owner: &ConnectionId, raw: &str) -> GatewayResult<()> {
        let entry = self
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;
        if entry.owner != *owner {
            return Err(GatewayError::SessionNotFound(id.to_string()));
        }

        let parsed: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "session-mux", session = %id, %err, "unparseable frame dropped");
                return Ok(());
            }
        };
        let client_id = parsed.get("id").cloned();
        let method = match parsed.get("method").and_then(Value::as_str) {
            Some(method) => method.to_string(),
            None => {
                if let Some(client_id) = client_id {
                    entry.deliver(&json!({
                        "id": client_id,
                        "error": {
                            "code": cdp_codes::INVALID_PARAMS,
                            "message": "message has no method",
                        }
                    }));
                } else {
                    warn!(target: "session-mux", session = %id, "frame without method or id dropped");
                }
                return Ok(());
            }
        };
        let params = parsed.get("params").cloned().unwrap_or_else(|| json!({}));

        let binding = self
            .bindings
            .get(&entry.page)
            .map(|binding| binding.binding.clone())
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))?;

        let internal = entry.next_internal.fetch_add(1, Ordering::Relaxed);
        if let Some(client_id) = &client_id {
            entry.pending.lock().insert(internal, client_id.clone());
        }

        let mux = self.clone();
        tokio::spawn(async move {
            let result = mux
                .surface
                .send_debugger_command(&binding, &method, params)
                .await;
            let client_id = entry.pending.lock().remove(&internal);
            // A session detached mid-flight gets nothing; nobody else may.
            if !mux.sessions.contains_key(&entry.id) {
                return;
            }
            let Some(client_id) = client_id else {
                return;
            };
            let inner = match result {
                Ok(value) => json!({ "id": client_id, "result": value }),
                Err(err) => json!({
                    "id": client_id,
                    "error": {
                        "code": cdp_codes::SERVER_ERROR,
                        "message": err.to_string(),
                    }
                }),
            };
            entry.deliver(&inner);
        });
        Ok(())
    }

    /// Tears down all sessions on a destroyed page and closes the binding.
    pub async fn page_destroyed(&self, page: &PageId) {
        let doomed: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().page == *page)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &doomed {
            self.sessions.remove(id);
        }
        if self.bindings.contains_key(page) {
            self.release_binding(page).await;
        }
        if !doomed.is_empty() {
            debug!(target: "session-mux", page = %page, count = doomed.len(), "sessions cancelled with page");
        }
    }

    /// Subscribes to fleet lifecycle so page destruction cancels sessions
    /// without the supervisor knowing about this component.
    pub fn spawn_fleet_listener(&self, bus: &Arc<FleetBus>) -> JoinHandle<()> {
        let mux = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = mux.shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(FleetEvent::PageDestroyed { page, .. }) => {
                            mux.page_destroyed(&page).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "session-mux", skipped, "fleet listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    async fn ensure_binding(&self, page: &PageId) -> GatewayResult<Arc<PageBinding>> {
        if let Some(binding) = self.bindings.get(page) {
            return Ok(Arc::clone(binding.value()));
        }

        let gate = self
            .attach_gates
            .entry(page.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        if let Some(binding) = self.bindings.get(page) {
            return Ok(Arc::clone(binding.value()));
        }

        let handle = self
            .directory
            .get(page)
            .ok_or_else(|| GatewayError::TargetNotFound(page.to_string()))?;

        await_page_ready(self.surface.as_ref(), &handle, &self.ready_cfg).await;

        let binding = self
            .surface
            .attach_debugger(&handle)
            .await
            .map_err(map_surface_error)?;
        let events = self
            .surface
            .subscribe_debugger_events(&binding)
            .map_err(map_surface_error)?;

        let page_binding = Arc::new(PageBinding {
            binding,
            sessions: RwLock::new(Vec::new()),
            pump: Mutex::new(None),
        });
        let pump = self.spawn_event_pump(Arc::clone(&page_binding), events);
        *page_binding.pump.lock() = Some(pump);
        self.bindings.insert(page.clone(), Arc::clone(&page_binding));
        debug!(target: "session-mux", page = %page, "debugger binding acquired");
        Ok(page_binding)
    }

    fn spawn_event_pump(
        &self,
        binding: Arc<PageBinding>,
        mut events: broadcast::Receiver<magi_surface::DebuggerEvent>,
    ) -> JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            let inner = json!({ "method": event.method, "params": event.params });
                            for session in binding.sessions.read().iter() {
                                if session.active.load(Ordering::Acquire) {
                                    session.deliver(&inner);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "session-mux", skipped, "debugger event pump lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    async fn release_binding(&self, page: &PageId) {
        if let Some((_, binding)) = self.bindings.remove(page) {
            if let Some(pump) = binding.pump.lock().take() {
                pump.abort();
            }
            if let Err(err) = self.surface.detach_debugger(&binding.binding).await {
                // The page may already be gone; nothing to release then.
                debug!(target: "session-mux", page = %page, %err, "debugger detach skipped");
            }
        }
        self.attach_gates.remove(page);
    }
}

fn map_surface_error(err: SurfaceError) -> GatewayError {
    match err {
        SurfaceError::PageGone(page) => GatewayError::TargetNotFound(page),
        other => GatewayError::SurfaceUnavailable(other.to_string()),
    }
}
