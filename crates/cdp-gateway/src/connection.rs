//! Per-connection `Target.*`/`Browser.*` state machine for browser-scope
//! clients. One instance per accepted connection, owned by that connection's
//! read task; every outbound frame leaves through the connection's serialized
//! writer, so responses and events keep their enqueue order.

use std::collections::HashSet;

use serde_json::{json, Value};
use tracing::{debug, warn};

use magi_core_types::{cdp_codes, BrowserId, ConnectionId, GatewayError, GatewayResult, PageId, SessionId};
use magi_event_bus::FleetEvent;
use magi_fleet_store::PageRecord;
use magi_session_mux::OutboundSender;
use magi_supervisor::CreatePageOptions;

use crate::gateway::GatewayCtx;
use crate::metrics;
use crate::protocol::{
    browser_target_info, error_frame, error_frame_for, event_frame, page_target_info,
    response_frame, version_result, CdpRequest,
};

#[derive(Clone, Copy, Debug, Default)]
struct AutoAttach {
    enabled: bool,
    wait_for_debugger: bool,
    flatten: bool,
}

pub struct BrowserConnection {
    ctx: GatewayCtx,
    id: ConnectionId,
    browser: BrowserId,
    writer: OutboundSender,
    discover: bool,
    auto_attach: AutoAttach,
    sessions: HashSet<SessionId>,
}

impl BrowserConnection {
    pub fn new(ctx: GatewayCtx, browser: BrowserId, writer: OutboundSender) -> Self {
        Self {
            ctx,
            id: ConnectionId::new(),
            browser,
            writer,
            discover: false,
            auto_attach: AutoAttach::default(),
            sessions: HashSet::new(),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    fn send(&self, frame: String) {
        let _ = self.writer.send(frame);
    }

    fn respond(&self, id: &Value, result: Value) {
        self.send(response_frame(id, result));
    }

    fn respond_err(&self, id: &Value, err: &GatewayError) {
        self.send(error_frame_for(id, err));
    }

    fn emit(&self, method: &str, params: Value) {
        self.send(event_frame(method, params));
    }

    fn user_agent(&self) -> String {
        self.ctx
            .store
            .get_browser(&self.browser)
            .and_then(|record| record.user_agent)
            .unwrap_or_else(|| self.ctx.cfg.user_agent.clone())
    }

    fn page_in_scope(&self, page: &PageId) -> GatewayResult<PageRecord> {
        match self.ctx.store.get_page(page) {
            Some(record) if record.browser == self.browser => Ok(record),
            _ => Err(GatewayError::TargetNotFound(page.to_string())),
        }
    }

    fn target_info(&self, record: &PageRecord) -> Value {
        page_target_info(record, self.ctx.mux.has_sessions(&record.id))
    }

    /// Handles one inbound frame. `Err` means an internal invariant failure;
    /// the caller closes the connection.
    pub async fn handle_message(&mut self, raw: &str) -> GatewayResult<()> {
        let req = match CdpRequest::parse(raw) {
            Ok(req) => req,
            Err(err) => {
                warn!(target: "cdp-gateway", conn = %self.id, %err, "unparseable frame dropped");
                return Ok(());
            }
        };

        // Anything scoped to a session is page traffic, whatever the method.
        if let Some(session_id) = req.session_id.clone() {
            self.route_to_session(&session_id, raw, req.id.as_ref());
            return Ok(());
        }

        metrics::record_command(req.method());
        let id = req.id.clone().unwrap_or(Value::Null);
        let params = req.params.clone();

        match req.method() {
            "Browser.getVersion" => {
                self.respond(&id, version_result(&self.user_agent()));
            }
            "Browser.setDownloadBehavior" => {
                // Acknowledged without local download steering.
                self.respond(&id, json!({}));
            }
            "Target.getBrowserContexts" => {
                self.respond(&id, json!({ "browserContextIds": [] }));
            }
            "Target.createBrowserContext" => {
                // Default-context model: the browser is its own sole context.
                self.respond(&id, json!({ "browserContextId": self.browser.as_str() }));
            }
            "Target.disposeBrowserContext" => {
                self.respond(&id, json!({}));
            }
            "Target.setDiscoverTargets" => {
                let discover = params
                    .get("discover")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.discover = discover;
                self.respond(&id, json!({}));
                if discover {
                    self.replay_targets();
                }
            }
            "Target.createTarget" => {
                let url = params
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or("about:blank")
                    .to_string();
                let background = params
                    .get("background")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                match self
                    .ctx
                    .supervisor
                    .create_page(CreatePageOptions {
                        browser: self.browser.clone(),
                        url: Some(url),
                        activate: !background,
                        after: None,
                    })
                    .await
                {
                    // `Target.targetCreated` is NOT emitted here; the
                    // broadcast bridge is the single emission site.
                    Ok(record) => self.respond(&id, json!({ "targetId": record.id.as_str() })),
                    Err(err) => self.respond_err(&id, &err),
                }
            }
            "Target.closeTarget" => {
                let Some(target) = params.get("targetId").and_then(Value::as_str) else {
                    self.respond_err(
                        &id,
                        &GatewayError::ClientProtocol("closeTarget needs targetId".into()),
                    );
                    return Ok(());
                };
                let page = PageId(target.to_string());
                if let Err(err) = self.page_in_scope(&page) {
                    self.respond_err(&id, &err);
                    return Ok(());
                }
                match self.ctx.supervisor.close_page(&self.browser, &page).await {
                    Ok(()) => self.respond(&id, json!({ "success": true })),
                    Err(err) => self.respond_err(&id, &err),
                }
            }
            "Target.getTargets" => {
                let snapshot = self.ctx.store.snapshot();
                let infos: Vec<Value> = snapshot
                    .browser(&self.browser)
                    .map(|browser| {
                        browser
                            .page_records
                            .iter()
                            .map(|record| self.target_info(record))
                            .collect()
                    })
                    .unwrap_or_default();
                self.respond(&id, json!({ "targetInfos": infos }));
            }
            "Target.getTargetInfo" => match params.get("targetId").and_then(Value::as_str) {
                None => match self.ctx.store.get_browser(&self.browser) {
                    Some(record) => {
                        self.respond(&id, json!({ "targetInfo": browser_target_info(&record) }));
                    }
                    None => self.respond_err(
                        &id,
                        &GatewayError::TargetNotFound(self.browser.to_string()),
                    ),
                },
                Some(target) if target == self.browser.as_str() => {
                    match self.ctx.store.get_browser(&self.browser) {
                        Some(record) => self
                            .respond(&id, json!({ "targetInfo": browser_target_info(&record) })),
                        None => self.respond_err(
                            &id,
                            &GatewayError::TargetNotFound(self.browser.to_string()),
                        ),
                    }
                }
                Some(target) => {
                    let page = PageId(target.to_string());
                    match self.page_in_scope(&page) {
                        Ok(record) => {
                            self.respond(&id, json!({ "targetInfo": self.target_info(&record) }));
                        }
                        Err(err) => self.respond_err(&id, &err),
                    }
                }
            },
            "Target.attachToTarget" => {
                self.attach_to_target(&id, &params).await;
            }
            "Target.detachFromTarget" => {
                let Some(raw_session) = params.get("sessionId").and_then(Value::as_str) else {
                    self.respond_err(
                        &id,
                        &GatewayError::ClientProtocol("detachFromTarget needs sessionId".into()),
                    );
                    return Ok(());
                };
                let session: SessionId = match raw_session.parse() {
                    Ok(session) => session,
                    Err(err) => {
                        self.respond_err(&id, &err);
                        return Ok(());
                    }
                };
                match self.ctx.mux.detach_session(&session, &self.id).await {
                    Ok(()) => {
                        self.sessions.remove(&session);
                        self.respond(&id, json!({}));
                        if self.discover {
                            metrics::record_target_event("detachedFromTarget");
                            self.emit(
                                "Target.detachedFromTarget",
                                json!({
                                    "sessionId": session.to_string(),
                                    "targetId": session.page.as_str(),
                                }),
                            );
                        }
                    }
                    Err(err) => self.respond_err(&id, &err),
                }
            }
            "Target.sendMessageToTarget" => {
                let raw_session = params.get("sessionId").and_then(Value::as_str);
                let message = params.get("message").and_then(Value::as_str);
                let (Some(raw_session), Some(message)) = (raw_session, message) else {
                    self.respond_err(
                        &id,
                        &GatewayError::ClientProtocol(
                            "sendMessageToTarget needs sessionId and message".into(),
                        ),
                    );
                    return Ok(());
                };
                let session: SessionId = match raw_session.parse() {
                    Ok(session) => session,
                    Err(err) => {
                        self.respond_err(&id, &err);
                        return Ok(());
                    }
                };
                metrics::record_forwarded();
                match self.ctx.mux.route_request(&session, &self.id, message) {
                    // The wrapped response arrives later through the session
                    // writer; the command itself just acks.
                    Ok(()) => self.respond(&id, json!({})),
                    Err(err) => self.respond_err(&id, &err),
                }
            }
            "Target.setAutoAttach" => {
                self.auto_attach = AutoAttach {
                    enabled: params
                        .get("autoAttach")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    wait_for_debugger: params
                        .get("waitForDebuggerOnStart")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    flatten: params
                        .get("flatten")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                };
                self.respond(&id, json!({}));
                if self.auto_attach.enabled {
                    let snapshot = self.ctx.store.snapshot();
                    let pages: Vec<PageRecord> = snapshot
                        .browser(&self.browser)
                        .map(|browser| browser.page_records.clone())
                        .unwrap_or_default();
                    for record in pages {
                        if !self.owns_session_for(&record.id) {
                            self.auto_attach_page(&record.id).await;
                        }
                    }
                }
            }
            other => {
                if !id.is_null() {
                    self.send(error_frame(
                        &id,
                        cdp_codes::METHOD_NOT_FOUND,
                        &format!("'{other}' wasn't found"),
                    ));
                } else {
                    debug!(target: "cdp-gateway", conn = %self.id, method = other, "unhandled notification");
                }
            }
        }
        Ok(())
    }

    /// Reacts to fleet lifecycle. This broadcast bridge is the only place
    /// `Target.targetCreated` / `targetDestroyed` reach clients, so the event
    /// order any client observes equals the fleet mutation order.
    pub async fn handle_fleet_event(&mut self, event: FleetEvent) {
        if event.browser() != &self.browser {
            return;
        }
        match event {
            FleetEvent::PageCreated {
                page, url, title, ..
            } => {
                if self.discover {
                    let info = match self.ctx.store.get_page(&page) {
                        Some(record) => self.target_info(&record),
                        // The page can already be gone again; fall back to
                        // the event payload.
                        None => json!({
                            "targetId": page.as_str(),
                            "type": "page",
                            "title": title,
                            "url": url,
                            "attached": false,
                            "canAccessOpener": false,
                            "browserContextId": self.browser.as_str(),
                        }),
                    };
                    metrics::record_target_event("targetCreated");
                    self.emit("Target.targetCreated", json!({ "targetInfo": info }));
                }
                if self.auto_attach.enabled && !self.owns_session_for(&page) {
                    self.auto_attach_page(&page).await;
                }
            }
            FleetEvent::PageDestroyed { page, .. } => {
                self.sessions.retain(|session| session.page != page);
                if self.discover {
                    metrics::record_target_event("targetDestroyed");
                    self.emit(
                        "Target.targetDestroyed",
                        json!({ "targetId": page.as_str() }),
                    );
                }
            }
            FleetEvent::PageNavigated { page, .. }
            | FleetEvent::PageTitleChanged { page, .. } => {
                if self.discover {
                    if let Ok(record) = self.page_in_scope(&page) {
                        self.emit(
                            "Target.targetInfoChanged",
                            json!({ "targetInfo": self.target_info(&record) }),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    /// Detaches everything this connection owns; called when the socket
    /// closes.
    pub async fn teardown(&mut self) {
        self.ctx.mux.detach_connection(&self.id).await;
        self.sessions.clear();
    }

    fn owns_session_for(&self, page: &PageId) -> bool {
        self.sessions.iter().any(|session| &session.page == page)
    }

    fn route_to_session(&self, raw_session: &str, raw: &str, id: Option<&Value>) {
        metrics::record_forwarded();
        let parsed: Result<SessionId, _> = raw_session.parse();
        let outcome = match parsed {
            Ok(session) => self.ctx.mux.route_request(&session, &self.id, raw),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            // Answer at the top level so the client is never left waiting on
            // a session that does not route.
            match id {
                Some(id) => self.send(error_frame_for(id, &err)),
                None => {
                    warn!(target: "cdp-gateway", conn = %self.id, %err, "unroutable session frame dropped");
                }
            }
        }
    }

    /// Response `{sessionId}` is queued before `Target.attachedToTarget`, and
    /// the session only starts fan-out after both are queued, so nothing from
    /// the session can overtake them on this connection's writer.
    async fn attach_to_target(&mut self, id: &Value, params: &Value) {
        let Some(target) = params.get("targetId").and_then(Value::as_str) else {
            self.respond_err(
                id,
                &GatewayError::ClientProtocol("attachToTarget needs targetId".into()),
            );
            return;
        };
        let page = PageId(target.to_string());
        let record = match self.page_in_scope(&page) {
            Ok(record) => record,
            Err(err) => {
                self.respond_err(id, &err);
                return;
            }
        };
        let flatten = params
            .get("flatten")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        match self
            .ctx
            .mux
            .attach_client(&page, &self.id, flatten, self.writer.clone())
            .await
        {
            Ok(session) => {
                self.respond(id, json!({ "sessionId": session.to_string() }));
                metrics::record_target_event("attachedToTarget");
                self.emit(
                    "Target.attachedToTarget",
                    json!({
                        "sessionId": session.to_string(),
                        "targetInfo": page_target_info(&record, true),
                        "waitingForDebugger": false,
                    }),
                );
                self.ctx.mux.activate_session(&session);
                self.sessions.insert(session);
            }
            // Attach failures produce an error response and no event.
            Err(err) => self.respond_err(id, &err),
        }
    }

    async fn auto_attach_page(&mut self, page: &PageId) {
        let Ok(record) = self.page_in_scope(page) else {
            return;
        };
        match self
            .ctx
            .mux
            .attach_client(page, &self.id, self.auto_attach.flatten, self.writer.clone())
            .await
        {
            Ok(session) => {
                metrics::record_target_event("attachedToTarget");
                self.emit(
                    "Target.attachedToTarget",
                    json!({
                        "sessionId": session.to_string(),
                        "targetInfo": page_target_info(&record, true),
                        "waitingForDebugger": self.auto_attach.wait_for_debugger,
                    }),
                );
                self.ctx.mux.activate_session(&session);
                self.sessions.insert(session);
            }
            Err(err) => {
                warn!(target: "cdp-gateway", conn = %self.id, page = %page, %err, "auto-attach failed");
            }
        }
    }

    /// Replays `Target.targetCreated` for every existing page when discovery
    /// turns on, in fleet list order.
    fn replay_targets(&self) {
        let snapshot = self.ctx.store.snapshot();
        let Some(browser) = snapshot.browser(&self.browser) else {
            return;
        };
        for record in &browser.page_records {
            metrics::record_target_event("targetCreated");
            self.emit(
                "Target.targetCreated",
                json!({ "targetInfo": self.target_info(record) }),
            );
        }
    }
}
