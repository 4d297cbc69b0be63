//! Discovery endpoints. All responses are JSON; shapes mirror Chrome's
//! `/json/*` contract.

use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use magi_core_types::{BrowserId, GatewayError, PageId};
use magi_fleet_store::{BrowserRecord, BrowserSpec, PageRecord};
use magi_supervisor::CreatePageOptions;

use crate::gateway::GatewayCtx;
use crate::protocol::{protocol_descriptor, version_block};

pub type HttpResult<T> = Result<T, HttpError>;

/// HTTP-boundary wrapper over the shared error taxonomy.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl From<GatewayError> for HttpError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::TargetNotFound(_) | GatewayError::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::ClientProtocol(_) | GatewayError::MethodNotFound(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::SurfaceUnavailable(_) | GatewayError::Timeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn browser_user_agent(ctx: &GatewayCtx, record: Option<&BrowserRecord>) -> String {
    record
        .and_then(|record| record.user_agent.clone())
        .unwrap_or_else(|| ctx.cfg.user_agent.clone())
}

fn browser_list_entry(ctx: &GatewayCtx, record: &BrowserRecord) -> Value {
    json!({
        "id": record.id.as_str(),
        "type": "browser",
        "title": record.name,
        "attached": ctx.connections.any_for(&record.id),
        "webSocketDebuggerUrl": ctx.cfg.browser_ws_url(Some(&record.id)),
    })
}

fn page_list_entry(ctx: &GatewayCtx, record: &PageRecord) -> Value {
    let mut entry = json!({
        "id": record.id.as_str(),
        "type": "page",
        "title": record.title,
        "url": record.url,
        // Real attachment state, not the inverted-activity quirk.
        "attached": ctx.mux.has_sessions(&record.id),
        "webSocketDebuggerUrl": ctx.cfg.page_ws_url(&record.id),
    });
    if let Some(favicon) = &record.favicon {
        entry["faviconUrl"] = json!(favicon);
    }
    entry
}

pub async fn json_version(State(ctx): State<GatewayCtx>) -> HttpResult<Json<Value>> {
    // With zero browsers there is nothing dialable; 503 beats handing the
    // client an endpoint that does not exist.
    let first = ctx
        .store
        .first_browser()
        .ok_or_else(|| HttpError::unavailable("no browsers available"))?;
    let record = ctx.store.get_browser(&first);
    Ok(Json(version_block(
        &browser_user_agent(&ctx, record.as_ref()),
        &ctx.cfg.browser_ws_url(Some(&first)),
    )))
}

pub async fn json_list(State(ctx): State<GatewayCtx>) -> Json<Value> {
    let snapshot = ctx.store.snapshot();
    let mut entries = Vec::new();
    for browser in &snapshot.browsers {
        entries.push(browser_list_entry(&ctx, &browser.record));
        for page in &browser.page_records {
            entries.push(page_list_entry(&ctx, page));
        }
    }
    Json(Value::Array(entries))
}

pub async fn json_protocol() -> Json<Value> {
    Json(protocol_descriptor())
}

/// `/json/new?{url}`: creates a page in the first browser, Chrome-style;
/// the whole query string is the URL.
pub async fn json_new(
    State(ctx): State<GatewayCtx>,
    RawQuery(query): RawQuery,
) -> HttpResult<Json<Value>> {
    let first = ctx
        .store
        .first_browser()
        .ok_or_else(|| HttpError::unavailable("no browsers available"))?;
    let url = query.filter(|q| !q.is_empty());
    let record = ctx
        .supervisor
        .create_page(CreatePageOptions {
            browser: first,
            url,
            activate: true,
            after: None,
        })
        .await?;
    Ok(Json(page_list_entry(&ctx, &record)))
}

pub async fn browser_json_version(
    State(ctx): State<GatewayCtx>,
    Path(browser_id): Path<String>,
) -> HttpResult<Json<Value>> {
    let browser = BrowserId(browser_id);
    let record = ctx
        .store
        .get_browser(&browser)
        .ok_or_else(|| HttpError::not_found(format!("no browser {browser}")))?;
    Ok(Json(version_block(
        &browser_user_agent(&ctx, Some(&record)),
        &ctx.cfg.browser_ws_url(Some(&browser)),
    )))
}

pub async fn browser_json_list(
    State(ctx): State<GatewayCtx>,
    Path(browser_id): Path<String>,
) -> HttpResult<Json<Value>> {
    let browser = BrowserId(browser_id);
    let snapshot = ctx.store.snapshot();
    let browser = snapshot
        .browser(&browser)
        .ok_or_else(|| HttpError::not_found(format!("no browser {browser}")))?;
    let mut entries = vec![browser_list_entry(&ctx, &browser.record)];
    for page in &browser.page_records {
        entries.push(page_list_entry(&ctx, page));
    }
    Ok(Json(Value::Array(entries)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBrowserRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Non-production helper: create a browser and report its endpoints.
pub async fn test_create_browser(
    State(ctx): State<GatewayCtx>,
    body: Option<Json<CreateBrowserRequest>>,
) -> HttpResult<Json<Value>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let record = ctx
        .supervisor
        .create_browser(BrowserSpec {
            name: req.name.unwrap_or_else(|| "browser".to_string()),
            partition_key: req.partition_key,
            user_agent: req.user_agent,
        })
        .await?;
    let initial_page = record.pages.first().cloned();
    debug!(target: "cdp-gateway", browser = %record.id, "test browser created");
    Ok(Json(json!({
        "browserId": record.id.as_str(),
        "webSocketDebuggerUrl": ctx.cfg.browser_ws_url(Some(&record.id)),
        "pageId": initial_page.as_ref().map(PageId::as_str),
        "pageWebSocketDebuggerUrl": initial_page.as_ref().map(|page| ctx.cfg.page_ws_url(page)),
    })))
}

pub async fn test_delete_browser(
    State(ctx): State<GatewayCtx>,
    Path(browser_id): Path<String>,
) -> HttpResult<StatusCode> {
    let browser = BrowserId(browser_id);
    ctx.supervisor.destroy_browser(&browser).await?;
    Ok(StatusCode::NO_CONTENT)
}
