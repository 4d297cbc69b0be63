//! Wire shapes: request parsing (both flattened inbound forms), response and
//! event frame builders, the version block and the protocol descriptor.

use serde::Deserialize;
use serde_json::{json, Value};

use magi_core_types::{cdp_codes, GatewayError};
use magi_fleet_store::{BrowserRecord, PageRecord};

pub const BROWSER_PRODUCT: &str = "Magi/1.0.0 Chrome/128.0.0.0";
pub const PROTOCOL_VERSION: &str = "1.3";
pub const V8_VERSION: &str = "12.8.21";
pub const WEBKIT_VERSION: &str = "537.36 (@1f2e3a9c4d)";
pub const WEBKIT_REVISION: &str = "@1f2e3a9c4d";
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/128.0.0.0 Safari/537.36 Magi/1.0.0";

/// One inbound client frame. Flattened commands arrive either wrapped in
/// `Target.sendMessageToTarget` or as a bare request with a top-level
/// `sessionId`; both park the session id here.
#[derive(Debug, Deserialize)]
pub struct CdpRequest {
    pub id: Option<Value>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

impl CdpRequest {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }
}

pub fn response_frame(id: &Value, result: Value) -> String {
    json!({ "id": id, "result": result }).to_string()
}

pub fn error_frame(id: &Value, code: i64, message: &str) -> String {
    json!({ "id": id, "error": { "code": code, "message": message } }).to_string()
}

pub fn error_frame_for(id: &Value, err: &GatewayError) -> String {
    error_frame(id, err.cdp_code(), &err.to_string())
}

pub fn event_frame(method: &str, params: Value) -> String {
    json!({ "method": method, "params": params }).to_string()
}

/// `Browser.getVersion` result, CDP key spelling.
pub fn version_result(user_agent: &str) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "product": BROWSER_PRODUCT,
        "revision": WEBKIT_REVISION,
        "userAgent": user_agent,
        "jsVersion": V8_VERSION,
    })
}

/// HTTP `/json/version` block, Chrome header-style key spelling.
pub fn version_block(user_agent: &str, ws_url: &str) -> Value {
    json!({
        "Browser": BROWSER_PRODUCT,
        "Protocol-Version": PROTOCOL_VERSION,
        "User-Agent": user_agent,
        "V8-Version": V8_VERSION,
        "WebKit-Version": WEBKIT_VERSION,
        "webSocketDebuggerUrl": ws_url,
    })
}

/// CDP `targetInfo` for a page.
pub fn page_target_info(record: &PageRecord, attached: bool) -> Value {
    json!({
        "targetId": record.id.as_str(),
        "type": "page",
        "title": record.title,
        "url": record.url,
        "attached": attached,
        "canAccessOpener": false,
        "browserContextId": record.browser.as_str(),
    })
}

/// CDP `targetInfo` for the browser endpoint itself.
pub fn browser_target_info(record: &BrowserRecord) -> Value {
    json!({
        "targetId": record.id.as_str(),
        "type": "browser",
        "title": record.name,
        "url": "",
        "attached": true,
        "canAccessOpener": false,
    })
}

/// Minimal protocol descriptor covering the Target and Browser domains, for
/// generic clients that introspect `/json/protocol`.
pub fn protocol_descriptor() -> Value {
    let command = |name: &str| json!({ "name": name });
    json!({
        "version": { "major": "1", "minor": "3" },
        "domains": [
            {
                "domain": "Browser",
                "commands": [
                    command("getVersion"),
                    command("setDownloadBehavior"),
                ],
                "events": [],
            },
            {
                "domain": "Target",
                "commands": [
                    command("getBrowserContexts"),
                    command("createBrowserContext"),
                    command("disposeBrowserContext"),
                    command("setDiscoverTargets"),
                    command("createTarget"),
                    command("closeTarget"),
                    command("getTargets"),
                    command("getTargetInfo"),
                    command("attachToTarget"),
                    command("detachFromTarget"),
                    command("sendMessageToTarget"),
                    command("setAutoAttach"),
                ],
                "events": [
                    command("targetCreated"),
                    command("targetDestroyed"),
                    command("targetInfoChanged"),
                    command("attachedToTarget"),
                    command("detachedFromTarget"),
                    command("receivedMessageFromTarget"),
                ],
            },
        ],
    })
}
