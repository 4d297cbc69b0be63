use std::sync::Arc;

use axum::http::Method;
use axum::routing::{delete, get, post};
use axum::Router;
use dashmap::DashMap;
use tower_http::cors::{Any, CorsLayer};

use magi_core_types::{BrowserId, ConnectionId, PageId};
use magi_event_bus::FleetBus;
use magi_fleet_store::FleetStore;
use magi_session_mux::SessionMultiplexer;
use magi_supervisor::SurfaceSupervisor;

use crate::protocol::DEFAULT_USER_AGENT;
use crate::{http, ws};

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub user_agent: String,
    /// Gates the `/test/browser/*` endpoints; absent flag means the routes
    /// are not served at all.
    pub enable_test_endpoints: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9222,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            enable_test_endpoints: false,
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ws_base(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn browser_ws_url(&self, browser: Option<&BrowserId>) -> String {
        match browser {
            Some(browser) => format!("{}/devtools/browser/{}", self.ws_base(), browser),
            None => format!("{}/devtools/browser", self.ws_base()),
        }
    }

    pub fn page_ws_url(&self, page: &PageId) -> String {
        format!("{}/devtools/page/{}", self.ws_base(), page)
    }
}

/// Browser-scope connections currently accepted, for the `attached` flag on
/// browser list entries.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, BrowserId>,
}

impl ConnectionRegistry {
    pub fn insert(&self, connection: ConnectionId, browser: BrowserId) {
        self.connections.insert(connection, browser);
    }

    pub fn remove(&self, connection: &ConnectionId) {
        self.connections.remove(connection);
    }

    pub fn any_for(&self, browser: &BrowserId) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.value() == browser)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[derive(Clone)]
pub struct GatewayCtx {
    pub store: Arc<FleetStore>,
    pub supervisor: Arc<SurfaceSupervisor>,
    pub mux: Arc<SessionMultiplexer>,
    pub bus: Arc<FleetBus>,
    pub connections: Arc<ConnectionRegistry>,
    pub cfg: Arc<GatewayConfig>,
}

/// The transport: Chrome's debugging HTTP/WebSocket contract over the fleet.
pub struct CdpGateway {
    ctx: GatewayCtx,
}

impl CdpGateway {
    pub fn new(
        store: Arc<FleetStore>,
        supervisor: Arc<SurfaceSupervisor>,
        mux: Arc<SessionMultiplexer>,
        bus: Arc<FleetBus>,
        cfg: GatewayConfig,
    ) -> Self {
        Self {
            ctx: GatewayCtx {
                store,
                supervisor,
                mux,
                bus,
                connections: Arc::new(ConnectionRegistry::default()),
                cfg: Arc::new(cfg),
            },
        }
    }

    pub fn ctx(&self) -> GatewayCtx {
        self.ctx.clone()
    }

    /// Builds the router. Upgrade paths outside the grammar fall through to
    /// axum's 404, which fails the WebSocket handshake.
    pub fn build(self) -> Router {
        let test_endpoints = self.ctx.cfg.enable_test_endpoints;
        let mut router = Router::new()
            .route("/json", get(http::json_list))
            .route("/json/version", get(http::json_version))
            .route("/json/list", get(http::json_list))
            .route("/json/new", get(http::json_new))
            .route("/json/protocol", get(http::json_protocol))
            .route(
                "/devtools/browser/:browser_id/json/version",
                get(http::browser_json_version),
            )
            .route(
                "/devtools/browser/:browser_id/json/list",
                get(http::browser_json_list),
            )
            .route("/devtools/browser", get(ws::browser_upgrade_default))
            .route("/devtools/browser/:browser_id", get(ws::browser_upgrade))
            .route("/devtools/page/:page_id", get(ws::page_upgrade));
        if test_endpoints {
            router = router
                .route("/test/browser/create", post(http::test_create_browser))
                .route(
                    "/test/browser/:browser_id",
                    delete(http::test_delete_browser),
                );
        }
        router.layer(cors_layer()).with_state(self.ctx)
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}
