//! Integration coverage for session multiplexing: binding ref-counting,
//! response-to-owner isolation, and event fan-out across sessions.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use magi_core_types::{ConnectionId, PageId, SessionId};
use magi_event_bus::{EventBus, FleetBus, FleetEvent};
use magi_session_mux::{ReadyConfig, SessionMultiplexer};
use magi_surface::{PageDirectory, PageHandle, PageOptions, StubSurface, Surface, SurfaceError};

struct Harness {
    surface: Arc<StubSurface>,
    directory: Arc<PageDirectory>,
    mux: Arc<SessionMultiplexer>,
}

impl Harness {
    async fn new() -> Self {
        let surface = StubSurface::new();
        let directory = Arc::new(PageDirectory::new());
        let mux = SessionMultiplexer::with_ready_config(
            surface.clone() as Arc<dyn Surface>,
            Arc::clone(&directory),
            ReadyConfig {
                initial_settle: Duration::from_millis(1),
                load_timeout: Duration::from_millis(100),
                final_settle: Duration::from_millis(1),
            },
        );
        Self {
            surface,
            directory,
            mux,
        }
    }

    async fn page(&self, url: &str) -> (PageId, PageHandle) {
        let partition = self.surface.new_partition("test").await.unwrap();
        let handle = self
            .surface
            .new_page(
                &partition,
                PageOptions {
                    initial_url: Some(url.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let page = PageId::new();
        self.directory.insert(page.clone(), handle.clone());
        (page, handle)
    }
}

async fn recv_json(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let raw = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("frame within deadline")
        .expect("writer open");
    serde_json::from_str(&raw).expect("valid json frame")
}

async fn attach_active(
    harness: &Harness,
    page: &PageId,
    flatten: bool,
) -> (SessionId, ConnectionId, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let owner = ConnectionId::new();
    let session = harness
        .mux
        .attach_client(page, &owner, flatten, tx)
        .await
        .unwrap();
    harness.mux.activate_session(&session);
    (session, owner, rx)
}

#[tokio::test]
async fn binding_is_acquired_once_and_released_with_last_session() {
    let harness = Harness::new().await;
    let (page, handle) = harness.page("https://example.com").await;

    let (s1, o1, _rx1) = attach_active(&harness, &page, false).await;
    let (s2, o2, _rx2) = attach_active(&harness, &page, false).await;
    assert!(harness.mux.has_sessions(&page));

    // The surface-level channel is exclusive while any session remains.
    assert!(matches!(
        harness.surface.attach_debugger(&handle).await,
        Err(SurfaceError::AlreadyAttached)
    ));

    harness.mux.detach_session(&s1, &o1).await.unwrap();
    assert!(harness.mux.has_sessions(&page));
    harness.mux.detach_session(&s2, &o2).await.unwrap();
    assert!(!harness.mux.has_sessions(&page));

    // Last detach released the binding.
    let binding = harness.surface.attach_debugger(&handle).await.unwrap();
    harness.surface.detach_debugger(&binding).await.unwrap();
}

#[tokio::test]
async fn session_ids_are_monotonic_and_carry_the_page() {
    let harness = Harness::new().await;
    let (page, _) = harness.page("https://example.com").await;

    let (s1, _o1, _rx1) = attach_active(&harness, &page, false).await;
    let (s2, _o2, _rx2) = attach_active(&harness, &page, false).await;

    assert_eq!(s1.page, page);
    assert_eq!(s2.page, page);
    assert!(s2.seq > s1.seq);
    assert!(s1.to_string().starts_with(page.as_str()));
}

#[tokio::test]
async fn responses_reach_only_the_issuing_session_despite_overlapping_ids() {
    let harness = Harness::new().await;
    let (page, _) = harness.page("https://example.com").await;

    let (s1, o1, mut rx1) = attach_active(&harness, &page, false).await;
    let (s2, o2, mut rx2) = attach_active(&harness, &page, false).await;

    // Both clients use id 1; each must get exactly its own response.
    harness
        .mux
        .route_request(&s1, &o1, r#"{"id":1,"method":"Network.enable","params":{}}"#)
        .unwrap();
    harness
        .mux
        .route_request(&s2, &o2, r#"{"id":1,"method":"Runtime.enable","params":{}}"#)
        .unwrap();

    let r1 = recv_json(&mut rx1).await;
    let r2 = recv_json(&mut rx2).await;
    assert_eq!(r1, json!({ "id": 1, "result": {} }));
    assert_eq!(r2, json!({ "id": 1, "result": {} }));

    // No stray second frame on either writer.
    assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_err());
    assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_err());
}

#[tokio::test]
async fn flattened_sessions_get_wrapped_frames() {
    let harness = Harness::new().await;
    let (page, _) = harness.page("https://example.com").await;

    let (session, owner, mut rx) = attach_active(&harness, &page, true).await;

    harness
        .mux
        .route_request(&session, &owner, r#"{"id":11,"method":"Page.enable","params":{}}"#)
        .unwrap();

    let frame = recv_json(&mut rx).await;
    assert_eq!(frame["method"], "Target.receivedMessageFromTarget");
    assert_eq!(frame["params"]["sessionId"], session.to_string());
    assert_eq!(frame["params"]["targetId"], page.as_str());
    let inner: Value =
        serde_json::from_str(frame["params"]["message"].as_str().unwrap()).unwrap();
    assert_eq!(inner, json!({ "id": 11, "result": {} }));
}

#[tokio::test]
async fn events_fan_out_to_every_active_session_in_identical_order() {
    let harness = Harness::new().await;
    let (page, _) = harness.page("https://example.com").await;

    let (s1, o1, mut rx1) = attach_active(&harness, &page, true).await;
    let (_s2, _o2, mut rx2) = attach_active(&harness, &page, true).await;

    // One session reloads; both observe the same lifecycle stream.
    harness
        .mux
        .route_request(&s1, &o1, r#"{"id":1,"method":"Page.reload","params":{}}"#)
        .unwrap();

    let mut events1 = Vec::new();
    let mut events2 = Vec::new();
    for _ in 0..2 {
        let frame = recv_json(&mut rx1).await;
        let inner: Value =
            serde_json::from_str(frame["params"]["message"].as_str().unwrap()).unwrap();
        if inner.get("method").is_some() {
            events1.push(inner["method"].as_str().unwrap().to_string());
        }
        let frame = recv_json(&mut rx2).await;
        let inner: Value =
            serde_json::from_str(frame["params"]["message"].as_str().unwrap()).unwrap();
        events2.push(inner["method"].as_str().unwrap().to_string());
    }

    assert_eq!(
        events2,
        vec!["Page.frameStartedLoading", "Page.loadEventFired"]
    );
    // rx1 interleaves the reload response with the events; the event order
    // it sees must match rx2's.
    let filtered1: Vec<_> = events1
        .iter()
        .filter(|m| m.starts_with("Page."))
        .cloned()
        .collect();
    assert_eq!(filtered1, events2[..filtered1.len()].to_vec());
}

#[tokio::test]
async fn inactive_sessions_receive_no_fan_out() {
    let harness = Harness::new().await;
    let (page, handle) = harness.page("https://example.com").await;

    let (active, _active_owner, mut rx_active) = attach_active(&harness, &page, false).await;
    let (tx, mut rx_dormant) = mpsc::unbounded_channel();
    let _dormant = harness
        .mux
        .attach_client(&page, &ConnectionId::new(), false, tx)
        .await
        .unwrap();

    harness.surface.reload(&handle).await.unwrap();

    let first = recv_json(&mut rx_active).await;
    assert_eq!(first["method"], "Page.frameStartedLoading");
    assert!(timeout(Duration::from_millis(100), rx_dormant.recv())
        .await
        .is_err());
    drop(active);
}

#[tokio::test]
async fn unknown_session_is_reported() {
    let harness = Harness::new().await;
    let ghost = SessionId::new(PageId::new(), 99);
    assert!(harness
        .mux
        .route_request(&ghost, &ConnectionId::new(), r#"{"id":1,"method":"Page.enable"}"#)
        .is_err());
}

#[tokio::test]
async fn unknown_target_fails_attach() {
    let harness = Harness::new().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = harness
        .mux
        .attach_client(&PageId::new(), &ConnectionId::new(), false, tx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Target not found"));
}

#[tokio::test]
async fn page_destruction_cancels_sessions_and_releases_binding() {
    let harness = Harness::new().await;
    let bus = FleetBus::new(16);
    harness.mux.spawn_fleet_listener(&bus);

    let (page, handle) = harness.page("https://example.com").await;
    let (session, _owner, _rx) = attach_active(&harness, &page, false).await;

    bus.publish(FleetEvent::PageDestroyed {
        browser: magi_core_types::BrowserId::new(),
        page: page.clone(),
    })
    .await;

    // Wait for the listener to process the event.
    timeout(Duration::from_secs(1), async {
        while harness.mux.has_sessions(&page) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("sessions torn down");

    assert!(harness.mux.session_owner(&session).is_none());
    // Binding was released; the surface channel is free again.
    let binding = harness.surface.attach_debugger(&handle).await.unwrap();
    harness.surface.detach_debugger(&binding).await.unwrap();
}

#[tokio::test]
async fn connection_close_detaches_all_owned_sessions() {
    let harness = Harness::new().await;
    let (page_a, _) = harness.page("https://a.example").await;
    let (page_b, _) = harness.page("https://b.example").await;

    let owner = ConnectionId::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let s_a = harness
        .mux
        .attach_client(&page_a, &owner, true, tx.clone())
        .await
        .unwrap();
    let s_b = harness
        .mux
        .attach_client(&page_b, &owner, true, tx)
        .await
        .unwrap();

    harness.mux.detach_connection(&owner).await;

    assert!(harness.mux.session_owner(&s_a).is_none());
    assert!(harness.mux.session_owner(&s_b).is_none());
    assert!(!harness.mux.has_sessions(&page_a));
    assert!(!harness.mux.has_sessions(&page_b));
}

#[tokio::test]
async fn debugger_failure_becomes_an_error_response_to_the_issuer_only() {
    let harness = Harness::new().await;
    let (page, _) = harness.page("https://example.com").await;

    let (session, owner, mut rx) = attach_active(&harness, &page, false).await;

    // Page.navigate without a url makes the stub surface report a command
    // failure.
    harness
        .mux
        .route_request(&session, &owner, r#"{"id":5,"method":"Page.navigate","params":{}}"#)
        .unwrap();

    let frame = recv_json(&mut rx).await;
    assert_eq!(frame["id"], 5);
    assert_eq!(frame["error"]["code"], -32000);
    assert!(frame["error"]["message"].as_str().unwrap().contains("url"));
}

#[tokio::test]
async fn foreign_connections_cannot_touch_another_clients_session() {
    let harness = Harness::new().await;
    let (page, _) = harness.page("https://example.com").await;

    let (session, owner, mut rx) = attach_active(&harness, &page, false).await;
    let intruder = ConnectionId::new();

    // Detach by a connection that never attached: same error as an unknown
    // session, and the session stays alive.
    let err = harness
        .mux
        .detach_session(&session, &intruder)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Session not found"));
    assert!(harness.mux.session_owner(&session).is_some());
    assert!(harness.mux.has_sessions(&page));

    // Command injection is rejected the same way; the owner's writer stays
    // silent.
    let err = harness
        .mux
        .route_request(
            &session,
            &intruder,
            r#"{"id":1,"method":"Network.enable","params":{}}"#,
        )
        .unwrap_err();
    assert!(err.to_string().contains("Session not found"));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    // The rightful owner is unaffected.
    harness
        .mux
        .route_request(
            &session,
            &owner,
            r#"{"id":2,"method":"Network.enable","params":{}}"#,
        )
        .unwrap();
    let frame = recv_json(&mut rx).await;
    assert_eq!(frame, json!({"id":2,"result":{}}));
    harness.mux.detach_session(&session, &owner).await.unwrap();
    assert!(!harness.mux.has_sessions(&page));
}
