//! WebSocket upgrade and the per-connection read/write tasks. Each accepted
//! socket gets one writer task draining an unbounded queue (total frame order
//! per connection) and one read loop owning all connection state.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use magi_core_types::{BrowserId, ConnectionId, PageId, SessionId};
use magi_event_bus::EventBus;

use crate::connection::BrowserConnection;
use crate::gateway::GatewayCtx;
use crate::metrics;
use crate::protocol::{error_frame_for, CdpRequest};

pub async fn browser_upgrade_default(
    State(ctx): State<GatewayCtx>,
    ws: WebSocketUpgrade,
) -> Response {
    // The bare browser path resolves to the first live browser; that is what
    // tools discovering via /json/version dial.
    match ctx.store.first_browser() {
        Some(browser) => {
            ws.on_upgrade(move |socket| run_browser_connection(ctx, browser, socket))
        }
        None => {
            metrics::record_rejected_upgrade();
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

pub async fn browser_upgrade(
    State(ctx): State<GatewayCtx>,
    Path(browser_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let browser = BrowserId(browser_id);
    if ctx.store.get_browser(&browser).is_none() {
        metrics::record_rejected_upgrade();
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| run_browser_connection(ctx, browser, socket))
}

pub async fn page_upgrade(
    State(ctx): State<GatewayCtx>,
    Path(page_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let page = PageId(page_id);
    if ctx.store.get_page(&page).is_none() {
        metrics::record_rejected_upgrade();
        return StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| run_page_connection(ctx, page, socket))
}

fn spawn_writer(
    socket_sink: futures::stream::SplitSink<WebSocket, Message>,
) -> (mpsc::UnboundedSender<String>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let task = tokio::spawn(async move {
        let mut sink = socket_sink;
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });
    (tx, task)
}

async fn run_browser_connection(ctx: GatewayCtx, browser: BrowserId, socket: WebSocket) {
    metrics::connection_opened();
    let (sink, mut stream) = socket.split();
    let (writer, writer_task) = spawn_writer(sink);

    let mut conn = BrowserConnection::new(ctx.clone(), browser.clone(), writer);
    ctx.connections
        .insert(conn.connection_id().clone(), browser.clone());
    debug!(target: "cdp-gateway", conn = %conn.connection_id(), browser = %browser, "browser connection accepted");

    let mut fleet_rx = ctx.bus.subscribe();
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(err) = conn.handle_message(&text).await {
                        error!(target: "cdp-gateway", conn = %conn.connection_id(), %err, "invariant failure; closing connection");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target: "cdp-gateway", conn = %conn.connection_id(), %err, "socket error");
                    break;
                }
            },
            event = fleet_rx.recv() => match event {
                Ok(event) => conn.handle_fleet_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "cdp-gateway", conn = %conn.connection_id(), skipped, "fleet subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    ctx.connections.remove(conn.connection_id());
    conn.teardown().await;
    // Dropping the connection drops the writer sender; the writer task
    // drains what is queued, then exits.
    drop(conn);
    let _ = writer_task.await;
    metrics::connection_closed();
    debug!(target: "cdp-gateway", browser = %browser, "browser connection closed");
}

/// Page-scope connections carry one implicit session. Frames that arrive
/// while the multiplexer is still attaching are buffered and drained in
/// arrival order once it reports ready.
async fn run_page_connection(ctx: GatewayCtx, page: PageId, socket: WebSocket) {
    metrics::connection_opened();
    let (sink, mut stream) = socket.split();
    let (writer, writer_task) = spawn_writer(sink);
    let conn_id = ConnectionId::new();
    debug!(target: "cdp-gateway", conn = %conn_id, page = %page, "page connection accepted");

    let attach = {
        let ctx = ctx.clone();
        let page = page.clone();
        let conn_id = conn_id.clone();
        let writer = writer.clone();
        async move {
            ctx.mux
                .attach_client(&page, &conn_id, false, writer)
                .await
        }
    };
    tokio::pin!(attach);

    // State: attaching (buffering) until the mux signals readiness.
    let mut buffered: Vec<String> = Vec::new();
    let mut closed = false;
    let session = loop {
        tokio::select! {
            result = &mut attach => break Some(result),
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => buffered.push(text),
                Some(Ok(Message::Close(_))) | None => {
                    closed = true;
                    break None;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(target: "cdp-gateway", conn = %conn_id, %err, "socket error while attaching");
                    closed = true;
                    break None;
                }
            },
        }
    };

    match session {
        Some(Ok(session)) => {
            ctx.mux.activate_session(&session);
            for frame in buffered.drain(..) {
                route_page_frame(&ctx, &session, &conn_id, &writer, &frame);
            }
            if !closed {
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            route_page_frame(&ctx, &session, &conn_id, &writer, &text);
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            debug!(target: "cdp-gateway", conn = %conn_id, %err, "socket error");
                            break;
                        }
                    }
                }
            }
        }
        Some(Err(err)) => {
            warn!(target: "cdp-gateway", conn = %conn_id, page = %page, %err, "page attach failed");
        }
        None => {}
    }

    ctx.mux.detach_connection(&conn_id).await;
    drop(writer);
    let _ = writer_task.await;
    metrics::connection_closed();
    debug!(target: "cdp-gateway", conn = %conn_id, page = %page, "page connection closed");
}

fn route_page_frame(
    ctx: &GatewayCtx,
    session: &SessionId,
    conn: &ConnectionId,
    writer: &mpsc::UnboundedSender<String>,
    raw: &str,
) {
    metrics::record_forwarded();
    if let Err(err) = ctx.mux.route_request(session, conn, raw) {
        let id = CdpRequest::parse(raw)
            .ok()
            .and_then(|req| req.id)
            .unwrap_or(serde_json::Value::Null);
        let _ = writer.send(error_frame_for(&id, &err));
    }
}
