use lazy_static::lazy_static;
use prometheus::{core::Collector, opts, IntCounter, IntCounterVec, IntGauge, Registry};
use tracing::error;

lazy_static! {
    static ref GATEWAY_CONNECTIONS: IntGauge = IntGauge::new(
        "magi_gateway_connections",
        "Currently accepted debug connections"
    )
    .unwrap();
    static ref GATEWAY_COMMANDS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "magi_gateway_commands_total",
            "Browser-scope commands handled, grouped by method"
        ),
        &["method"]
    )
    .unwrap();
    static ref GATEWAY_TARGET_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "magi_gateway_target_events_total",
            "Target lifecycle events broadcast to clients, grouped by kind"
        ),
        &["kind"]
    )
    .unwrap();
    static ref GATEWAY_FORWARDED_TOTAL: IntCounter = IntCounter::new(
        "magi_gateway_forwarded_total",
        "Session-scoped messages forwarded to the multiplexer"
    )
    .unwrap();
    static ref GATEWAY_REJECTED_UPGRADES_TOTAL: IntCounter = IntCounter::new(
        "magi_gateway_rejected_upgrades_total",
        "WebSocket upgrades rejected for unknown paths or targets"
    )
    .unwrap();
}

fn register<C>(registry: &Registry, collector: C)
where
    C: Collector + Clone + Send + Sync + 'static,
{
    if let Err(err) = registry.register(Box::new(collector.clone())) {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            error!(?err, "failed to register gateway metric");
        }
    }
}

pub fn register_metrics(registry: &Registry) {
    register(registry, GATEWAY_CONNECTIONS.clone());
    register(registry, GATEWAY_COMMANDS_TOTAL.clone());
    register(registry, GATEWAY_TARGET_EVENTS_TOTAL.clone());
    register(registry, GATEWAY_FORWARDED_TOTAL.clone());
    register(registry, GATEWAY_REJECTED_UPGRADES_TOTAL.clone());
}

pub fn connection_opened() {
    GATEWAY_CONNECTIONS.inc();
}

pub fn connection_closed() {
    GATEWAY_CONNECTIONS.dec();
}

pub fn record_command(method: &str) {
    GATEWAY_COMMANDS_TOTAL.with_label_values(&[method]).inc();
}

pub fn record_target_event(kind: &str) {
    GATEWAY_TARGET_EVENTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_forwarded() {
    GATEWAY_FORWARDED_TOTAL.inc();
}

pub fn record_rejected_upgrade() {
    GATEWAY_REJECTED_UPGRADES_TOTAL.inc();
}
