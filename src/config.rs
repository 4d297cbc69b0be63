use std::env;

use magi_cdp_gateway::GatewayConfig;

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Gateway settings from the environment; CLI flags override these.
pub fn gateway_config_from_env() -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    if let Some(host) = env_string("MAGI_HOST") {
        cfg.host = host;
    }
    if let Some(port) = env_string("MAGI_PORT").and_then(|raw| raw.parse().ok()) {
        cfg.port = port;
    }
    if let Some(user_agent) = env_string("MAGI_USER_AGENT") {
        cfg.user_agent = user_agent;
    }
    cfg.enable_test_endpoints = env_flag("MAGI_TEST_ENDPOINTS");
    cfg
}
