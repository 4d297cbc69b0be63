//! Attach readiness. The first session on a page must not dispatch commands
//! until the surface accepts them; this waits through three explicit states
//! (`fresh` settle, `loading` drain, `idle` settle) under one total deadline.

use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use magi_surface::{PageEvent, PageHandle, Surface};

#[derive(Clone, Copy, Debug)]
pub struct ReadyConfig {
    pub initial_settle: Duration,
    pub load_timeout: Duration,
    pub final_settle: Duration,
}

impl Default for ReadyConfig {
    fn default() -> Self {
        Self {
            initial_settle: Duration::from_millis(150),
            load_timeout: Duration::from_secs(3),
            final_settle: Duration::from_millis(100),
        }
    }
}

impl ReadyConfig {
    pub fn max_total(&self) -> Duration {
        self.initial_settle + self.load_timeout + self.final_settle
    }
}

/// Waits until the page is ready for debugger commands, bounded by
/// `cfg.max_total()`. On timeout the caller proceeds anyway; the debugger
/// will either succeed or surface a normal CDP error.
pub async fn await_page_ready(surface: &dyn Surface, page: &PageHandle, cfg: &ReadyConfig) {
    let deadline = Instant::now() + cfg.max_total();

    sleep(cfg.initial_settle).await;

    let loading = surface
        .page_state(page)
        .map(|state| state.loading)
        .unwrap_or(false);
    if loading {
        if let Ok(mut events) = surface.page_events(page) {
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    debug!(target: "session-mux", page = %page.0, "readiness wait timed out");
                    return;
                }
                match timeout(remaining, events.recv()).await {
                    Ok(Ok(PageEvent::LoadFinished { .. })) | Ok(Ok(PageEvent::Closed)) => break,
                    Ok(Ok(_)) => continue,
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        }
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    sleep(cfg.final_settle.min(remaining)).await;
}
