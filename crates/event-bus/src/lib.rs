//! Typed in-process publish/subscribe. Fleet lifecycle changes flow through
//! one bus instance; the gateway's broadcast bridge and the session
//! multiplexer subscribe to it independently.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use magi_core_types::{BrowserId, PageId};

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

#[async_trait]
pub trait EventBus<E>: Send + Sync
where
    E: Event,
{
    async fn publish(&self, event: E);
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// In-memory bus backed by a tokio broadcast channel. Publish order is
/// delivery order for every subscriber.
pub struct InMemoryBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl<E> EventBus<E> for InMemoryBus<E>
where
    E: Event,
{
    async fn publish(&self, event: E) {
        // A bus with no subscribers simply drops the event.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

/// Helper to materialise an mpsc receiver from the bus subscription
/// so callers can await events without handling broadcast semantics directly.
pub fn to_mpsc<E>(bus: Arc<InMemoryBus<E>>, capacity: usize) -> mpsc::Receiver<E>
where
    E: Event,
{
    let mut rx = bus.subscribe();
    let (tx, out_rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        while let Ok(ev) = rx.recv().await {
            if tx.send(ev).await.is_err() {
                break;
            }
        }
    });
    out_rx
}

/// Lifecycle events published by the surface supervisor. These are the only
/// message types the fleet bus carries.
#[derive(Clone, Debug)]
pub enum FleetEvent {
    BrowserCreated {
        browser: BrowserId,
    },
    BrowserDestroyed {
        browser: BrowserId,
    },
    PageCreated {
        browser: BrowserId,
        page: PageId,
        after: Option<PageId>,
        url: String,
        title: String,
    },
    PageDestroyed {
        browser: BrowserId,
        page: PageId,
    },
    PageActivated {
        browser: BrowserId,
        page: Option<PageId>,
    },
    PageNavigated {
        browser: BrowserId,
        page: PageId,
        url: String,
        failed: bool,
    },
    PageTitleChanged {
        browser: BrowserId,
        page: PageId,
        title: String,
    },
    PageFaviconChanged {
        browser: BrowserId,
        page: PageId,
        favicon: Option<String>,
    },
}

impl FleetEvent {
    /// Browser the event is scoped to; used by per-connection filters.
    pub fn browser(&self) -> &BrowserId {
        match self {
            FleetEvent::BrowserCreated { browser }
            | FleetEvent::BrowserDestroyed { browser }
            | FleetEvent::PageCreated { browser, .. }
            | FleetEvent::PageDestroyed { browser, .. }
            | FleetEvent::PageActivated { browser, .. }
            | FleetEvent::PageNavigated { browser, .. }
            | FleetEvent::PageTitleChanged { browser, .. }
            | FleetEvent::PageFaviconChanged { browser, .. } => browser,
        }
    }
}

/// The bus instance shared across the gateway components.
pub type FleetBus = InMemoryBus<FleetEvent>;
