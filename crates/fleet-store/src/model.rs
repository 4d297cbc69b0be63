use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use magi_core_types::{BrowserId, PageId};

/// Caller-supplied attributes for a new browser.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct BrowserSpec {
    pub name: String,
    pub partition_key: Option<String>,
    pub user_agent: Option<String>,
}

/// Caller-supplied attributes for a new page.
#[derive(Clone, Debug, Default)]
pub struct PageInit {
    pub url: String,
    pub title: String,
    pub favicon: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationState {
    pub can_go_back: bool,
    pub can_go_forward: bool,
    pub is_loading: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thumbnail {
    pub data_url: String,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserRecord {
    pub id: BrowserId,
    pub name: String,
    /// Isolation namespace for storage; browsers with distinct keys share
    /// nothing.
    pub partition_key: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Page order as exposed to clients in target lists.
    pub pages: Vec<PageId>,
    pub active_page: Option<PageId>,
}

impl BrowserRecord {
    pub fn new(id: BrowserId, spec: BrowserSpec) -> Self {
        let partition_key = spec
            .partition_key
            .unwrap_or_else(|| format!("magi-{}", id.as_str()));
        Self {
            id,
            name: spec.name,
            partition_key,
            user_agent: spec.user_agent,
            created_at: Utc::now(),
            pages: Vec::new(),
            active_page: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub id: PageId,
    pub browser: BrowserId,
    pub title: String,
    pub url: String,
    pub favicon: Option<String>,
    pub is_active: bool,
    pub navigation: NavigationState,
    pub thumbnail: Option<Thumbnail>,
    pub last_active_at: DateTime<Utc>,
}

impl PageRecord {
    pub fn new(id: PageId, browser: BrowserId, init: PageInit) -> Self {
        Self {
            id,
            browser,
            title: init.title,
            url: init.url,
            favicon: init.favicon,
            is_active: false,
            navigation: NavigationState::default(),
            thumbnail: None,
            last_active_at: Utc::now(),
        }
    }
}

/// One browser with its pages resolved, in list order.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSnapshot {
    #[serde(flatten)]
    pub record: BrowserRecord,
    pub page_records: Vec<PageRecord>,
}

/// Deep value copy of the fleet; callers may retain it without locking.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub browsers: Vec<BrowserSnapshot>,
}

impl FleetSnapshot {
    pub fn browser(&self, id: &BrowserId) -> Option<&BrowserSnapshot> {
        self.browsers.iter().find(|b| &b.record.id == id)
    }

    pub fn page(&self, id: &PageId) -> Option<&PageRecord> {
        self.browsers
            .iter()
            .flat_map(|b| b.page_records.iter())
            .find(|p| &p.id == id)
    }
}

/// Outcome of removing a page, for callers that must follow up with an
/// activation event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageRemoval {
    /// Set when the removed page was the active one; carries the successor.
    pub activated: Option<Option<PageId>>,
}
