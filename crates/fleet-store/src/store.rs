use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::warn;

use magi_core_types::{BrowserId, GatewayError, GatewayResult, PageId};

use crate::model::{
    BrowserRecord, BrowserSnapshot, BrowserSpec, FleetSnapshot, PageInit, PageRecord, PageRemoval,
};

#[derive(Default)]
struct FleetState {
    browsers: HashMap<BrowserId, BrowserRecord>,
    /// Browser creation order; the head is the "first browser" used by the
    /// unqualified discovery endpoints.
    order: Vec<BrowserId>,
    pages: HashMap<PageId, PageRecord>,
}

/// Single-writer, many-reader in-memory database of browser and page
/// records. Every mutation holds the write lock for its whole duration, so
/// readers always observe records that satisfy the ordering and membership
/// invariants.
#[derive(Default)]
pub struct FleetStore {
    state: RwLock<FleetState>,
}

impl FleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_browser(&self, spec: BrowserSpec) -> BrowserRecord {
        let id = BrowserId::new();
        let record = BrowserRecord::new(id.clone(), spec);
        let mut state = self.state.write();
        state.browsers.insert(id.clone(), record.clone());
        state.order.push(id);
        record
    }

    /// Removes the browser and all child pages. Returns the removed page ids
    /// in list order; empty when the browser was absent.
    pub fn delete_browser(&self, browser: &BrowserId) -> Vec<PageId> {
        let mut state = self.state.write();
        let Some(record) = state.browsers.remove(browser) else {
            return Vec::new();
        };
        state.order.retain(|id| id != browser);
        for page in &record.pages {
            state.pages.remove(page);
        }
        record.pages
    }

    pub fn insert_page(
        &self,
        browser: &BrowserId,
        init: PageInit,
        after: Option<&PageId>,
    ) -> GatewayResult<PageRecord> {
        let id = PageId::new();
        let mut state = self.state.write();
        if !state.browsers.contains_key(browser) {
            return Err(GatewayError::TargetNotFound(browser.to_string()));
        }
        let record = PageRecord::new(id.clone(), browser.clone(), init);
        state.pages.insert(id.clone(), record.clone());
        let browser_record = state
            .browsers
            .get_mut(browser)
            .ok_or_else(|| GatewayError::internal("browser vanished under write lock"))?;
        let position = match after {
            Some(anchor) => match browser_record.pages.iter().position(|p| p == anchor) {
                Some(idx) => idx + 1,
                None => {
                    warn!(
                        target: "fleet-store",
                        browser = %browser,
                        anchor = %anchor,
                        "insert anchor not in browser; appending"
                    );
                    browser_record.pages.len()
                }
            },
            None => browser_record.pages.len(),
        };
        browser_record.pages.insert(position, id);
        Ok(record)
    }

    /// Removes a page. When the removed page was active, the successor is the
    /// page to its right, else to its left, else none; the successor is
    /// activated before the lock is released.
    pub fn remove_page(&self, browser: &BrowserId, page: &PageId) -> Option<PageRemoval> {
        let mut state = self.state.write();
        state.pages.remove(page)?;
        let browser_record = state.browsers.get_mut(browser)?;
        let idx = browser_record.pages.iter().position(|p| p == page)?;
        browser_record.pages.remove(idx);

        let mut removal = PageRemoval { activated: None };
        if browser_record.active_page.as_ref() == Some(page) {
            let successor = browser_record
                .pages
                .get(idx)
                .or_else(|| idx.checked_sub(1).and_then(|left| browser_record.pages.get(left)))
                .cloned();
            browser_record.active_page = successor.clone();
            removal.activated = Some(successor.clone());
            if let Some(next) = successor {
                if let Some(next_record) = state.pages.get_mut(&next) {
                    next_record.is_active = true;
                    next_record.last_active_at = Utc::now();
                }
            }
        }
        Some(removal)
    }

    /// Updates the active pointer. Idempotent; a page outside the browser is
    /// rejected so the membership invariant holds.
    pub fn set_active_page(
        &self,
        browser: &BrowserId,
        page: Option<&PageId>,
    ) -> GatewayResult<()> {
        let mut state = self.state.write();
        let browser_record = state
            .browsers
            .get_mut(browser)
            .ok_or_else(|| GatewayError::TargetNotFound(browser.to_string()))?;
        if let Some(page) = page {
            if !browser_record.pages.contains(page) {
                return Err(GatewayError::TargetNotFound(page.to_string()));
            }
        }
        let previous = browser_record.active_page.clone();
        browser_record.active_page = page.cloned();
        if let Some(prev) = previous {
            if let Some(record) = state.pages.get_mut(&prev) {
                record.is_active = false;
            }
        }
        if let Some(page) = page {
            if let Some(record) = state.pages.get_mut(page) {
                record.is_active = true;
                record.last_active_at = Utc::now();
            }
        }
        Ok(())
    }

    /// Applies a pure transform to a page record; no-op if absent.
    pub fn mutate_page<F>(&self, page: &PageId, mutate: F)
    where
        F: FnOnce(&mut PageRecord),
    {
        let mut state = self.state.write();
        if let Some(record) = state.pages.get_mut(page) {
            mutate(record);
        }
    }

    pub fn get_browser(&self, browser: &BrowserId) -> Option<BrowserRecord> {
        self.state.read().browsers.get(browser).cloned()
    }

    pub fn get_page(&self, page: &PageId) -> Option<PageRecord> {
        self.state.read().pages.get(page).cloned()
    }

    pub fn first_browser(&self) -> Option<BrowserId> {
        self.state.read().order.first().cloned()
    }

    pub fn browser_count(&self) -> usize {
        self.state.read().order.len()
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        let state = self.state.read();
        let browsers = state
            .order
            .iter()
            .filter_map(|id| state.browsers.get(id))
            .map(|record| BrowserSnapshot {
                record: record.clone(),
                page_records: record
                    .pages
                    .iter()
                    .filter_map(|page| state.pages.get(page))
                    .cloned()
                    .collect(),
            })
            .collect();
        FleetSnapshot { browsers }
    }
}
