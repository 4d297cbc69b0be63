//! Shared mapping from fleet page ids to engine handles. The supervisor
//! writes it on page creation/destruction; the session multiplexer reads it
//! when acquiring debugger bindings.

use dashmap::DashMap;

use magi_core_types::PageId;

use crate::PageHandle;

#[derive(Default)]
pub struct PageDirectory {
    entries: DashMap<PageId, PageHandle>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, page: PageId, handle: PageHandle) {
        self.entries.insert(page, handle);
    }

    pub fn remove(&self, page: &PageId) {
        self.entries.remove(page);
    }

    pub fn get(&self, page: &PageId) -> Option<PageHandle> {
        self.entries.get(page).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, page: &PageId) -> bool {
        self.entries.contains_key(page)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
