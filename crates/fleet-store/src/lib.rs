//! Authoritative in-memory model of browsers, pages, ordering, activity and
//! navigation state. Source of truth for CDP discovery payloads.

mod model;
mod store;

pub use model::{
    BrowserRecord, BrowserSnapshot, BrowserSpec, FleetSnapshot, NavigationState, PageInit,
    PageRecord, PageRemoval, Thumbnail,
};
pub use store::FleetStore;
