//! Session multiplexing over per-page debugger bindings: one binding per
//! page, N client sessions per binding, responses correlated back to the
//! session that issued them, events fanned out to every session.

mod mux;
mod ready;

pub use mux::{OutboundSender, SessionMultiplexer};
pub use ready::{await_page_ready, ReadyConfig};
