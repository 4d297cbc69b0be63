//! Lifecycle coordination between externally-initiated target operations and
//! internally-initiated ones. Owns the surfaces; every mutation lands in the
//! fleet store and every lifecycle change goes out on the bus exactly once.

mod supervisor;

pub use supervisor::{CreatePageOptions, SurfaceSupervisor, DEFAULT_HOME_URL};
