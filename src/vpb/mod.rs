//! C7 — VPB Manager.

pub mod manager;

pub use manager::{Clock, SystemClock, VpbManager};
