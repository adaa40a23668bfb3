//! Inbound message handling.

pub mod fix;
pub mod router;

pub use fix::{FixHandler, FixOutcome};
pub use router::Router;
