//! Worker side of the bus — what a spawned worker uses to talk back.

pub mod reporter;

pub use reporter::{WorkerReporter, normalize_answer, parse_yes_no};
