//! Intent resolution — what does a chat message ask for?
//!
//! 1. Pattern stage (regex, no network)
//! 2. Classifier fallback (LLM) for free-form text
//! 3. Project resolution when no project was named

pub mod classifier;
pub mod engine;
pub mod patterns;
pub mod resolver;
pub mod types;

pub use classifier::{IntentClassifier, RigClassifier};
pub use engine::IntentEngine;
pub use patterns::PatternMatcher;
pub use resolver::{ProjectResolver, Resolution};
pub use types::{ChatIntent, ClassifierGuess, Command, IntentContext};
