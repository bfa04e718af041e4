//! Stream observation: deriving typed learnings from events.

pub mod extractor;

pub use extractor::{spawn_realtime, ExtractorConfig, LearningExtractor, ObserverStats};
