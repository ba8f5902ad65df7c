pub mod aggregator;
pub mod alerts;
pub mod contracts;
pub mod registry;
pub mod retention;
pub mod scraper;

pub use aggregator::MetricAggregator;
pub use alerts::AlertEvaluator;
pub use registry::MetricRegistry;
pub use retention::{RetentionEngine, RetentionPolicy};
pub use scraper::Scraper;
