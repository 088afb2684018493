//! Read-only reporting over the persisted stage annotations.

pub mod aggregator;

pub use aggregator::AnalyticsAggregator;
