//! Window aggregation over the attempt log.

pub mod aggregator;

pub use aggregator::{aggregate, fail_rate, Aggregation, BucketGrid, ChannelRollup, TimeBucket};
