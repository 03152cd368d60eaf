//! Failover between the replicated cluster and a standalone local store

mod coordinator;
mod strategy;

pub use coordinator::{ActiveStore, FallbackKVDatabase, FallbackState, FallbackTransaction, Transition};
pub use strategy::{MergeStrategy, MergeStrategyRegistry, NullMergeStrategy, OverwriteMergeStrategy};
