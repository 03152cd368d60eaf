//! Ordered key/value abstractions shared by the replicated and standalone stores
//!
//! - `KVStore`: synchronous ordered reads over a point-in-time map
//! - `KVTransaction`: buffered reads/writes with an explicit commit
//! - `KVDatabase`: a source of transactions

mod memory;
mod mutations;
mod range;
mod simple;
mod view;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::Result;

pub use memory::{decode_snapshot, encode_snapshot, MemoryKVStore};
pub use mutations::{Mutations, WriteState};
pub use range::{key_after, prefix_end, KeyRange, KeyRanges};
pub use simple::{SimpleKVDatabase, SimpleTransaction};
pub use view::TransactionView;

/// Materialized ordered state
pub type KVMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KVPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KVPair {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self { key, value }
    }
}

/// Ordered reads over unsigned-lexicographic keys
pub trait KVStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Smallest key `>= min` and `< max`
    fn get_at_least(&self, min: &[u8], max: Option<&[u8]>) -> Option<KVPair>;

    /// Largest key `< max` and `>= min`
    fn get_at_most(&self, max: &[u8], min: Option<&[u8]>) -> Option<KVPair>;

    fn get_range(&self, range: &KeyRange, reverse: bool) -> Vec<KVPair>;
}

/// A unit of work against one store.
///
/// Writes are buffered until [`commit`](KVTransaction::commit). After commit or rollback
/// (successful or not) every further call fails with `Error::TransactionClosed`.
#[async_trait]
pub trait KVTransaction: Send {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn get_at_least(&mut self, min: &[u8], max: Option<&[u8]>) -> Result<Option<KVPair>>;
    fn get_at_most(&mut self, max: &[u8], min: Option<&[u8]>) -> Result<Option<KVPair>>;
    fn get_range(&mut self, range: &KeyRange, reverse: bool) -> Result<Vec<KVPair>>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn remove(&mut self, key: &[u8]) -> Result<()>;
    fn remove_range(&mut self, range: &KeyRange) -> Result<()>;

    /// Commit the buffered writes atomically.
    ///
    /// Fails with `Conflict` if something this transaction read was changed by a transaction
    /// that committed after this one began, `NotLeader` if no leader could accept the commit,
    /// or `CommitIndeterminate` if the outcome could not be learned in time.
    async fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self);
}

#[async_trait]
pub trait KVDatabase: Send + Sync {
    async fn create_transaction(&self) -> Result<Box<dyn KVTransaction>>;
}
