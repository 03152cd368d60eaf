//! Merge strategies used when the fallback coordinator switches stores

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::{Error, Result};
use crate::kv::{KVTransaction, KeyRange};

/// Reconciles two stores during a fallback transition.
///
/// On success `dst` must be committed with the merged content and `src` committed too.
/// The two commits are separate: a crash between them leaves `dst` merged and `src`
/// untouched, which every strategy must tolerate on the next attempt.
#[async_trait]
pub trait MergeStrategy: Send + Sync {
    /// Registry key, e.g. `"overwrite"`
    fn name(&self) -> &str;

    /// `last_active_time` is when the replicated cluster was last seen healthy, if ever
    async fn merge_and_commit(
        &self,
        src: &mut dyn KVTransaction,
        dst: &mut dyn KVTransaction,
        last_active_time: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Replace everything in `dst` with the content of `src`
#[derive(Debug, Default, Clone, Copy)]
pub struct OverwriteMergeStrategy;

impl OverwriteMergeStrategy {
    /// Copy without committing either side; returns how many pairs were copied
    pub fn overwrite(src: &mut dyn KVTransaction, dst: &mut dyn KVTransaction) -> Result<usize> {
        let everything = KeyRange::full();
        dst.remove_range(&everything)?;
        let pairs = src.get_range(&everything, false)?;
        for pair in &pairs {
            dst.put(&pair.key, &pair.value)?;
        }
        Ok(pairs.len())
    }
}

#[async_trait]
impl MergeStrategy for OverwriteMergeStrategy {
    fn name(&self) -> &str {
        "overwrite"
    }

    async fn merge_and_commit(
        &self,
        src: &mut dyn KVTransaction,
        dst: &mut dyn KVTransaction,
        _last_active_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let copied = match Self::overwrite(src, dst) {
            Ok(n) => n,
            Err(e) => {
                src.rollback();
                dst.rollback();
                return Err(e);
            }
        };
        if let Err(e) = dst.commit().await {
            src.rollback();
            return Err(e);
        }
        src.commit().await?;
        tracing::info!("Overwrite merge copied {} pairs", copied);
        Ok(())
    }
}

/// Leave both stores as they are
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMergeStrategy;

#[async_trait]
impl MergeStrategy for NullMergeStrategy {
    fn name(&self) -> &str {
        "null"
    }

    async fn merge_and_commit(
        &self,
        src: &mut dyn KVTransaction,
        dst: &mut dyn KVTransaction,
        _last_active_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Err(e) = dst.commit().await {
            src.rollback();
            return Err(e);
        }
        src.commit().await
    }
}

/// Strategies by name
pub struct MergeStrategyRegistry {
    strategies: HashMap<String, Arc<dyn MergeStrategy>>,
}

impl MergeStrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.strategies.insert(
            OverwriteMergeStrategy.name().to_string(),
            Arc::new(OverwriteMergeStrategy),
        );
        registry
            .strategies
            .insert(NullMergeStrategy.name().to_string(), Arc::new(NullMergeStrategy));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn MergeStrategy>) -> Result<()> {
        let name = strategy.name().to_string();
        if self.strategies.contains_key(&name) {
            return Err(Error::InvalidConfig(format!(
                "merge strategy '{}' is already registered",
                name
            )));
        }
        self.strategies.insert(name, strategy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MergeStrategy>> {
        self.strategies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for MergeStrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KVPair, SimpleKVDatabase};

    async fn seed(db: &SimpleKVDatabase, pairs: &[(&str, &str)]) {
        let mut tx = db.begin();
        for (k, v) in pairs {
            tx.put(k.as_bytes(), v.as_bytes()).unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_replaces_destination() {
        let src = SimpleKVDatabase::in_memory();
        let dst = SimpleKVDatabase::in_memory();
        seed(&src, &[("a", "1"), ("b", "2")]).await;
        seed(&dst, &[("a", "old"), ("z", "gone")]).await;

        let mut s = src.begin();
        let mut d = dst.begin();
        OverwriteMergeStrategy
            .merge_and_commit(&mut s, &mut d, None)
            .await
            .unwrap();

        assert_eq!(dst.dump(), src.dump());
        assert_eq!(
            src.dump(),
            vec![
                KVPair::new(b"a".to_vec(), b"1".to_vec()),
                KVPair::new(b"b".to_vec(), b"2".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_overwrite_is_idempotent() {
        let src = SimpleKVDatabase::in_memory();
        let dst = SimpleKVDatabase::in_memory();
        seed(&src, &[("k1", "v1"), ("k2", "v2")]).await;
        seed(&dst, &[("x", "y")]).await;

        for _ in 0..2 {
            let mut s = src.begin();
            let mut d = dst.begin();
            OverwriteMergeStrategy
                .merge_and_commit(&mut s, &mut d, None)
                .await
                .unwrap();
        }
        assert_eq!(dst.dump(), src.dump());
    }

    #[tokio::test]
    async fn test_null_strategy_copies_nothing() {
        let src = SimpleKVDatabase::in_memory();
        let dst = SimpleKVDatabase::in_memory();
        seed(&src, &[("a", "1")]).await;

        let mut s = src.begin();
        let mut d = dst.begin();
        NullMergeStrategy
            .merge_and_commit(&mut s, &mut d, Some(Utc::now()))
            .await
            .unwrap();
        assert!(dst.is_empty());
        assert_eq!(src.len(), 1);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = MergeStrategyRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["null", "overwrite"]);
        assert_eq!(registry.get("overwrite").unwrap().name(), "overwrite");
        assert!(registry.get("last-writer-wins").is_none());
        assert!(registry.register(Arc::new(NullMergeStrategy)).is_err());
    }
}
