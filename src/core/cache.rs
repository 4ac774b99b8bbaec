//! Process-wide sharing of loaded model weights.
//!
//! Loading a GGUF checkpoint is expensive, and an expert/amateur pair is often
//! rebuilt with different decoding settings. Models are cloned out of the
//! cache; clones share their weights behind an `Arc`, while every generation
//! still creates its own inference context.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Implemented by model option types to derive a stable cache key.
pub trait ModelOptions {
    fn cache_key(&self) -> String;
}

type Entries = HashMap<(TypeId, String), Arc<dyn Any + Send + Sync>>;

/// A thread-safe cache of loaded models keyed by type and option string.
#[derive(Default)]
pub struct WeightCache {
    entries: Mutex<Entries>,
}

impl WeightCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached model for `key`, or load it with `loader` and cache it.
    ///
    /// The lock is not held while `loader` runs, so two concurrent misses on
    /// the same key may both load; the later insert wins.
    pub async fn get_or_load<M, F, Fut>(&self, key: &str, loader: F) -> anyhow::Result<M>
    where
        M: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<M>>,
    {
        let entry_key = (TypeId::of::<M>(), key.to_string());

        if let Some(model) = self
            .entries
            .lock()
            .await
            .get(&entry_key)
            .and_then(|cached| cached.downcast_ref::<M>())
        {
            tracing::debug!(key, "model weights served from cache");
            return Ok(model.clone());
        }

        let model = loader().await?;
        self.entries
            .lock()
            .await
            .insert(entry_key, Arc::new(model.clone()));

        Ok(model)
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

static GLOBAL_WEIGHT_CACHE: once_cell::sync::Lazy<WeightCache> =
    once_cell::sync::Lazy::new(WeightCache::new);

/// The cache shared by every pipeline in the process.
pub fn global_cache() -> &'static WeightCache {
    &GLOBAL_WEIGHT_CACHE
}
