//! Cache invalidation cascade.
//!
//! When a write tool completes, the partitions it dirties are
//! invalidated and, where the UI currently observes them, eagerly
//! refetched, along with the always-critical partitions. The cascade
//! is fire-and-forget relative to the stream: it runs on a spawned
//! task and never blocks delivery of further events.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use brokerdesk_core::cache::{CacheDependencyGraph, CachePartition};
use brokerdesk_core::domain::tool::ToolName;

/// The UI-side query cache, injected explicitly; there is no ambient
/// global cache client.
#[async_trait]
pub trait QueryCache: Send + Sync {
    fn is_observed(&self, partition: CachePartition) -> bool;
    async fn invalidate(&self, partition: CachePartition);
    async fn refetch(&self, partition: CachePartition);
}

pub struct InvalidationCascade {
    cache: Arc<dyn QueryCache>,
    graph: CacheDependencyGraph,
    fired: HashSet<ToolName>,
}

impl InvalidationCascade {
    pub fn new(cache: Arc<dyn QueryCache>) -> Self {
        Self { cache, graph: CacheDependencyGraph, fired: HashSet::new() }
    }

    /// Triggers the cascade for a successfully completed write tool.
    ///
    /// Read tools never trigger it, and a given tool name triggers at
    /// most once per turn even if its result is reported twice. The
    /// returned handle lets tests await the spawned work; production
    /// callers drop it.
    pub fn on_write_tool_completed(&mut self, tool: ToolName) -> Option<tokio::task::JoinHandle<()>> {
        if !tool.is_write() {
            return None;
        }
        if !self.fired.insert(tool) {
            tracing::debug!(
                event_name = "assistant.cache.cascade_deduplicated",
                tool_name = %tool,
                "cascade already fired for this tool in this turn"
            );
            return None;
        }

        let targets = self.graph.cascade_targets(tool);
        tracing::debug!(
            event_name = "assistant.cache.cascade_fired",
            tool_name = %tool,
            partitions = targets.len(),
            "invalidating cache partitions for completed write tool"
        );

        let cache = self.cache.clone();
        Some(tokio::spawn(async move {
            for partition in targets {
                cache.invalidate(partition).await;
                if cache.is_observed(partition) {
                    cache.refetch(partition).await;
                }
            }
        }))
    }
}

/// Recording fake for tests: tracks invalidations/refetches and lets a
/// test mark partitions as observed.
#[derive(Clone, Default)]
pub struct RecordingQueryCache {
    state: Arc<Mutex<RecordingState>>,
}

#[derive(Default)]
struct RecordingState {
    observed: HashSet<CachePartition>,
    invalidated: Vec<CachePartition>,
    refetched: Vec<CachePartition>,
}

impl RecordingQueryCache {
    pub fn observe(&self, partition: CachePartition) {
        self.lock().observed.insert(partition);
    }

    pub fn invalidated(&self) -> Vec<CachePartition> {
        self.lock().invalidated.clone()
    }

    pub fn refetched(&self) -> Vec<CachePartition> {
        self.lock().refetched.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl QueryCache for RecordingQueryCache {
    fn is_observed(&self, partition: CachePartition) -> bool {
        self.lock().observed.contains(&partition)
    }

    async fn invalidate(&self, partition: CachePartition) {
        self.lock().invalidated.push(partition);
    }

    async fn refetch(&self, partition: CachePartition) {
        self.lock().refetched.push(partition);
    }
}
