use crate::cache::{QueryCache, QueryJob};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::query::QueryCompiler;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use uuid::Uuid;

/// Live query caches, one per open client connection. Caches register on
/// construction and unregister when dropped.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<u64, Weak<QueryCache>>>,
    next_id: AtomicU64,
}

impl CacheRegistry {
    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, id: u64, cache: Weak<QueryCache>) {
        let previous = self.caches.write().insert(id, cache);
        debug_assert!(previous.is_none(), "cache id {id} registered twice");
        debug!(cache_id = id, "query cache registered");
    }

    pub(crate) fn unregister(&self, id: u64) {
        let removed = self.caches.write().remove(&id);
        debug_assert!(removed.is_some(), "cache id {id} was not registered");
        debug!(cache_id = id, "query cache unregistered");
    }

    pub fn len(&self) -> usize {
        self.caches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.read().is_empty()
    }

    /// Caches that are still alive, ordered by id.
    pub fn caches(&self) -> Vec<Arc<QueryCache>> {
        let guard = self.caches.read();
        let mut live: Vec<_> = guard.values().filter_map(Weak::upgrade).collect();
        live.sort_by_key(|cache| cache.id());
        live
    }
}

/// Server-wide state every connection's query cache is created against.
pub struct ServerContext {
    config: CacheConfig,
    compiler: Arc<dyn QueryCompiler>,
    registry: CacheRegistry,
}

impl ServerContext {
    pub fn new(
        config: CacheConfig,
        compiler: Arc<dyn QueryCompiler>,
    ) -> Result<Arc<Self>, CacheError> {
        config.validate()?;
        info!(
            array_limit = config.array_limit,
            batch_max_rows = config.batch_max_rows,
            batch_max_bytes = config.batch_max_bytes,
            batch_max_duration_ms = config.batch_max_duration_ms,
            first_batch_scaledown = config.first_batch_scaledown,
            "query cache context initialized"
        );
        Ok(Arc::new(Self {
            config,
            compiler,
            registry: CacheRegistry::default(),
        }))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn compiler(&self) -> &dyn QueryCompiler {
        self.compiler.as_ref()
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    /// Every outstanding query on every live connection.
    pub fn jobs(&self) -> Vec<QueryJob> {
        self.registry
            .caches()
            .iter()
            .flat_map(|cache| cache.jobs())
            .collect()
    }

    /// Terminates the query with `job_id` wherever it runs. Returns whether
    /// a matching query was found.
    pub fn kill_job(&self, job_id: Uuid) -> bool {
        self.registry
            .caches()
            .iter()
            .any(|cache| cache.terminate_job(job_id))
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
