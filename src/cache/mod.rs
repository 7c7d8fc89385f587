//! Per-connection table of outstanding queries.
//!
//! A [`QueryCache`] maps client tokens to tracked queries. Each request
//! against a token goes through a [`QueryHandle`], which holds the query's
//! lock for the duration of one response. A query leaves the table when the
//! handle that drives it to completion is dropped; its memory is reclaimed on
//! a spawned task once every queued handle has let go of it.

mod entry;
mod handle;

pub use entry::EntryState;
pub use handle::QueryHandle;

use crate::cache::entry::{Entry, EntryOptions};
use crate::context::ServerContext;
use crate::error::CacheError;
use crate::ordering::SubmissionOrder;
use crate::params::QueryParams;
use crate::query::VarScope;
use crate::query::backtrace::{Backtrace, BacktraceRegistry};
use crate::query::error::CompileError;
use crate::response::{Response, ResponseType};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Administrative view of one outstanding query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryJob {
    pub job_id: Uuid,
    pub cache_id: u64,
    pub token: i64,
    pub client_addr: SocketAddr,
    pub start_time_ms: u64,
    pub duration_ms: u64,
    pub noreply: bool,
    pub profile: bool,
    pub state: EntryState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub tracked: usize,
    pub created_total: u64,
    pub terminated_total: u64,
    pub destroyed_total: u64,
}

#[derive(Debug, Default)]
struct CacheTelemetry {
    created_total: AtomicU64,
    terminated_total: AtomicU64,
    destroyed_total: AtomicU64,
}

pub struct QueryCache {
    id: u64,
    context: Arc<ServerContext>,
    client_addr: SocketAddr,
    return_empty_normal_batches: bool,
    submission: Arc<SubmissionOrder>,
    queries: Mutex<HashMap<i64, Arc<Entry>>>,
    telemetry: Arc<CacheTelemetry>,
}

impl QueryCache {
    /// Creates the cache for a newly accepted connection and registers it
    /// with the server context.
    pub fn new(
        context: Arc<ServerContext>,
        client_addr: SocketAddr,
        return_empty_normal_batches: bool,
    ) -> Arc<Self> {
        let id = context.registry().allocate_id();
        let cache = Arc::new(Self {
            id,
            context,
            client_addr,
            return_empty_normal_batches,
            submission: SubmissionOrder::new(),
            queries: Mutex::new(HashMap::new()),
            telemetry: Arc::new(CacheTelemetry::default()),
        });
        cache
            .context
            .registry()
            .register(id, Arc::downgrade(&cache));
        cache
    }

    /// Creates a cache that takes the empty-batch behaviour from the server
    /// config.
    pub fn with_config_defaults(context: Arc<ServerContext>, client_addr: SocketAddr) -> Arc<Self> {
        let return_empty_normal_batches = context.config().return_empty_normal_batches;
        Self::new(context, client_addr, return_empty_normal_batches)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn return_empty_normal_batches(&self) -> bool {
        self.return_empty_normal_batches
    }

    pub fn submission_order(&self) -> &Arc<SubmissionOrder> {
        &self.submission
    }

    pub fn len(&self) -> usize {
        self.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.lock().is_empty()
    }

    pub fn contains(&self, token: i64) -> bool {
        self.queries.lock().contains_key(&token)
    }

    /// Tokens currently tracked, ascending.
    pub fn tokens(&self) -> Vec<i64> {
        let mut tokens: Vec<i64> = self.queries.lock().keys().copied().collect();
        tokens.sort_unstable();
        tokens
    }

    pub fn jobs(&self) -> Vec<QueryJob> {
        let queries = self.queries.lock();
        let mut jobs: Vec<QueryJob> = queries
            .iter()
            .map(|(token, entry)| entry.job(self.id, *token, self.client_addr))
            .collect();
        jobs.sort_by_key(|job| job.token);
        jobs
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            tracked: self.len(),
            created_total: self.telemetry.created_total.load(Ordering::Relaxed),
            terminated_total: self.telemetry.terminated_total.load(Ordering::Relaxed),
            destroyed_total: self.telemetry.destroyed_total.load(Ordering::Relaxed),
        }
    }

    /// Compiles the query in `params` and starts tracking it under its
    /// token. The returned handle already holds the new query's lock.
    pub async fn create(
        self: &Arc<Self>,
        params: &mut QueryParams,
        interruptor: &CancellationToken,
    ) -> Result<QueryHandle, CacheError> {
        debug_assert_eq!(params.cache_id(), self.id, "params issued by another cache");
        params.maybe_release_query_id();
        let token = params.token();
        if self.contains(token) {
            return Err(CacheError::duplicate_token(token));
        }
        let Some(mut raw_term) = params.take_root_term() else {
            return Err(CacheError::client(format!(
                "Query for token {token} has no term."
            )));
        };

        let compiler = self.context.compiler();
        let mut bt_reg = BacktraceRegistry::new();
        let compiled = compiler
            .preprocess(&mut raw_term, &mut bt_reg)
            .and_then(|()| compiler.compile(&VarScope::new(), &raw_term));
        let root_term = match compiled {
            Ok(term) => term,
            Err(CompileError::Query { message, frame }) => {
                return Err(CacheError::Compile {
                    message,
                    backtrace: bt_reg.datum_backtrace(frame),
                });
            }
            Err(CompileError::Datum(message)) => {
                return Err(CacheError::Compile {
                    message,
                    backtrace: Backtrace::empty(),
                });
            }
        };

        let entry = Arc::new(Entry::new(
            EntryOptions {
                noreply: params.noreply(),
                profile: params.profile(),
            },
            bt_reg,
            params.take_global_optargs(),
            root_term,
        ));

        let handle = {
            let mut queries = self.queries.lock();
            if queries.contains_key(&token) {
                return Err(CacheError::duplicate_token(token));
            }
            let handle =
                QueryHandle::acquire_fresh(Arc::clone(self), token, Arc::clone(&entry), interruptor)?;
            queries.insert(token, Arc::clone(&entry));
            handle
        };
        self.telemetry.created_total.fetch_add(1, Ordering::Relaxed);
        debug!(
            cache_id = self.id,
            token,
            job_id = %entry.job_id(),
            noreply = entry.noreply(),
            "query created"
        );
        Ok(handle)
    }

    /// Returns a handle on an already tracked query, waiting for whichever
    /// handle currently holds it.
    pub async fn get(
        self: &Arc<Self>,
        params: &mut QueryParams,
        interruptor: &CancellationToken,
    ) -> Result<QueryHandle, CacheError> {
        params.maybe_release_query_id();
        let token = params.token();
        let entry = self.lookup(token).ok_or_else(|| CacheError::unknown_token(token))?;
        QueryHandle::acquire(Arc::clone(self), token, entry, interruptor).await
    }

    /// Resolves once every request submitted on this connection before
    /// `params` has begun executing. `params` must still hold its submission
    /// slot.
    pub async fn noreply_wait(
        &self,
        params: &QueryParams,
        interruptor: &CancellationToken,
    ) -> Result<(), CacheError> {
        debug_assert!(params.holds_query_id(), "barrier released its own slot");
        let token = params.token();
        if self.contains(token) {
            return Err(CacheError::duplicate_token(token));
        }
        self.submission
            .wait_for_oldest(params.id(), interruptor)
            .await?;
        Ok(())
    }

    /// Forces the query tracked under `params`' token to finish. Does
    /// nothing for an untracked token and never waits for an in-flight
    /// handle.
    pub fn terminate_query(&self, params: &QueryParams) {
        if let Some(entry) = self.lookup(params.token()) {
            self.terminate_internal(&entry);
        }
    }

    /// Forces the query with `job_id` to finish. Returns whether it is
    /// tracked by this cache.
    pub fn terminate_job(&self, job_id: Uuid) -> bool {
        let entry = self
            .queries
            .lock()
            .values()
            .find(|entry| entry.job_id() == job_id)
            .cloned();
        match entry {
            Some(entry) => {
                self.terminate_internal(&entry);
                true
            }
            None => false,
        }
    }

    /// Client-initiated STOP: terminates the query, waits for any in-flight
    /// handle to observe it, and reclaims it.
    pub async fn stop(
        self: &Arc<Self>,
        params: &mut QueryParams,
        interruptor: &CancellationToken,
    ) -> Result<Response, CacheError> {
        params.maybe_release_query_id();
        let token = params.token();
        let entry = self.lookup(token).ok_or_else(|| CacheError::unknown_token(token))?;
        self.terminate_internal(&entry);
        let handle = QueryHandle::acquire(Arc::clone(self), token, entry, interruptor).await?;
        drop(handle);

        let mut res = Response::new();
        res.set_type(ResponseType::SuccessSequence);
        Ok(res)
    }

    fn lookup(&self, token: i64) -> Option<Arc<Entry>> {
        self.queries.lock().get(&token).cloned()
    }

    pub(crate) fn terminate_internal(&self, entry: &Entry) {
        if entry.terminate() {
            self.telemetry
                .terminated_total
                .fetch_add(1, Ordering::Relaxed);
            info!(cache_id = self.id, job_id = %entry.job_id(), "query terminated");
        }
    }

    /// Removes `token` if it still maps to `entry`.
    pub(crate) fn unlink(&self, token: i64, entry: &Arc<Entry>) -> bool {
        let mut queries = self.queries.lock();
        match queries.get(&token) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                queries.remove(&token);
                true
            }
            _ => false,
        }
    }

    /// Waits for the entry's outstanding handles on a separate task, then
    /// frees it. Outside a runtime nothing can still be queued on it.
    pub(crate) fn defer_destroy(&self, entry: Arc<Entry>) {
        let telemetry = Arc::clone(&self.telemetry);
        let cache_id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    entry.drainer().drain().await;
                    let job_id = entry.job_id();
                    drop(entry);
                    telemetry.destroyed_total.fetch_add(1, Ordering::Relaxed);
                    trace!(cache_id, job_id = %job_id, "query entry destroyed");
                });
            }
            Err(_) => {
                let job_id = entry.job_id();
                drop(entry);
                telemetry.destroyed_total.fetch_add(1, Ordering::Relaxed);
                trace!(cache_id, job_id = %job_id, "query entry destroyed without a runtime");
            }
        }
    }
}

impl Drop for QueryCache {
    fn drop(&mut self) {
        let remaining = self.queries.get_mut().len();
        self.context.registry().unregister(self.id);
        debug!(cache_id = self.id, remaining, "query cache closed");
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("id", &self.id)
            .field("client_addr", &self.client_addr)
            .field("tracked", &self.len())
            .finish_non_exhaustive()
    }
}
