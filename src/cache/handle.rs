use crate::cache::QueryCache;
use crate::cache::entry::{Entry, EntryBody, EntryState};
use crate::drain::DrainLock;
use crate::error::CacheError;
use crate::interrupt::{CombinedInterruptor, wait_interruptible};
use crate::profile::{ProfileTrace, maybe_make_profile_trace};
use crate::query::backtrace::Backtrace;
use crate::query::batch::{BatchSpec, BatchType};
use crate::query::error::EvalError;
use crate::query::{Datum, EvalEnv, Value};
use crate::response::{Response, ResponseType};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Exclusive access to one tracked query for the duration of a single
/// response. Dropping the handle reclaims the query once it has finished.
pub struct QueryHandle {
    cache: Arc<QueryCache>,
    token: i64,
    entry: Arc<Entry>,
    body: OwnedMutexGuard<EntryBody>,
    interruptor: CombinedInterruptor,
    trace: Option<ProfileTrace>,
    _drain_lock: DrainLock,
}

impl QueryHandle {
    /// Waits for the entry's lock. The drain lock is taken first so the
    /// entry cannot be destroyed while this handle is queued.
    pub(crate) async fn acquire(
        cache: Arc<QueryCache>,
        token: i64,
        entry: Arc<Entry>,
        interruptor: &CancellationToken,
    ) -> Result<Self, CacheError> {
        let drain_lock = entry.drainer().lock();
        let body = wait_interruptible(entry.lock_body(), interruptor).await?;
        Ok(Self::assemble(cache, token, entry, body, interruptor, drain_lock))
    }

    /// Locks an entry nobody else can see yet.
    pub(crate) fn acquire_fresh(
        cache: Arc<QueryCache>,
        token: i64,
        entry: Arc<Entry>,
        interruptor: &CancellationToken,
    ) -> Result<Self, CacheError> {
        let drain_lock = entry.drainer().lock();
        let body = entry.try_lock_body().map_err(|_| CacheError::Runtime {
            message: format!("Query for token {token} was locked before it was tracked."),
            backtrace: Backtrace::empty(),
        })?;
        Ok(Self::assemble(cache, token, entry, body, interruptor, drain_lock))
    }

    fn assemble(
        cache: Arc<QueryCache>,
        token: i64,
        entry: Arc<Entry>,
        body: OwnedMutexGuard<EntryBody>,
        interruptor: &CancellationToken,
        drain_lock: DrainLock,
    ) -> Self {
        let interruptor =
            CombinedInterruptor::new(interruptor.clone(), entry.persistent_interruptor().clone());
        let trace = maybe_make_profile_trace(entry.profile());
        Self {
            cache,
            token,
            entry,
            body,
            interruptor,
            trace,
            _drain_lock: drain_lock,
        }
    }

    pub fn token(&self) -> i64 {
        self.token
    }

    pub fn job_id(&self) -> Uuid {
        self.entry.job_id()
    }

    pub fn state(&self) -> EntryState {
        self.entry.state()
    }

    pub fn noreply(&self) -> bool {
        self.entry.noreply()
    }

    /// Evaluates the query on first use, then serves the next batch of its
    /// stream. Faults are returned for the caller to turn into an error
    /// response; the query is terminal afterwards.
    pub async fn fill_response(&mut self, res: &mut Response) -> Result<(), CacheError> {
        match self.entry.state() {
            EntryState::Start | EntryState::Stream => {}
            _ if self.entry.is_terminated() => return Err(CacheError::terminated_externally()),
            _ => return Err(CacheError::duplicate_token(self.token)),
        }

        let mut env = EvalEnv::new(
            Arc::clone(self.cache.context()),
            self.interruptor.clone(),
            Arc::clone(self.entry.global_optargs()),
            self.cache.return_empty_normal_batches(),
            self.trace.take(),
        );
        let outcome = self.advance(&mut env, res).await;
        self.trace = env.take_trace();

        match outcome {
            Ok(()) => {
                if let Some(trace) = &self.trace {
                    res.set_profile(trace.as_datum());
                }
                Ok(())
            }
            Err(EvalError::Interrupted) => self.on_interrupted(res),
            Err(EvalError::Query { message, frame }) => {
                self.entry.force_done();
                Err(CacheError::Runtime {
                    message,
                    backtrace: self.entry.bt_reg().datum_backtrace(frame),
                })
            }
            Err(EvalError::Generic(message)) => {
                self.entry.force_done();
                Err(CacheError::Runtime {
                    message,
                    backtrace: Backtrace::empty(),
                })
            }
        }
    }

    fn on_interrupted(&mut self, res: &mut Response) -> Result<(), CacheError> {
        if !self.interruptor.query_pulsed() {
            self.entry.force_done();
            return Err(CacheError::Interrupted);
        }
        if self.entry.state() == EntryState::Done {
            return Err(CacheError::terminated_externally());
        }
        // Query token pulsed without the entry being forced to `Done`.
        // `Entry::terminate` never does that, so only a token cancelled on
        // its own lands here; it still ends as an empty, finished sequence.
        self.cache.terminate_internal(&self.entry);
        res.clear();
        res.set_type(ResponseType::SuccessSequence);
        Ok(())
    }

    async fn advance(&mut self, env: &mut EvalEnv, res: &mut Response) -> Result<(), EvalError> {
        if self.entry.state() == EntryState::Start {
            let outcome = self.run(env, res).await;
            self.body.root_term = None;
            outcome?;
        }
        if self.entry.state() == EntryState::Stream {
            self.serve(env, res).await?;
        }
        Ok(())
    }

    async fn run(&mut self, env: &mut EvalEnv, res: &mut Response) -> Result<(), EvalError> {
        self.entry.begin_run();
        let interruptor = self.interruptor.clone();
        let started = Instant::now();

        let value = {
            let Some(term) = self.body.root_term.as_deref() else {
                return Err(EvalError::generic("Query term was already evaluated."));
            };
            interruptor.run(term.eval(env)).await??
        };
        if let Some(trace) = env.trace_mut() {
            trace.record_since("Evaluate query.", started);
        }

        match value {
            Value::Datum(datum) => {
                res.set_type(ResponseType::SuccessAtom);
                res.set_data(datum);
            }
            Value::Grouped(groups) => {
                let datum = groups.into_client_datum(env.config().array_limit)?;
                res.set_type(ResponseType::SuccessAtom);
                res.set_data(datum);
            }
            Value::Sequence(mut stream) => {
                match interruptor.run(stream.as_array(env)).await?? {
                    Some(items) => {
                        res.set_type(ResponseType::SuccessAtom);
                        res.set_data(Datum::Array(items));
                    }
                    None => {
                        self.body.stream = Some(stream);
                        self.body.has_sent_batch = false;
                        if !self.entry.restore_stream() {
                            return Err(EvalError::Interrupted);
                        }
                    }
                }
            }
            other => {
                return Err(EvalError::generic(format!(
                    "Query result must be of type DATUM, GROUPED_DATA, or STREAM (got {}).",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }

    async fn serve(&mut self, env: &mut EvalEnv, res: &mut Response) -> Result<(), EvalError> {
        let batch_type = if self.body.has_sent_batch {
            BatchType::Normal
        } else {
            BatchType::NormalFirst
        };
        let spec = BatchSpec::user(batch_type, env.config());
        let interruptor = self.interruptor.clone();
        let started = Instant::now();

        let body = &mut *self.body;
        let Some(stream) = body.stream.as_mut() else {
            return Err(EvalError::generic("Streaming query has no stream to read from."));
        };
        let batch = interruptor.run(stream.next_batch(env, spec)).await??;
        body.has_sent_batch = true;
        if let Some(trace) = env.trace_mut() {
            trace.record_since("Read batch.", started);
        }

        let feed_type = stream.feed_type();
        res.set_batch(batch);
        if stream.is_exhausted() || self.entry.noreply() {
            self.entry.finish_stream();
            res.set_type(ResponseType::SuccessSequence);
        } else {
            res.set_type(ResponseType::SuccessPartial);
        }
        match feed_type.note() {
            Some(note) => res.add_note(note),
            // An empty batch from a non-feed stream ends it.
            None if res.data().is_empty() && !res.is_final() => {
                self.entry.finish_stream();
                res.set_type(ResponseType::SuccessSequence);
            }
            None => {}
        }
        for note in stream.notes() {
            res.add_note(note);
        }
        Ok(())
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        if self.entry.state() == EntryState::Start {
            warn!(
                token = self.token,
                job_id = %self.entry.job_id(),
                "query handle released before the query was evaluated"
            );
            self.cache.terminate_internal(&self.entry);
        }
        if self.entry.mark_deleting() {
            self.cache.unlink(self.token, &self.entry);
            debug!(token = self.token, job_id = %self.entry.job_id(), "query finished");
            self.cache.defer_destroy(Arc::clone(&self.entry));
        }
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("cache_id", &self.cache.id())
            .field("token", &self.token)
            .field("job_id", &self.entry.job_id())
            .field("state", &self.entry.state())
            .finish_non_exhaustive()
    }
}
