use crate::cache::QueryJob;
use crate::drain::Drainer;
use crate::query::backtrace::BacktraceRegistry;
use crate::query::{CompiledTerm, DatumStream, GlobalOptargs};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, TryLockError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of one tracked query. Only ever moves forward, except that
/// `run` parks a freshly evaluated query in `Done` before deciding it is a
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Start,
    Stream,
    Done,
    Deleting,
}

/// Execution state only the handle holding the entry's lock may touch.
pub(crate) struct EntryBody {
    pub(crate) root_term: Option<Box<dyn CompiledTerm>>,
    pub(crate) stream: Option<Box<dyn DatumStream>>,
    pub(crate) has_sent_batch: bool,
}

pub(crate) struct Entry {
    state: Mutex<EntryState>,
    body: Arc<AsyncMutex<EntryBody>>,
    drainer: Drainer,
    persistent_interruptor: CancellationToken,
    bt_reg: BacktraceRegistry,
    global_optargs: Arc<GlobalOptargs>,
    job_id: Uuid,
    noreply: bool,
    profile: bool,
    start_time: SystemTime,
    started: Instant,
}

pub(crate) struct EntryOptions {
    pub(crate) noreply: bool,
    pub(crate) profile: bool,
}

impl Entry {
    pub(crate) fn new(
        options: EntryOptions,
        bt_reg: BacktraceRegistry,
        global_optargs: GlobalOptargs,
        root_term: Box<dyn CompiledTerm>,
    ) -> Self {
        Self {
            state: Mutex::new(EntryState::Start),
            body: Arc::new(AsyncMutex::new(EntryBody {
                root_term: Some(root_term),
                stream: None,
                has_sent_batch: false,
            })),
            drainer: Drainer::new(),
            persistent_interruptor: CancellationToken::new(),
            bt_reg,
            global_optargs: Arc::new(global_optargs),
            job_id: Uuid::new_v4(),
            noreply: options.noreply,
            profile: options.profile,
            start_time: SystemTime::now(),
            started: Instant::now(),
        }
    }

    pub(crate) fn state(&self) -> EntryState {
        *self.state.lock()
    }

    pub(crate) fn drainer(&self) -> &Drainer {
        &self.drainer
    }

    pub(crate) fn persistent_interruptor(&self) -> &CancellationToken {
        &self.persistent_interruptor
    }

    pub(crate) fn bt_reg(&self) -> &BacktraceRegistry {
        &self.bt_reg
    }

    pub(crate) fn global_optargs(&self) -> &Arc<GlobalOptargs> {
        &self.global_optargs
    }

    pub(crate) fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub(crate) fn noreply(&self) -> bool {
        self.noreply
    }

    pub(crate) fn profile(&self) -> bool {
        self.profile
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.persistent_interruptor.is_cancelled()
    }

    pub(crate) async fn lock_body(&self) -> OwnedMutexGuard<EntryBody> {
        Arc::clone(&self.body).lock_owned().await
    }

    pub(crate) fn try_lock_body(&self) -> Result<OwnedMutexGuard<EntryBody>, TryLockError> {
        Arc::clone(&self.body).try_lock_owned()
    }

    /// `Start -> Done` at the top of `run`.
    pub(crate) fn begin_run(&self) {
        let mut state = self.state.lock();
        if *state == EntryState::Start {
            *state = EntryState::Done;
        }
    }

    /// `Done -> Stream` once `run` retains a live stream. Refused when the
    /// query was terminated in the meantime.
    pub(crate) fn restore_stream(&self) -> bool {
        let mut state = self.state.lock();
        if *state != EntryState::Done || self.persistent_interruptor.is_cancelled() {
            return false;
        }
        *state = EntryState::Stream;
        true
    }

    /// `Stream -> Done` after the final batch.
    pub(crate) fn finish_stream(&self) {
        let mut state = self.state.lock();
        if *state == EntryState::Stream {
            *state = EntryState::Done;
        }
    }

    /// `Start | Stream -> Done` after a fault, without interrupting anyone.
    pub(crate) fn force_done(&self) {
        let mut state = self.state.lock();
        if matches!(*state, EntryState::Start | EntryState::Stream) {
            *state = EntryState::Done;
        }
    }

    /// Forces a live query onto its terminal trajectory and pulses its own
    /// interruptor. Returns `false` if it had already been terminated.
    pub(crate) fn terminate(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, EntryState::Start | EntryState::Stream) {
            *state = EntryState::Done;
        }
        // Pulsed under the state lock so `restore_stream` sees either both
        // effects or neither.
        let already = self.persistent_interruptor.is_cancelled();
        self.persistent_interruptor.cancel();
        !already
    }

    /// `Done -> Deleting`. Returns whether this call made the transition.
    pub(crate) fn mark_deleting(&self) -> bool {
        let mut state = self.state.lock();
        if *state != EntryState::Done {
            return false;
        }
        *state = EntryState::Deleting;
        true
    }

    pub(crate) fn job(&self, cache_id: u64, token: i64, client_addr: SocketAddr) -> QueryJob {
        QueryJob {
            job_id: self.job_id,
            cache_id,
            token,
            client_addr,
            start_time_ms: self
                .start_time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            duration_ms: self.started.elapsed().as_millis() as u64,
            noreply: self.noreply,
            profile: self.profile,
            state: self.state(),
        }
    }
}
