use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct DrainState {
    outstanding: AtomicUsize,
    draining: AtomicBool,
    released: Notify,
}

/// Counts outstanding users of an object so its destruction can wait for
/// them. Taking a lock never waits; only [`Drainer::drain`] does.
#[derive(Debug, Clone, Default)]
pub struct Drainer {
    inner: Arc<DrainState>,
}

/// One outstanding user. Released on drop.
#[derive(Debug)]
pub struct DrainLock {
    inner: Arc<DrainState>,
}

impl Drainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> DrainLock {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        DrainLock {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Resolves once every lock taken so far (and any taken while waiting)
    /// has been released.
    pub async fn drain(&self) {
        self.inner.draining.store(true, Ordering::Release);
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for DrainLock {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.released.notify_waiters();
        }
    }
}
