//! Per-connection submission order.
//!
//! Every request takes a submission id when it is read off the wire and
//! releases it once it has begun executing. The oldest id still held is
//! published through a watch channel; a no-reply-wait barrier holding id `n`
//! resumes once that value reaches `n`, meaning everything submitted before
//! it has started.

use crate::interrupt::{Interrupted, wait_interruptible};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct OrderState {
    next_id: u64,
    outstanding: BTreeSet<u64>,
}

#[derive(Debug)]
pub struct SubmissionOrder {
    state: Mutex<OrderState>,
    oldest: watch::Sender<u64>,
}

/// A held submission slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct QueryId {
    value: u64,
    order: Arc<SubmissionOrder>,
}

impl SubmissionOrder {
    pub fn new() -> Arc<Self> {
        let (oldest, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(OrderState::default()),
            oldest,
        })
    }

    pub fn issue(self: &Arc<Self>) -> QueryId {
        let mut state = self.state.lock();
        let value = state.next_id;
        state.next_id += 1;
        state.outstanding.insert(value);
        QueryId {
            value,
            order: Arc::clone(self),
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        if !state.outstanding.remove(&id) {
            return;
        }
        let oldest = state
            .outstanding
            .first()
            .copied()
            .unwrap_or(state.next_id);
        // Published under the state lock so concurrent releases cannot
        // overwrite a newer value with an older one.
        self.oldest.send_if_modified(|current| {
            if *current == oldest {
                false
            } else {
                *current = oldest;
                true
            }
        });
    }

    pub fn oldest_outstanding(&self) -> u64 {
        *self.oldest.borrow()
    }

    pub fn next_id(&self) -> u64 {
        self.state.lock().next_id
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Waits until the oldest outstanding id equals `id`.
    pub async fn wait_for_oldest(
        &self,
        id: u64,
        interruptor: &CancellationToken,
    ) -> Result<(), Interrupted> {
        let mut rx = self.oldest.subscribe();
        wait_interruptible(
            async move {
                // The sender lives as long as `self`, so this cannot observe
                // a closed channel.
                let _ = rx.wait_for(|oldest| *oldest == id).await;
            },
            interruptor,
        )
        .await
    }
}

impl QueryId {
    pub fn value(&self) -> u64 {
        self.value
    }
}

impl Drop for QueryId {
    fn drop(&mut self) {
        self.order.release(self.value);
    }
}
