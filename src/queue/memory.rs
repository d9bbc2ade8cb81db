//! In-process broker.
//!
//! Keeps the two lanes in memory with broker-like delivery semantics: a
//! delivery dropped without an ack goes back to the front of its lane and is
//! marked redelivered. Nothing survives a restart.

use super::{Acker, Delivery, DeliveryStream, MessageBroker, QueueName};
use crate::error::{Error, Result};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Lane {
    items: Mutex<VecDeque<(Vec<u8>, bool)>>,
    ready: Notify,
    unacked: AtomicUsize,
}

impl Lane {
    fn items(&self) -> MutexGuard<'_, VecDeque<(Vec<u8>, bool)>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, payload: Vec<u8>) {
        self.items().push_back((payload, false));
        self.ready.notify_one();
    }

    fn requeue(&self, payload: Vec<u8>) {
        self.items().push_front((payload, true));
        self.ready.notify_one();
    }

    async fn next(self: &Arc<Self>) -> (Vec<u8>, bool) {
        loop {
            let popped = self.items().pop_front();
            if let Some(item) = popped {
                self.unacked.fetch_add(1, Ordering::SeqCst);
                return item;
            }
            self.ready.notified().await;
        }
    }
}

/// Outstanding delivery; requeued if dropped before [`PendingAck::ack`].
pub(crate) struct PendingAck {
    lane: Arc<Lane>,
    payload: Option<Vec<u8>>,
}

impl PendingAck {
    pub(crate) fn ack(mut self) {
        if self.payload.take().is_some() {
            self.lane.unacked.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            self.lane.unacked.fetch_sub(1, Ordering::SeqCst);
            self.lane.requeue(payload);
        }
    }
}

/// In-memory broker with one lane per [`QueueName`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    add: Arc<Lane>,
    del: Arc<Lane>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage for publish, depth, subscribe and probe.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Waiting plus unacknowledged messages in `queue`.
    pub fn pending(&self, queue: QueueName) -> usize {
        let lane = self.lane(queue);
        lane.items().len() + lane.unacked.load(Ordering::SeqCst)
    }

    fn lane(&self, queue: QueueName) -> &Arc<Lane> {
        match queue {
            QueueName::AddKey => &self.add,
            QueueName::DelKey => &self.del,
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Queue("in-memory broker unavailable".to_string()));
        }
        Ok(())
    }
}

impl MessageBroker for InMemoryBroker {
    async fn publish(&self, queue: QueueName, payload: Vec<u8>) -> Result<()> {
        self.ensure_available()?;
        self.lane(queue).push(payload);
        Ok(())
    }

    async fn queue_depth(&self, queue: QueueName) -> Result<u64> {
        self.ensure_available()?;
        Ok(self.lane(queue).items().len() as u64)
    }

    async fn subscribe(&self, queue: QueueName) -> Result<DeliveryStream> {
        self.ensure_available()?;
        let lane = self.lane(queue).clone();

        let stream = futures::stream::unfold(lane, |lane| async move {
            let (payload, redelivered) = lane.next().await;
            let delivery = Delivery {
                payload: payload.clone(),
                redelivered,
                acker: Acker::Memory(PendingAck {
                    lane: lane.clone(),
                    payload: Some(payload),
                }),
            };
            Some((Ok(delivery), lane))
        });
        Ok(stream.boxed())
    }

    async fn probe(&self, _timeout: Duration) -> bool {
        self.ensure_available().is_ok()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
