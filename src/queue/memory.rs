use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Instant};

use super::{Delivery, JobEnvelope, JobQueue, QueueResult};

#[derive(Default)]
struct Inner {
    next_id: i64,
    ready: VecDeque<(i64, i32, JobEnvelope)>,
    in_flight: HashMap<i64, (i32, JobEnvelope)>,
    extensions: HashMap<i64, usize>,
}

/// In-process [`JobQueue`]. Unacknowledged deliveries stay in flight until
/// [`MemoryJobQueue::redeliver_unacked`] puts them back, mirroring an
/// expired lease.
#[derive(Default)]
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn redeliver_unacked(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut expired: Vec<(i64, (i32, JobEnvelope))> = inner.in_flight.drain().collect();
        expired.sort_by_key(|(id, _)| *id);
        let count = expired.len();
        for (id, (deliveries, envelope)) in expired {
            inner.ready.push_back((id, deliveries, envelope));
        }
        drop(inner);
        for _ in 0..count {
            self.notify.notify_one();
        }
        count
    }

    pub async fn ready_len(&self) -> usize {
        self.inner.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    /// Lease extensions requested for `receipt` while it was in flight.
    pub async fn lease_extensions(&self, receipt: i64) -> usize {
        self.inner
            .lock()
            .await
            .extensions
            .get(&receipt)
            .copied()
            .unwrap_or(0)
    }

    pub async fn ready_envelopes(&self) -> Vec<JobEnvelope> {
        let inner = self.inner.lock().await;
        inner.ready.iter().map(|(_, _, env)| env.clone()).collect()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> QueueResult<i64> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.ready.push_back((id, 0, envelope));
        drop(inner);
        self.notify.notify_one();
        Ok(id)
    }

    async fn receive(&self, wait: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some((id, deliveries, envelope)) = inner.ready.pop_front() {
                    let deliveries = deliveries + 1;
                    inner.in_flight.insert(id, (deliveries, envelope.clone()));
                    return Ok(Some(Delivery {
                        receipt: id,
                        deliveries,
                        envelope,
                    }));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if timeout(deadline - now, self.notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn extend_lease(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.contains_key(&delivery.receipt) {
            *inner.extensions.entry(delivery.receipt).or_default() += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn unacked_delivery_comes_back() {
        let queue = MemoryJobQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(JobEnvelope::encode(id)).await.unwrap();

        let first = queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.deliveries, 1);
        assert!(queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        assert_eq!(queue.redeliver_unacked().await, 1);
        let second = queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.receipt, first.receipt);
        assert_eq!(second.deliveries, 2);

        queue.ack(&second).await.unwrap();
        assert_eq!(queue.redeliver_unacked().await, 0);
    }

    #[tokio::test]
    async fn receive_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(MemoryJobQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .enqueue(JobEnvelope::encode(Uuid::new_v4()))
            .await
            .unwrap();
        let delivery = consumer.await.unwrap().unwrap();
        assert!(delivery.is_some());
    }
}
