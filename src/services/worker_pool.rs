use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;

use super::orchestrator::{Disposition, Orchestrator};
use crate::config::WorkerConfig;
use crate::queue::{Delivery, JobEnvelope, JobQueue};

/// Competing consumers over one queue, each running one job at a time.
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn JobQueue>,
    settings: WorkerConfig,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, queue: Arc<dyn JobQueue>, settings: WorkerConfig) -> Self {
        Self {
            orchestrator,
            queue,
            settings,
        }
    }

    /// Runs until `shutdown` flips to true. A job in flight is finished
    /// before its worker exits.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let concurrency = self.settings.concurrency.max(1);
        log::info!("starting {} worker(s)", concurrency);

        let scheduler = tokio::spawn(schedule_sweeps(
            self.queue.clone(),
            self.settings.sweep_interval(),
            self.settings.stale_after(),
            shutdown.clone(),
        ));

        let workers = (0..concurrency).map(|index| {
            let orchestrator = self.orchestrator.clone();
            let queue = self.queue.clone();
            let timing = WorkerTiming {
                poll: self.settings.poll_timeout(),
                renew_lease: self.settings.heartbeat(),
            };
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker_loop(index, orchestrator, queue, timing, shutdown).await })
        });
        for result in join_all(workers).await {
            if let Err(err) = result {
                log::error!("worker task ended abnormally: {}", err);
            }
        }

        scheduler.abort();
        log::info!("worker pool stopped");
    }
}

#[derive(Debug, Clone, Copy)]
struct WorkerTiming {
    poll: Duration,
    renew_lease: Duration,
}

/// Drives `work` to completion, extending the lease of `delivery` every
/// `every` until it finishes.
async fn hold_lease<F>(
    queue: &dyn JobQueue,
    delivery: &Delivery,
    every: Duration,
    work: F,
) -> F::Output
where
    F: Future,
{
    tokio::pin!(work);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick() => {
                if let Err(err) = queue.extend_lease(delivery).await {
                    log::warn!("could not extend lease of receipt={}: {}", delivery.receipt, err);
                }
            }
        }
    }
}

async fn worker_loop(
    index: usize,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn JobQueue>,
    timing: WorkerTiming,
    mut shutdown: watch::Receiver<bool>,
) {
    let poll = timing.poll;
    log::debug!("worker={} started", index);
    loop {
        if *shutdown.borrow() {
            break;
        }
        let received = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            received = queue.receive(poll) => received,
        };
        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(err) => {
                log::error!("worker={} queue receive failed: {}", index, err);
                tokio::time::sleep(poll).await;
                continue;
            }
        };

        let disposition = hold_lease(
            queue.as_ref(),
            &delivery,
            timing.renew_lease,
            orchestrator.handle(&delivery),
        )
        .await;
        match disposition {
            Disposition::Ack => {
                if let Err(err) = queue.ack(&delivery).await {
                    log::error!(
                        "worker={} failed to ack receipt={}: {}",
                        index,
                        delivery.receipt,
                        err
                    );
                }
            }
            Disposition::Redeliver => log::debug!(
                "worker={} leaving receipt={} for redelivery",
                index,
                delivery.receipt
            ),
        }
    }
    log::debug!("worker={} stopped", index);
}

async fn schedule_sweeps(
    queue: Arc<dyn JobQueue>,
    every: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = queue.enqueue(JobEnvelope::check_stuck(stale_after)).await {
                    log::warn!("could not schedule stuck-video sweep: {}", err);
                }
            }
        }
    }
}
