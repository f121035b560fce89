//! Background loops that keep requests and ledger entries moving without a
//! caller: fulfillment polling, expiry sweeps, sequence resolution, receipt
//! confirmation and deferred payout credits.

use crate::config::WagerConfig;
use crate::coordinator::SettlementCoordinator;
use crate::errors::WagerResult;
use crate::treasury::TreasuryLedger;
use crate::types::now_millis;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIntervals {
    pub poll: Duration,
    pub sweep: Duration,
    pub resolve: Duration,
    pub confirm: Duration,
    pub credit_retry: Duration,
}

impl WorkerIntervals {
    pub fn from_config(config: &WagerConfig) -> Self {
        let sweep = Duration::from_millis(config.tracker.sweep_interval_ms);
        Self {
            poll: Duration::from_millis(config.tracker.poll_interval_ms),
            sweep,
            resolve: Duration::from_millis(config.resolver.resolve_interval_ms),
            confirm: Duration::from_millis(config.treasury.confirmation_interval_ms),
            credit_retry: sweep,
        }
    }
}

/// Running background tasks. Dropping this without `shutdown` leaves the
/// tasks running until the runtime stops.
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn spawn(
        coordinator: Arc<SettlementCoordinator>,
        ledger: Arc<TreasuryLedger>,
        intervals: WorkerIntervals,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut handles = Vec::new();

        let c = coordinator.clone();
        handles.push(spawn_loop("fulfillment_poll", intervals.poll, rx.clone(), move || {
            let c = c.clone();
            async move { c.poll_fulfillments().await }
        }));

        let c = coordinator.clone();
        handles.push(spawn_loop("expiry_sweep", intervals.sweep, rx.clone(), move || {
            let c = c.clone();
            async move { c.sweep(now_millis()).await }
        }));

        let c = coordinator.clone();
        handles.push(spawn_loop("sequence_resolve", intervals.resolve, rx.clone(), move || {
            let c = c.clone();
            async move { c.resolve_pending().await }
        }));

        let l = ledger;
        handles.push(spawn_loop("receipt_confirm", intervals.confirm, rx.clone(), move || {
            let l = l.clone();
            async move { l.confirm_pending().await.map(|settled| settled.len()) }
        }));

        let c = coordinator;
        handles.push(spawn_loop("credit_retry", intervals.credit_retry, rx, move || {
            let c = c.clone();
            async move { c.retry_pending_credits().await }
        }));

        info!(tasks = handles.len(), "Background workers started");
        Self { shutdown, handles }
    }

    /// Signal every loop to stop and wait for the in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for joined in futures::future::join_all(self.handles).await {
            if let Err(e) = joined {
                warn!(error = %e, "Worker did not exit cleanly");
            }
        }
        info!("Background workers stopped");
    }
}

fn spawn_loop<F, Fut>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, mut pass: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = WagerResult<usize>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(worker = name, ?period, "Worker started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match pass().await {
                Ok(0) => {}
                Ok(n) => debug!(worker = name, processed = n, "Worker pass complete"),
                Err(e) if e.class().is_fatal() => error!(worker = name, error = %e, "Worker pass failed"),
                Err(e) => warn!(worker = name, error = %e, "Worker pass failed"),
            }
        }
        debug!(worker = name, "Worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_loop_runs_until_shutdown() {
        let passes = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);
        let counter = passes.clone();
        let handle = spawn_loop("test", Duration::from_millis(5), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let seen = passes.load(Ordering::SeqCst);
        assert!(seen >= 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(passes.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_intervals_follow_config() {
        let mut config = WagerConfig::default();
        config.tracker.poll_interval_ms = 250;
        config.treasury.confirmation_interval_ms = 1_000;
        let intervals = WorkerIntervals::from_config(&config);
        assert_eq!(intervals.poll, Duration::from_millis(250));
        assert_eq!(intervals.confirm, Duration::from_secs(1));
        assert_eq!(intervals.credit_retry, intervals.sweep);
    }
}
