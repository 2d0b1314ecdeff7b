//! The background worker loop.
//!
//! A [`WorkerRunner`] drives one [`BackgroundWorker`] on its own tokio task:
//! wait for the interval, call `work`, repeat. A failing tick is fatal. The
//! loop tears itself down, reports a [`DeadWorker`] to the supervisor and
//! leaves the restart decision there, since the state of a half-done tick
//! must not be resumed blindly.

use crate::error::{SmithyError, SmithyResult};
use crate::events::{SharedEventBus, SmithyEvent};
use async_trait::async_trait;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// One unit of periodic background work
#[async_trait]
pub trait BackgroundWorker: Send + Sync + 'static {
    /// Name used in logs and events
    fn name(&self) -> &'static str;

    /// Process one bounded batch
    async fn work(&self) -> SmithyResult<()>;
}

/// A worker whose loop ended on a failed tick
#[derive(Debug)]
pub struct DeadWorker {
    pub name: &'static str,
    pub error: SmithyError,
    /// Successful ticks before the failure
    pub ticks: u64,
    pub died_at: SystemTime,
}

/// How a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Asked to stop
    Stopped,
    /// A tick failed
    Crashed,
}

/// Handle on a running worker loop
pub struct WorkerRunner {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<WorkerExit>,
}

impl WorkerRunner {
    /// Start the loop of `worker` on a new task
    pub fn spawn(
        worker: Box<dyn BackgroundWorker>,
        interval: Duration,
        death_tx: mpsc::Sender<DeadWorker>,
        events: SharedEventBus,
    ) -> Self {
        let name = worker.name();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(worker, interval, shutdown_rx, death_tx, events));
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    /// Worker name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop task ended
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the loop, letting a running tick complete
    pub async fn stop(self) -> WorkerExit {
        let _ = self.shutdown_tx.send(true);
        match self.handle.await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!(worker = self.name, "🔨 Worker task ended badly: {}", e);
                WorkerExit::Crashed
            }
        }
    }
}

async fn run_loop(
    worker: Box<dyn BackgroundWorker>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    death_tx: mpsc::Sender<DeadWorker>,
    events: SharedEventBus,
) -> WorkerExit {
    let name = worker.name();
    tracing::info!(worker = name, "🔨 Worker going up");
    let mut ticks = 0u64;

    let exit = loop {
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.changed() => break WorkerExit::Stopped,
        }
        if *shutdown_rx.borrow() {
            break WorkerExit::Stopped;
        }

        match worker.work().await {
            Ok(()) => ticks += 1,
            Err(error) => {
                tracing::error!(worker = name, "🔨 Worker tick failed: {}", error);
                events.emit(SmithyEvent::WorkerCrashed {
                    worker: name.to_string(),
                    error: error.to_string(),
                });
                let dead = DeadWorker {
                    name,
                    error,
                    ticks,
                    died_at: SystemTime::now(),
                };
                if death_tx.send(dead).await.is_err() {
                    tracing::warn!(worker = name, "🔨 No supervisor to report to");
                }
                break WorkerExit::Crashed;
            }
        }
    };

    // dropping the worker closes its connection
    drop(worker);
    tracing::info!(worker = name, "🔨 Worker going down after {} ticks ({:?})", ticks, exit);
    exit
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::BroadcastEventBus;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Counts ticks and fails on tick `fail_at` (0 = never)
    pub(crate) struct FakeWorker {
        pub ticks: Arc<AtomicU64>,
        pub fail_at: u64,
    }

    #[async_trait]
    impl BackgroundWorker for FakeWorker {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn work(&self) -> SmithyResult<()> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if tick == self.fail_at {
                return Err(SmithyError::config("tick failed"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runner_stops_on_request() {
        let ticks = Arc::new(AtomicU64::new(0));
        let (death_tx, mut death_rx) = mpsc::channel(4);
        let runner = WorkerRunner::spawn(
            Box::new(FakeWorker {
                ticks: ticks.clone(),
                fail_at: 0,
            }),
            Duration::from_millis(5),
            death_tx,
            crate::events::noop(),
        );

        sleep(Duration::from_millis(60)).await;
        assert_eq!(runner.name(), "fake");
        assert_eq!(runner.stop().await, WorkerExit::Stopped);
        assert!(ticks.load(Ordering::SeqCst) > 1);
        assert!(death_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_tick_is_fatal() {
        let ticks = Arc::new(AtomicU64::new(0));
        let bus = BroadcastEventBus::new(4);
        let mut events = bus.subscribe();
        let (death_tx, mut death_rx) = mpsc::channel(4);
        let runner = WorkerRunner::spawn(
            Box::new(FakeWorker {
                ticks: ticks.clone(),
                fail_at: 3,
            }),
            Duration::from_millis(1),
            death_tx,
            Arc::new(bus),
        );

        let dead = tokio::time::timeout(Duration::from_secs(2), death_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dead.name, "fake");
        assert_eq!(dead.ticks, 2);
        assert_eq!(events.recv().await.unwrap().name(), "workerCrashed");

        assert_eq!(runner.stop().await, WorkerExit::Crashed);
        // no tick after the failure
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
