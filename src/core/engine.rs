//! Worker supervision.
//!
//! The supervisor starts one [`WorkerRunner`] per worker factory and listens
//! for dead workers. A crashed worker is rebuilt (with a fresh connection)
//! and restarted after a backoff. Too many consecutive restarts open the
//! circuit and the worker stays down.

use crate::config::{DurationExt, WorkersConfig};
use crate::core::worker::{BackgroundWorker, DeadWorker, WorkerRunner};
use crate::error::{SmithyError, SmithyResult};
use crate::events::SharedEventBus;
use crate::utils::calculate_backoff;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Builds a worker, once at start and again on every restart
#[async_trait]
pub trait WorkerFactory: Send + Sync + 'static {
    /// Name of the built worker
    fn name(&self) -> &'static str;

    /// Build a worker with its own resources
    async fn build(&self) -> SmithyResult<Box<dyn BackgroundWorker>>;
}

type Runners = Arc<Mutex<HashMap<&'static str, WorkerRunner>>>;

/// Runs and restarts background workers
pub struct WorkerSupervisor {
    config: WorkersConfig,
    events: SharedEventBus,
    factories: Vec<Arc<dyn WorkerFactory>>,
    runners: Runners,
    shutdown_tx: watch::Sender<bool>,
    supervisor_handle: Option<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl WorkerSupervisor {
    /// Create a supervisor for the given workers
    pub fn new(
        config: WorkersConfig,
        events: SharedEventBus,
        factories: Vec<Arc<dyn WorkerFactory>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            events,
            factories,
            runners: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            supervisor_handle: None,
            is_running: AtomicBool::new(false),
        }
    }

    /// Whether the workers are running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Names of the workers currently running
    pub async fn running_workers(&self) -> Vec<&'static str> {
        let runners = self.runners.lock().await;
        let mut names: Vec<_> = runners
            .values()
            .filter(|r| !r.is_finished())
            .map(|r| r.name())
            .collect();
        names.sort_unstable();
        names
    }

    /// Build and start every worker, then start supervising them
    pub async fn start(&mut self) -> SmithyResult<()> {
        if self.is_running() {
            return Err(SmithyError::AlreadyRunning);
        }
        tracing::info!("🔨 Starting {} background workers", self.factories.len());

        let (death_tx, death_rx) = mpsc::channel::<DeadWorker>(self.factories.len().max(1));
        let interval = self.config.interval_ms.max(1).millis();
        {
            let mut runners = self.runners.lock().await;
            for factory in &self.factories {
                let worker = factory.build().await?;
                let runner =
                    WorkerRunner::spawn(worker, interval, death_tx.clone(), self.events.clone());
                runners.insert(factory.name(), runner);
            }
        }

        self.shutdown_tx.send_replace(false);
        let supervision = Supervision {
            config: self.config.clone(),
            events: self.events.clone(),
            factories: self
                .factories
                .iter()
                .map(|f| (f.name(), f.clone()))
                .collect(),
            runners: self.runners.clone(),
            death_tx,
        };
        self.supervisor_handle = Some(tokio::spawn(
            supervision.run(death_rx, self.shutdown_tx.subscribe()),
        ));
        self.is_running.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop supervising, then stop every worker
    pub async fn shutdown(&mut self) -> SmithyResult<()> {
        if !self.is_running() {
            return Err(SmithyError::NotRunning);
        }
        tracing::info!("🔨 Shutting down background workers...");
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.supervisor_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("🔨 Supervisor ended badly: {}", e);
            }
        }

        let runners: Vec<WorkerRunner> = self.runners.lock().await.drain().map(|(_, r)| r).collect();
        let stops = runners.into_iter().map(|runner| async move {
            let name = runner.name();
            let exit = runner.stop().await;
            tracing::debug!(worker = name, "🔨 Worker stopped ({:?})", exit);
        });
        join_all(stops).await;

        self.is_running.store(false, Ordering::Relaxed);
        tracing::info!("🔨 Background workers shut down");
        Ok(())
    }
}

/// Delay before the `restart`-th consecutive restart
fn restart_delay(restart: u32, config: &WorkersConfig) -> Duration {
    let delay = if restart <= 1 {
        config.restart_delay_ms
    } else {
        calculate_backoff(restart, u64::from(restart)).max(config.restart_delay_ms)
    };
    Duration::from_millis(delay)
}

struct Supervision {
    config: WorkersConfig,
    events: SharedEventBus,
    factories: HashMap<&'static str, Arc<dyn WorkerFactory>>,
    runners: Runners,
    death_tx: mpsc::Sender<DeadWorker>,
}

impl Supervision {
    async fn run(
        self,
        mut death_rx: mpsc::Receiver<DeadWorker>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::info!("🔨 Worker supervisor started");
        let mut restart_counts: HashMap<&'static str, u32> = HashMap::new();

        loop {
            let dead = tokio::select! {
                dead = death_rx.recv() => match dead {
                    Some(dead) => dead,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            let restarts = restart_counts.entry(dead.name).or_insert(0);
            // a worker that completed ticks since its last start is healthy again
            if dead.ticks > 0 {
                *restarts = 0;
            }

            loop {
                *restarts += 1;
                if *restarts > self.config.max_restart_count {
                    tracing::error!(
                        worker = dead.name,
                        "🔨 Worker died {} times in a row ({}), not restarting",
                        restarts,
                        dead.error
                    );
                    break;
                }

                let delay = restart_delay(*restarts, &self.config);
                tracing::warn!(
                    worker = dead.name,
                    "🔨 Worker died ({}), restarting in {:?} (restart #{})",
                    dead.error,
                    delay,
                    restarts
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        tracing::info!("🔨 Worker supervisor stopped");
                        return;
                    }
                }

                match self.restart(dead.name).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(worker = dead.name, "🔨 Failed to restart worker: {}", e)
                    }
                }
            }
        }

        tracing::info!("🔨 Worker supervisor stopped");
    }

    async fn restart(&self, name: &'static str) -> SmithyResult<()> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SmithyError::config(format!("unknown worker '{}'", name)))?;
        let worker = factory.build().await?;
        let runner = WorkerRunner::spawn(
            worker,
            self.config.interval_ms.max(1).millis(),
            self.death_tx.clone(),
            self.events.clone(),
        );
        // the replaced runner already ended
        self.runners.lock().await.insert(name, runner);
        Ok(())
    }
}
