// Periodic job driver
//
// Every job gets its own loop on its own timer. Each cycle runs in a spawned
// task so a panic is contained; missed ticks are skipped, never queued.
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};

/// How long a stopping loop waits for its in-flight cycle before aborting it
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// One cycle. Errors are logged by the scheduler and the next tick
    /// proceeds.
    async fn run_once(&self) -> anyhow::Result<()>;
}

/// Outcome of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Failed,
    Panicked,
}

fn spawn_cycle(job: Arc<dyn Job>) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move { job.run_once().await })
}

fn cycle_outcome(name: &str, result: Result<anyhow::Result<()>, JoinError>) -> CycleOutcome {
    match result {
        Ok(Ok(())) => CycleOutcome::Completed,
        Ok(Err(e)) => {
            tracing::warn!("[{}] cycle failed: {:#}", name, e);
            CycleOutcome::Failed
        }
        Err(e) if e.is_panic() => {
            tracing::error!("[{}] cycle panicked: {}", name, e);
            CycleOutcome::Panicked
        }
        Err(e) => {
            tracing::warn!("[{}] cycle cancelled: {}", name, e);
            CycleOutcome::Failed
        }
    }
}

async fn run_cycle(job: Arc<dyn Job>) -> CycleOutcome {
    let name = job.name().to_string();
    cycle_outcome(&name, spawn_cycle(job).await)
}

/// Signals every loop to stop after its current cycle (bounded by
/// `SHUTDOWN_GRACE`)
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct Scheduler {
    jobs: Vec<Arc<dyn Job>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        }
    }

    pub fn add(&mut self, job: Arc<dyn Job>) {
        self.jobs.push(job);
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.name().to_string()).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run every job exactly once, sequentially
    pub async fn run_once_all(&self) -> Vec<(String, CycleOutcome)> {
        let mut outcomes = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let outcome = run_cycle(job.clone()).await;
            outcomes.push((job.name().to_string(), outcome));
        }
        outcomes
    }

    /// Spawn one independent loop per job
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        self.jobs
            .iter()
            .map(|job| {
                let job = job.clone();
                let shutdown = self.shutdown_rx.clone();
                tokio::spawn(job_loop(job, shutdown))
            })
            .collect()
    }
}

async fn job_loop(job: Arc<dyn Job>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!("🔄 [{}] loop starting (every {:?})", job.name(), job.interval());

    let mut ticker = interval(job.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let mut cycle = spawn_cycle(job.clone());
        let stopping = loop {
            tokio::select! {
                result = &mut cycle => {
                    cycle_outcome(job.name(), result);
                    break false;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break true;
                    }
                }
            }
        };

        if stopping {
            finish_in_flight(job.name(), cycle).await;
            break;
        }
    }

    tracing::info!("[{}] loop stopped", job.name());
}

/// Let a cycle that was running at shutdown complete, so a runner is not cut
/// between opening a position and placing its order
async fn finish_in_flight(name: &str, mut cycle: JoinHandle<anyhow::Result<()>>) {
    tracing::info!("[{}] waiting for in-flight cycle", name);
    match timeout(SHUTDOWN_GRACE, &mut cycle).await {
        Ok(result) => {
            cycle_outcome(name, result);
        }
        Err(_) => {
            tracing::warn!("[{}] cycle still running after {:?}, aborting", name, SHUTDOWN_GRACE);
            cycle.abort();
        }
    }
}
