//! Scheduling layer - decides which coordinator serves a job and how many
//! jobs run at once.
//!
//! - [`ReusePolicy::Shared`]: one coordinator, started on first use, serves
//!   every job until [`Scheduler::shutdown`].
//! - [`ReusePolicy::PerCall`]: every job gets a fresh coordinator that is
//!   stopped when the job finishes, whether it succeeded or not.
//!
//! Admission is FIFO and bounded by [`concurrency_limit`].

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Semaphore};

use crate::coordinator::{CallError, Coordinator, CoordinatorConfig, CoordinatorError};
use crate::method::RemoteMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReusePolicy {
    #[default]
    Shared,
    PerCall,
}

/// How many jobs may run at once.
///
/// `min(jobs, available)`, halved (rounding up) when running in the
/// background, and never below 1.
pub fn concurrency_limit(available: usize, jobs: usize, background: bool) -> usize {
    let limit = jobs.min(available).max(1);
    if background { limit.div_ceil(2) } else { limit }
}

/// Parallelism of the host, falling back to 1 when it can't be determined.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Clone)]
pub struct SchedulerConfig {
    /// Template for every coordinator the scheduler starts.
    pub coordinator: CoordinatorConfig,
    pub policy: ReusePolicy,
    /// Upper bound on concurrent jobs. Defaults to the host's parallelism.
    pub max_workers: Option<usize>,
    /// Share the machine with something interactive: halve the bound.
    pub background: bool,
    /// Number of jobs expected, if known. Never run more workers than jobs.
    pub expected_jobs: Option<usize>,
}

impl SchedulerConfig {
    /// Shared policy, bounded by the host's parallelism.
    pub fn new(coordinator: CoordinatorConfig) -> Self {
        Self {
            coordinator,
            policy: ReusePolicy::default(),
            max_workers: None,
            background: false,
            expected_jobs: None,
        }
    }

    pub fn with_policy(mut self, policy: ReusePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn with_expected_jobs(mut self, jobs: usize) -> Self {
        self.expected_jobs = Some(jobs);
        self
    }

    pub fn limit(&self) -> usize {
        concurrency_limit(
            self.max_workers.unwrap_or_else(available_parallelism),
            self.expected_jobs.unwrap_or(usize::MAX),
            self.background,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("failed to start worker: {0}")]
    Start(#[from] CoordinatorError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("scheduler is shut down")]
    ShutDown,
}

pub struct Scheduler {
    config: SchedulerConfig,
    limit: usize,
    permits: Semaphore,
    shared: Mutex<Option<Arc<Coordinator>>>,
    shut_down: AtomicBool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let limit = config.limit();
        tracing::debug!(limit, policy = ?config.policy, "Creating scheduler");
        Self {
            config,
            limit,
            permits: Semaphore::new(limit),
            shared: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn policy(&self) -> ReusePolicy {
        self.config.policy
    }

    /// Run a job against a coordinator chosen by the reuse policy.
    ///
    /// Waits (FIFO) while `limit` jobs are already running.
    pub async fn run<F, Fut, T>(&self, job: F) -> Result<T, ScheduleError>
    where
        F: FnOnce(Arc<Coordinator>) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ScheduleError::ShutDown)?;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ScheduleError::ShutDown);
        }

        match self.config.policy {
            ReusePolicy::Shared => {
                let coordinator = self.shared_coordinator().await?;
                Ok(job(coordinator).await?)
            }
            ReusePolicy::PerCall => {
                let coordinator = Arc::new(Coordinator::new(self.config.coordinator.clone()));
                coordinator.start().await?;
                let result = job(Arc::clone(&coordinator)).await;
                coordinator.stop().await;
                Ok(result?)
            }
        }
    }

    /// Call a typed method on a worker chosen by the reuse policy.
    pub async fn call<M: RemoteMethod>(&self, params: M::Params) -> Result<M::Output, ScheduleError> {
        self.run(|coordinator| async move { coordinator.call::<M>(params).await })
            .await
    }

    async fn shared_coordinator(&self) -> Result<Arc<Coordinator>, ScheduleError> {
        let mut shared = self.shared.lock().await;
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ScheduleError::ShutDown);
        }
        if let Some(ref coordinator) = *shared {
            return Ok(Arc::clone(coordinator));
        }

        let coordinator = Arc::new(Coordinator::new(self.config.coordinator.clone()));
        coordinator.start().await?;
        *shared = Some(Arc::clone(&coordinator));
        Ok(coordinator)
    }

    /// Stop the shared coordinator and refuse further jobs. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        let shared = self.shared.lock().await.take();
        if let Some(coordinator) = shared {
            coordinator.stop().await;
        }
        tracing::info!("Scheduler shut down");
    }

    /// Wait for SIGINT or SIGTERM, then [`shutdown`](Self::shutdown).
    pub async fn shutdown_on_signal(&self) {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal");
        self.shutdown().await;
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
