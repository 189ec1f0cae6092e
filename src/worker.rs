//! Background sender for queued emails
//!
//! The worker polls the store for pending `send_email` jobs, hands each to a
//! [`Mailer`], and records the result. It runs on its own task and is never
//! tied to the lifetime of the request that queued a job.
use super::email::SendEmailArgs;
use super::job::{Job, JobId, JobState};
use super::mailer::{Mailer, Undeliverable};
use super::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Attempts before a job is failed for good.
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

pub struct Worker {
    store: JobStore,
    mailer: Arc<dyn Mailer>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(store: JobStore, mailer: Arc<dyn Mailer>, config: WorkerConfig) -> Self {
        Self {
            store,
            mailer,
            config,
        }
    }

    /// Polls until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            "starting email worker"
        );

        let mut tick = interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.drain().await {
                        Ok(0) => {}
                        Ok(worked) => debug!(worked, "worker cycle finished"),
                        Err(e) => warn!("worker cycle failed: {e:#}"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping email worker");
                    break;
                }
            }
        }
    }

    /// Works every job that is pending right now and returns how many were
    /// attempted. A job whose outcome could not be recorded is put back to
    /// pending and the rest of the queue is still worked.
    pub async fn drain(&self) -> anyhow::Result<usize> {
        let mut worked = 0;
        while let Some(job) = self.claim().await? {
            let (id, attempt) = (job.id, job.attempt);
            if let Err(err) = self.work(job).await {
                warn!(job_id = %id, "failed to record email outcome: {err:#}");
                let retry = attempt < self.config.max_attempts;
                self.release(id, format!("{err:#}"), retry).await;
            }
            worked += 1;
        }
        Ok(worked)
    }

    /// Best effort return of a claimed job to pending, or to failed once it is
    /// out of attempts. If this fails too the job stays running until the
    /// next startup rescues it.
    async fn release(&self, id: JobId, error: String, retry: bool) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.fail(&id, error, retry)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!(job_id = %id, "could not release job: {err}"),
            Err(err) => error!(job_id = %id, "could not release job: {err}"),
        }
    }

    async fn claim(&self) -> anyhow::Result<Option<Job>> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.claim_next()).await??)
    }

    /// Sends one claimed job and records the outcome, returning the job's new state.
    pub async fn work(&self, job: Job) -> anyhow::Result<JobState> {
        let (error, retry) = match job.decode_args::<SendEmailArgs>() {
            Ok(email) => match self.mailer.send(&email).await {
                Ok(()) => {
                    let store = self.store.clone();
                    let id = job.id;
                    let done = tokio::task::spawn_blocking(move || store.complete(&id)).await??;
                    info!(job_id = %done.id, attempt = done.attempt, "email sent");
                    return Ok(done.state);
                }
                Err(err) => {
                    let retry =
                        !err.is::<Undeliverable>() && job.attempt < self.config.max_attempts;
                    (format!("{err:#}"), retry)
                }
            },
            // a payload that doesn't decode never will
            Err(err) => (err.to_string(), false),
        };

        warn!(job_id = %job.id, attempt = job.attempt, retry, error = %error, "email attempt failed");
        let store = self.store.clone();
        let id = job.id;
        let failed = tokio::task::spawn_blocking(move || store.fail(&id, error, retry)).await??;
        Ok(failed.state)
    }
}
