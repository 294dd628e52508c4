/// One-shot job scheduler
///
/// Steps that must resume later (DELAY) hand a job to the scheduler instead of
/// holding a task. Jobs are named; the name selects the registered handler.
/// A failing handler is retried with exponential backoff up to the job's
/// `max_retries`, after which the job is marked FAILED.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Request to run a named job once at a given time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub name: String,
    pub scheduled_for: DateTime<Utc>,
    pub data: Value,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Bookkeeping record for a submitted job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: Uuid,
    pub name: String,
    /// Always "SCHEDULED": one-shot at `scheduled_for`
    pub job_type: String,
    pub scheduled_for: DateTime<Utc>,
    pub data: Value,
    pub max_retries: u32,
    pub attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name,
            job_type: "SCHEDULED".to_string(),
            scheduled_for: spec.scheduled_for,
            data: spec.data,
            max_retries: spec.max_retries,
            attempts: 0,
            status: JobStatus::Scheduled,
            last_error: None,
            result: None,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &ScheduledJob) -> Result<Value>;
}

/// Scheduler collaborator used by the execution engine
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn create_job(&self, spec: JobSpec) -> Result<Uuid>;
    async fn register_job_handler(&self, name: &str, handler: Arc<dyn JobHandler>);
    /// Returns false when the job is unknown or already finished
    async fn cancel_job(&self, id: Uuid) -> Result<bool>;
    async fn get_job(&self, id: Uuid) -> Option<ScheduledJob>;
}

/// Finished jobs kept queryable through `get_job` before the oldest are evicted
pub const DEFAULT_FINISHED_RETENTION: usize = 256;

/// Delay before retry number `attempt` (1-based): base * 2^attempt
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(16)))
}

/// Scheduler backed by tokio-cron-scheduler one-shot jobs
#[derive(Clone)]
pub struct CronJobScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    jobs: Arc<RwLock<HashMap<Uuid, ScheduledJob>>>,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
    /// Our job id -> tokio-cron-scheduler job uuid, for removal
    job_uuid_map: Arc<RwLock<HashMap<Uuid, Uuid>>>,
    /// Terminal jobs, oldest first
    finished: Arc<RwLock<VecDeque<Uuid>>>,
    retain_finished: usize,
    retry_base: Duration,
}

impl CronJobScheduler {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            finished: Arc::new(RwLock::new(VecDeque::new())),
            retain_finished: DEFAULT_FINISHED_RETENTION,
            retry_base: Duration::from_secs(1),
        })
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn with_finished_retention(mut self, retain: usize) -> Self {
        self.retain_finished = retain;
        self
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting job scheduler");
        let scheduler = self.scheduler.read().await;
        scheduler.start().await?;
        tracing::info!("✅ Job scheduler started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping job scheduler");
        self.job_uuid_map.write().await.clear();
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        tracing::info!("✅ Job scheduler stopped");
        Ok(())
    }

    /// Run a job to completion, retrying failed attempts inside the same task
    async fn execute(&self, job_id: Uuid) {
        loop {
            let Some(job) = self.begin_attempt(job_id).await else {
                return;
            };

            let handler = self.handlers.read().await.get(&job.name).cloned();
            let outcome = match handler {
                Some(handler) => handler.run(&job).await,
                None => Err(anyhow::anyhow!("no handler registered for job '{}'", job.name)),
            };

            match outcome {
                Ok(result) => {
                    tracing::debug!("✅ Job {} ({}) completed", job.name, job_id);
                    self.finish(job_id, JobStatus::Completed, Some(result), None).await;
                    return;
                }
                Err(e) if job.attempts <= job.max_retries => {
                    let delay = retry_delay(self.retry_base, job.attempts);
                    tracing::warn!(
                        "⚠️ Job {} ({}) attempt {} failed: {}; retrying in {:?}",
                        job.name,
                        job_id,
                        job.attempts,
                        e,
                        delay
                    );
                    self.finish(job_id, JobStatus::Scheduled, None, Some(e.to_string())).await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Job {} ({}) failed after {} attempts: {}",
                        job.name,
                        job_id,
                        job.attempts,
                        e
                    );
                    self.finish(job_id, JobStatus::Failed, None, Some(e.to_string())).await;
                    return;
                }
            }
        }
    }

    /// Mark the job RUNNING and count the attempt; None when it was cancelled
    async fn begin_attempt(&self, job_id: Uuid) -> Option<ScheduledJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id)?;
        if job.status != JobStatus::Scheduled {
            tracing::debug!("⏭️ Skipping job {} in status {:?}", job_id, job.status);
            return None;
        }
        job.status = JobStatus::Running;
        job.attempts += 1;
        Some(job.clone())
    }

    async fn finish(&self, job_id: Uuid, status: JobStatus, result: Option<Value>, error: Option<String>) {
        if let Some(job) = self.jobs.write().await.get_mut(&job_id) {
            job.status = status;
            if result.is_some() {
                job.result = result;
            }
            if error.is_some() {
                job.last_error = error;
            }
        }
        if matches!(status, JobStatus::Completed | JobStatus::Failed) {
            self.job_uuid_map.write().await.remove(&job_id);
            self.retire(job_id).await;
        }
    }

    /// Record a terminal job and forget the oldest ones past the retention limit
    async fn retire(&self, job_id: Uuid) {
        let evicted: Vec<Uuid> = {
            let mut finished = self.finished.write().await;
            finished.push_back(job_id);
            let excess = finished.len().saturating_sub(self.retain_finished);
            finished.drain(..excess).collect()
        };
        if evicted.is_empty() {
            return;
        }
        let mut jobs = self.jobs.write().await;
        for id in &evicted {
            jobs.remove(id);
        }
        tracing::debug!("🧹 Evicted {} finished jobs", evicted.len());
    }
}

#[async_trait]
impl Scheduler for CronJobScheduler {
    async fn create_job(&self, spec: JobSpec) -> Result<Uuid> {
        let job = ScheduledJob::new(spec);
        let job_id = job.id;
        let delay = (job.scheduled_for - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tracing::info!(
            "⏰ Scheduling job {} ({}) for {}",
            job.name,
            job_id,
            job.scheduled_for.to_rfc3339()
        );
        self.jobs.write().await.insert(job_id, job);

        let this = self.clone();
        let cron_job = Job::new_one_shot_async(delay, move |_uuid, _l| {
            let this = this.clone();
            Box::pin(async move {
                this.execute(job_id).await;
            })
        })?;

        let cron_uuid = {
            let scheduler = self.scheduler.read().await;
            scheduler.add(cron_job).await?
        };
        self.job_uuid_map.write().await.insert(job_id, cron_uuid);

        Ok(job_id)
    }

    async fn register_job_handler(&self, name: &str, handler: Arc<dyn JobHandler>) {
        tracing::debug!("📝 Registered job handler: {}", name);
        self.handlers.write().await.insert(name.to_string(), handler);
    }

    async fn cancel_job(&self, id: Uuid) -> Result<bool> {
        {
            let mut jobs = self.jobs.write().await;
            match jobs.get_mut(&id) {
                Some(job) if job.status == JobStatus::Scheduled => job.status = JobStatus::Cancelled,
                _ => return Ok(false),
            }
        }

        if let Some(cron_uuid) = self.job_uuid_map.write().await.remove(&id) {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&cron_uuid).await {
                tracing::warn!("⚠️ Failed to remove job {} from scheduler: {}", id, e);
            }
        }
        self.retire(id).await;
        tracing::info!("🛑 Cancelled job {}", id);
        Ok(true)
    }

    async fn get_job(&self, id: Uuid) -> Option<ScheduledJob> {
        self.jobs.read().await.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn run(&self, job: &ScheduledJob) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                anyhow::bail!("attempt {} failed", call);
            }
            Ok(json!({"echo": job.data}))
        }
    }

    async fn wait_for(scheduler: &CronJobScheduler, id: Uuid, status: JobStatus) -> ScheduledJob {
        for _ in 0..100 {
            if let Some(job) = scheduler.get_job(id).await {
                if job.status == status {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("job {} never reached {:?}", id, status);
    }

    #[test]
    fn retry_delay_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(base, 1), Duration::from_millis(200));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(800));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_attempts_are_retried() {
        let scheduler = CronJobScheduler::new()
            .await
            .unwrap()
            .with_retry_base(Duration::from_millis(10));
        scheduler.start().await.unwrap();
        scheduler
            .register_job_handler(
                "flaky",
                Arc::new(Flaky {
                    calls: AtomicU32::new(0),
                    fail_first: 2,
                }),
            )
            .await;

        let id = scheduler
            .create_job(JobSpec {
                name: "flaky".into(),
                scheduled_for: Utc::now(),
                data: json!({"n": 1}),
                max_retries: 3,
            })
            .await
            .unwrap();

        let job = wait_for(&scheduler, id, JobStatus::Completed).await;
        assert_eq!(job.attempts, 3);
        assert_eq!(job.result, Some(json!({"echo": {"n": 1}})));
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_job_never_runs() {
        let scheduler = CronJobScheduler::new().await.unwrap();
        scheduler.start().await.unwrap();
        let id = scheduler
            .create_job(JobSpec {
                name: "unused".into(),
                scheduled_for: Utc::now() + chrono::Duration::minutes(10),
                data: json!({}),
                max_retries: 0,
            })
            .await
            .unwrap();

        assert!(scheduler.cancel_job(id).await.unwrap());
        assert!(!scheduler.cancel_job(id).await.unwrap());
        assert_eq!(scheduler.get_job(id).await.unwrap().status, JobStatus::Cancelled);
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finished_jobs_are_evicted_past_retention() {
        let scheduler = CronJobScheduler::new()
            .await
            .unwrap()
            .with_finished_retention(1);
        scheduler.start().await.unwrap();
        scheduler
            .register_job_handler(
                "echo",
                Arc::new(Flaky {
                    calls: AtomicU32::new(0),
                    fail_first: 0,
                }),
            )
            .await;

        let mut ids = Vec::new();
        for n in 0..2 {
            let id = scheduler
                .create_job(JobSpec {
                    name: "echo".into(),
                    scheduled_for: Utc::now(),
                    data: json!({"n": n}),
                    max_retries: 0,
                })
                .await
                .unwrap();
            wait_for(&scheduler, id, JobStatus::Completed).await;
            ids.push(id);
        }

        assert!(scheduler.get_job(ids[0]).await.is_none());
        assert_eq!(scheduler.get_job(ids[1]).await.unwrap().status, JobStatus::Completed);

        let cancelled = scheduler
            .create_job(JobSpec {
                name: "echo".into(),
                scheduled_for: Utc::now() + chrono::Duration::minutes(10),
                data: json!({}),
                max_retries: 0,
            })
            .await
            .unwrap();
        assert!(scheduler.cancel_job(cancelled).await.unwrap());
        assert!(scheduler.get_job(ids[1]).await.is_none());
        assert_eq!(scheduler.get_job(cancelled).await.unwrap().status, JobStatus::Cancelled);
        scheduler.shutdown().await.unwrap();
    }
}
