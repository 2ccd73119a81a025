use crate::{
    broker::{Broker, BrokerError, now_unix},
    models::{self, EventRepository, QueueFailure, TenantId},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod monitor;
pub mod worker;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed to serialize job: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Model(#[from] models::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    SendEmail,
    SendWebhook,
    UpdateAnalytics,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [
        QueueName::SendEmail,
        QueueName::SendWebhook,
        QueueName::UpdateAnalytics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::SendEmail => "send-email",
            QueueName::SendWebhook => "send-webhook",
            QueueName::UpdateAnalytics => "update-analytics",
        }
    }

    pub fn default_max_attempts(self) -> u32 {
        match self {
            QueueName::SendEmail => 3,
            QueueName::SendWebhook => 5,
            QueueName::UpdateAnalytics => 1,
        }
    }

    /// Wall deadline for one execution of a job on this queue.
    pub fn execution_deadline(self) -> Duration {
        match self {
            QueueName::SendEmail => Duration::from_secs(5 * 60),
            QueueName::SendWebhook => Duration::from_secs(30),
            QueueName::UpdateAnalytics => Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobKind {
    SendEmail {
        message_id: String,
        recipient: String,
    },
    SendWebhook {
        url: String,
        event: String,
        payload: serde_json::Value,
    },
    UpdateAnalytics {
        event: String,
        payload: serde_json::Value,
    },
}

impl JobKind {
    pub fn queue(&self) -> QueueName {
        match self {
            JobKind::SendEmail { .. } => QueueName::SendEmail,
            JobKind::SendWebhook { .. } => QueueName::SendWebhook,
            JobKind::UpdateAnalytics { .. } => QueueName::UpdateAnalytics,
        }
    }

    /// Stable key workers use to make re-execution safe.
    fn idempotency_key(&self) -> String {
        match self {
            JobKind::SendEmail {
                message_id,
                recipient,
            } => format!("{message_id}/{recipient}"),
            JobKind::SendWebhook { url, event, .. } => format!("{event}:{url}"),
            JobKind::UpdateAnalytics { event, .. } => event.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub idempotency_key: String,
    /// Lower number wins.
    pub priority: i64,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(tenant_id: TenantId, kind: JobKind) -> Self {
        let idempotency_key = kind.idempotency_key();
        let max_attempts = kind.queue().default_max_attempts();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            kind,
            idempotency_key,
            priority: 10,
            attempts_made: 0,
            max_attempts,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn queue(&self) -> QueueName {
        self.kind.queue()
    }
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub factor: u32,
    /// Jitter fraction, applied as ±fraction around the nominal delay.
    pub jitter: f64,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            factor: 2,
            jitter: 0.2,
            cap: Duration::from_secs(60 * 60),
        }
    }
}

impl BackoffConfig {
    /// Exponential delay before attempt `attempts_made + 1`, jittered within
    /// the ± band, monotone non-decreasing across attempts.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        let nominal = self
            .base
            .saturating_mul(self.factor.saturating_pow(exponent))
            .min(self.cap);
        let jitter = rand::rng().random_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + jitter).min(self.cap.mul_f64(1.0 + self.jitter))
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub backoff: BackoffConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum FailureDisposition {
    /// The job went back to the delayed set.
    Retried { delay: Duration },
    /// Attempts exhausted or failure permanent; the job is dead-lettered.
    DeadLettered,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed_recent: u64,
    pub failed_recent: u64,
}

/// Durable, prioritised, retrying job queues with per-tenant namespaces.
/// Jobs live in the broker; dead letters are audited in the durable store.
#[derive(Clone)]
pub struct QueueService {
    broker: Broker,
    events: EventRepository,
    config: Arc<QueueConfig>,
    round_robin: Arc<AtomicUsize>,
}

/// Rolling stat buckets are one minute wide; rates look at the last five.
const STAT_BUCKET_SECS: u64 = 60;
const STAT_WINDOW_BUCKETS: u64 = 5;

impl QueueService {
    pub fn new(broker: Broker, events: EventRepository, config: QueueConfig) -> Self {
        Self {
            broker,
            events,
            config: Arc::new(config),
            round_robin: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        self.enqueue_delayed(job, None).await
    }

    pub async fn enqueue_delayed(
        &self,
        job: Job,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let queue = job.queue();
        let payload = serde_json::to_string(&job)?;
        match delay {
            Some(delay) if !delay.is_zero() => {
                debug!(queue = queue.as_str(), job_id = job.id, ?delay, "delaying job");
                self.broker
                    .delayed_push(queue.as_str(), &payload, now_unix() + delay.as_secs())
                    .await?;
            }
            _ => {
                self.broker
                    .queue_push(
                        queue.as_str(),
                        &job.tenant_id.to_string(),
                        &payload,
                        job.priority,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Promotes due delayed jobs back into their tenant queues.
    pub async fn promote_due(&self, queue: QueueName) -> Result<usize, QueueError> {
        let due = self
            .broker
            .delayed_due(queue.as_str(), now_unix(), 64)
            .await?;
        let promoted = due.len();
        for payload in due {
            match serde_json::from_str::<Job>(&payload) {
                Ok(job) => {
                    self.broker
                        .queue_push(
                            queue.as_str(),
                            &job.tenant_id.to_string(),
                            &payload,
                            job.priority,
                        )
                        .await?;
                }
                Err(err) => warn!(queue = queue.as_str(), "dropping undecodable delayed job: {err}"),
            }
        }
        Ok(promoted)
    }

    /// Picks the next job, rotating across tenants so no tenant starves the
    /// others while priority is still honoured within each tenant.
    pub async fn next_job(&self, queue: QueueName) -> Result<Option<Job>, QueueError> {
        self.promote_due(queue).await?;

        let tenants = self.broker.queue_tenants(queue.as_str()).await?;
        if tenants.is_empty() {
            return Ok(None);
        }

        let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % tenants.len();
        for offset in 0..tenants.len() {
            let tenant = &tenants[(start + offset) % tenants.len()];
            if let Some(payload) = self.broker.queue_pop(queue.as_str(), tenant).await? {
                match serde_json::from_str::<Job>(&payload) {
                    Ok(job) => {
                        self.broker.active_add(queue.as_str(), &job.id).await?;
                        return Ok(Some(job));
                    }
                    Err(err) => {
                        warn!(queue = queue.as_str(), "dropping undecodable job: {err}");
                    }
                }
            }
        }
        Ok(None)
    }

    pub async fn complete(&self, job: &Job) -> Result<(), QueueError> {
        self.broker.active_remove(job.queue().as_str(), &job.id).await?;
        self.bump_stat(job.queue(), "completed").await?;
        debug!(queue = job.queue().as_str(), job_id = job.id, "job completed");
        Ok(())
    }

    /// Handles a failed execution: schedules a retry with backoff while
    /// attempts remain and the failure is retryable, otherwise dead-letters
    /// the job with its final error preserved.
    pub async fn fail(
        &self,
        mut job: Job,
        error: &str,
        retryable: bool,
        retry_after: Option<Duration>,
    ) -> Result<FailureDisposition, QueueError> {
        let queue = job.queue();
        self.broker.active_remove(queue.as_str(), &job.id).await?;
        self.bump_stat(queue, "failed").await?;

        job.attempts_made += 1;
        job.last_error = Some(error.to_string());

        if retryable && job.attempts_made < job.max_attempts {
            let delay = retry_after.unwrap_or_else(|| self.config.backoff.delay(job.attempts_made));
            info!(
                queue = queue.as_str(),
                job_id = job.id,
                attempt = job.attempts_made,
                ?delay,
                "retrying job"
            );
            self.enqueue_delayed(job, Some(delay)).await?;
            return Ok(FailureDisposition::Retried { delay });
        }

        let payload = serde_json::to_value(&job)?;
        self.events
            .record_queue_failure(QueueFailure::new(
                queue.as_str(),
                Some(job.tenant_id),
                &job.id,
                payload,
                error,
            ))
            .await?;
        Ok(FailureDisposition::DeadLettered)
    }

    async fn bump_stat(&self, queue: QueueName, stat: &str) -> Result<(), QueueError> {
        let bucket = now_unix() / STAT_BUCKET_SECS;
        self.broker
            .incr_window(
                &format!("qstats:{}:{stat}:{bucket}", queue.as_str()),
                Duration::from_secs((STAT_WINDOW_BUCKETS + 1) * STAT_BUCKET_SECS),
            )
            .await?;
        Ok(())
    }

    async fn stat_sum(&self, queue: QueueName, stat: &str) -> Result<u64, QueueError> {
        let bucket = now_unix() / STAT_BUCKET_SECS;
        let keys: Vec<String> = (0..STAT_WINDOW_BUCKETS)
            .map(|i| format!("qstats:{}:{stat}:{}", queue.as_str(), bucket - i))
            .collect();
        Ok(self.broker.window_counts(&keys).await?.iter().sum())
    }

    pub async fn stats(&self, queue: QueueName) -> Result<QueueStats, QueueError> {
        Ok(QueueStats {
            waiting: self.broker.waiting_count(queue.as_str()).await?,
            active: self.broker.active_count(queue.as_str()).await?,
            delayed: self.broker.delayed_count(queue.as_str()).await?,
            completed_recent: self.stat_sum(queue, "completed").await?,
            failed_recent: self.stat_sum(queue, "failed").await?,
        })
    }

    /// Start time of the oldest active job, for stuck detection.
    pub async fn oldest_active(&self, queue: QueueName) -> Result<Option<u64>, QueueError> {
        Ok(self.broker.active_oldest(queue.as_str()).await?)
    }
}
