use crate::models::{Error, Store, TenantId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "event_severity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

/// Immutable audit record of a rejection or suspicious action.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecurityEvent {
    id: Uuid,
    pub reason: String,
    pub subject: String,
    pub remote_ip: Option<String>,
    pub severity: EventSeverity,
    created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(reason: &str, subject: impl Into<String>, severity: EventSeverity) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason: reason.to_string(),
            subject: subject.into(),
            remote_ip: None,
            severity,
            created_at: Utc::now(),
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.remote_ip = Some(ip.into());
        self
    }
}

/// One row per AUTH attempt, success or failure. Feeds the lockout window.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthAttempt {
    id: Uuid,
    pub remote_ip: String,
    pub username: String,
    pub success: bool,
    created_at: DateTime<Utc>,
}

impl AuthAttempt {
    pub fn new(remote_ip: impl Into<String>, username: impl Into<String>, success: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_ip: remote_ip.into(),
            username: username.into(),
            success,
            created_at: Utc::now(),
        }
    }
}

/// Append-only audit of each MX delivery attempt, per tenant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryAttempt {
    id: Uuid,
    pub tenant_id: TenantId,
    pub message_id: String,
    pub destination_domain: String,
    pub mx_host: Option<String>,
    pub outcome: String,
    pub latency_ms: i64,
    created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn new(
        tenant_id: TenantId,
        message_id: &str,
        destination_domain: &str,
        mx_host: Option<&str>,
        outcome: &str,
        latency_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            message_id: message_id.to_string(),
            destination_domain: destination_domain.to_string(),
            mx_host: mx_host.map(str::to_string),
            outcome: outcome.to_string(),
            latency_ms,
            created_at: Utc::now(),
        }
    }
}

/// Dead-letter audit: a job that exhausted its attempts, with the final error.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueFailure {
    id: Uuid,
    pub queue: String,
    pub tenant_id: Option<TenantId>,
    pub job_id: String,
    pub payload: serde_json::Value,
    pub error: String,
    created_at: DateTime<Utc>,
}

impl QueueFailure {
    pub fn new(
        queue: &str,
        tenant_id: Option<TenantId>,
        job_id: &str,
        payload: serde_json::Value,
        error: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            tenant_id,
            job_id: job_id.to_string(),
            payload,
            error: error.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct EventRepository {
    store: Store,
}

impl EventRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn record_security_event(&self, event: SecurityEvent) -> Result<(), Error> {
        tracing::warn!(
            reason = event.reason,
            subject = event.subject,
            "security event"
        );
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO security_events (id, reason, subject, remote_ip, severity, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(event.id)
                .bind(&event.reason)
                .bind(&event.subject)
                .bind(&event.remote_ip)
                .bind(event.severity)
                .bind(event.created_at)
                .execute(pool)
                .await?;
            }
            Store::Memory(mem) => mem.security_events.lock().unwrap().push(event),
        }
        Ok(())
    }

    pub async fn record_auth_attempt(&self, attempt: AuthAttempt) -> Result<(), Error> {
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO auth_attempts (id, remote_ip, username, success, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(attempt.id)
                .bind(&attempt.remote_ip)
                .bind(&attempt.username)
                .bind(attempt.success)
                .bind(attempt.created_at)
                .execute(pool)
                .await?;
            }
            Store::Memory(mem) => mem.auth_attempts.lock().unwrap().push(attempt),
        }
        Ok(())
    }

    pub async fn count_recent_auth_failures(
        &self,
        remote_ip: &str,
        username: &str,
        window: Duration,
    ) -> Result<i64, Error> {
        let since = Utc::now() - window;
        match &self.store {
            Store::Postgres(pool) => {
                let count = sqlx::query_scalar::<_, i64>(
                    r#"
                    SELECT COUNT(*) FROM auth_attempts
                    WHERE remote_ip = $1 AND username = $2 AND NOT success AND created_at > $3
                    "#,
                )
                .bind(remote_ip)
                .bind(username)
                .bind(since)
                .fetch_one(pool)
                .await?;
                Ok(count)
            }
            Store::Memory(mem) => Ok(mem
                .auth_attempts
                .lock()
                .unwrap()
                .iter()
                .filter(|a| {
                    a.remote_ip == remote_ip
                        && a.username == username
                        && !a.success
                        && a.created_at > since
                })
                .count() as i64),
        }
    }

    pub async fn record_delivery_attempt(&self, attempt: DeliveryAttempt) -> Result<(), Error> {
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO delivery_attempts (id, tenant_id, message_id, destination_domain, mx_host, outcome, latency_ms, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(attempt.id)
                .bind(attempt.tenant_id)
                .bind(&attempt.message_id)
                .bind(&attempt.destination_domain)
                .bind(&attempt.mx_host)
                .bind(&attempt.outcome)
                .bind(attempt.latency_ms)
                .bind(attempt.created_at)
                .execute(pool)
                .await?;
            }
            Store::Memory(mem) => mem.delivery_attempts.lock().unwrap().push(attempt),
        }
        Ok(())
    }

    pub async fn record_queue_failure(&self, failure: QueueFailure) -> Result<(), Error> {
        tracing::error!(
            queue = failure.queue,
            job_id = failure.job_id,
            error = failure.error,
            "job dead-lettered"
        );
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO queue_failures (id, queue, tenant_id, job_id, payload, error, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(failure.id)
                .bind(&failure.queue)
                .bind(failure.tenant_id)
                .bind(&failure.job_id)
                .bind(&failure.payload)
                .bind(&failure.error)
                .bind(failure.created_at)
                .execute(pool)
                .await?;
            }
            Store::Memory(mem) => mem.queue_failures.lock().unwrap().push(failure),
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn security_events(&self) -> Vec<SecurityEvent> {
        match &self.store {
            Store::Postgres(_) => unimplemented!("test helper"),
            Store::Memory(mem) => mem.security_events.lock().unwrap().clone(),
        }
    }

    #[cfg(test)]
    pub async fn queue_failures(&self) -> Vec<QueueFailure> {
        match &self.store {
            Store::Postgres(_) => unimplemented!("test helper"),
            Store::Memory(mem) => mem.queue_failures.lock().unwrap().clone(),
        }
    }
}
