use crate::models::{Error, Store, TenantId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "email_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "email_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EmailStatus {
    Pending,
    Sent,
    Delivered,
    Bounced,
    Failed,
}

impl EmailStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Bounced | Self::Failed)
    }
}

/// Per-recipient outcome, kept alongside the aggregate status so multi-RCPT
/// submissions can settle one recipient at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientOutcome {
    Delivered,
    Bounced,
    Failed,
}

/// One row per message the system handles, keyed by message-id.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EmailRecord {
    id: Uuid,
    pub message_id: String,
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub direction: Direction,
    pub status: EmailStatus,
    pub from_email: String,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub raw_data: Vec<u8>,
    pub recipient_status: Json<HashMap<String, RecipientOutcome>>,
    pub attempts: i32,
    pub mx_server: Option<String>,
    pub modified: bool,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EmailRecord {
    pub fn new(
        message_id: String,
        tenant_id: TenantId,
        direction: Direction,
        from_email: String,
        recipients: Vec<String>,
        raw_data: Vec<u8>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            message_id,
            tenant_id,
            user_id: None,
            direction,
            status: EmailStatus::Pending,
            from_email,
            recipients,
            subject: None,
            raw_data,
            recipient_status: Json(HashMap::new()),
            attempts: 0,
            mx_server: None,
            modified: false,
            last_error: None,
            sent_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Aggregate terminal status once every recipient has settled.
    fn aggregate(recipients: &[String], outcomes: &HashMap<String, RecipientOutcome>) -> Option<EmailStatus> {
        if recipients.iter().any(|r| !outcomes.contains_key(r)) {
            return None;
        }
        if outcomes.values().all(|o| *o == RecipientOutcome::Delivered) {
            Some(EmailStatus::Delivered)
        } else if outcomes.values().any(|o| *o == RecipientOutcome::Bounced) {
            Some(EmailStatus::Bounced)
        } else {
            Some(EmailStatus::Failed)
        }
    }
}

#[derive(Clone)]
pub struct EmailRepository {
    store: Store,
}

impl EmailRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Idempotent insert keyed by message-id. A retried enqueue returns the
    /// already-stored row unchanged.
    pub async fn upsert_pending(&self, email: &EmailRecord) -> Result<EmailRecord, Error> {
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO emails (id, message_id, tenant_id, user_id, direction, status, from_email,
                                        recipients, subject, raw_data, recipient_status, attempts, mx_server,
                                        modified, last_error, sent_at, delivered_at, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                    ON CONFLICT (message_id) DO NOTHING
                    "#,
                )
                .bind(email.id)
                .bind(&email.message_id)
                .bind(email.tenant_id)
                .bind(email.user_id)
                .bind(email.direction)
                .bind(email.status)
                .bind(&email.from_email)
                .bind(&email.recipients)
                .bind(&email.subject)
                .bind(&email.raw_data)
                .bind(&email.recipient_status)
                .bind(email.attempts)
                .bind(&email.mx_server)
                .bind(email.modified)
                .bind(&email.last_error)
                .bind(email.sent_at)
                .bind(email.delivered_at)
                .bind(email.created_at)
                .bind(email.updated_at)
                .execute(pool)
                .await?;

                self.get(&email.message_id)
                    .await?
                    .ok_or(Error::NotFound("email vanished after upsert"))
            }
            Store::Memory(mem) => {
                let mut emails = mem.emails.lock().unwrap();
                Ok(emails
                    .entry(email.message_id.clone())
                    .or_insert_with(|| email.clone())
                    .clone())
            }
        }
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<EmailRecord>, Error> {
        match &self.store {
            Store::Postgres(pool) => {
                let email = sqlx::query_as::<_, EmailRecord>(
                    "SELECT * FROM emails WHERE message_id = $1",
                )
                .bind(message_id)
                .fetch_optional(pool)
                .await?;
                Ok(email)
            }
            Store::Memory(mem) => Ok(mem.emails.lock().unwrap().get(message_id).cloned()),
        }
    }

    /// Conditional status transition keyed by (message-id, expected status).
    /// Returns false when another writer got there first; the caller treats
    /// that as "already settled".
    pub async fn transition(
        &self,
        message_id: &str,
        expected: EmailStatus,
        next: EmailStatus,
    ) -> Result<bool, Error> {
        let now = Utc::now();
        let sent_at = matches!(next, EmailStatus::Sent).then_some(now);
        let delivered_at = matches!(next, EmailStatus::Delivered).then_some(now);

        match &self.store {
            Store::Postgres(pool) => {
                let result = sqlx::query(
                    r#"
                    UPDATE emails
                    SET status = $3,
                        sent_at = COALESCE($4, sent_at),
                        delivered_at = COALESCE($5, delivered_at),
                        updated_at = $6
                    WHERE message_id = $1 AND status = $2
                    "#,
                )
                .bind(message_id)
                .bind(expected)
                .bind(next)
                .bind(sent_at)
                .bind(delivered_at)
                .bind(now)
                .execute(pool)
                .await?;
                Ok(result.rows_affected() == 1)
            }
            Store::Memory(mem) => {
                let mut emails = mem.emails.lock().unwrap();
                let Some(email) = emails.get_mut(message_id) else {
                    return Ok(false);
                };
                if email.status != expected {
                    return Ok(false);
                }
                email.status = next;
                email.sent_at = sent_at.or(email.sent_at);
                email.delivered_at = delivered_at.or(email.delivered_at);
                email.updated_at = now;
                Ok(true)
            }
        }
    }

    /// Bumps the attempt counter and records the MX and error of the latest
    /// attempt.
    pub async fn record_attempt(
        &self,
        message_id: &str,
        mx_server: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), Error> {
        let now = Utc::now();
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query(
                    r#"
                    UPDATE emails
                    SET attempts = attempts + 1,
                        mx_server = COALESCE($2, mx_server),
                        last_error = $3,
                        updated_at = $4
                    WHERE message_id = $1
                    "#,
                )
                .bind(message_id)
                .bind(mx_server)
                .bind(error)
                .bind(now)
                .execute(pool)
                .await?;
            }
            Store::Memory(mem) => {
                if let Some(email) = mem.emails.lock().unwrap().get_mut(message_id) {
                    email.attempts += 1;
                    if let Some(mx) = mx_server {
                        email.mx_server = Some(mx.to_string());
                    }
                    email.last_error = error.map(str::to_string);
                    email.updated_at = now;
                }
            }
        }
        Ok(())
    }

    pub async fn set_modified(&self, message_id: &str) -> Result<(), Error> {
        match &self.store {
            Store::Postgres(pool) => {
                sqlx::query("UPDATE emails SET modified = TRUE, updated_at = $2 WHERE message_id = $1")
                    .bind(message_id)
                    .bind(Utc::now())
                    .execute(pool)
                    .await?;
            }
            Store::Memory(mem) => {
                if let Some(email) = mem.emails.lock().unwrap().get_mut(message_id) {
                    email.modified = true;
                }
            }
        }
        Ok(())
    }

    /// Settles one recipient and returns the aggregate terminal status once
    /// all recipients have settled. The returned status still has to win the
    /// conditional [`transition`](Self::transition).
    pub async fn record_recipient_outcome(
        &self,
        message_id: &str,
        recipient: &str,
        outcome: RecipientOutcome,
    ) -> Result<Option<EmailStatus>, Error> {
        match &self.store {
            Store::Postgres(pool) => {
                let patch = serde_json::json!({ recipient: outcome });
                let row = sqlx::query_as::<_, EmailRecord>(
                    r#"
                    UPDATE emails
                    SET recipient_status = recipient_status || $2::jsonb,
                        updated_at = $3
                    WHERE message_id = $1
                    RETURNING *
                    "#,
                )
                .bind(message_id)
                .bind(patch)
                .bind(Utc::now())
                .fetch_optional(pool)
                .await?;
                let Some(email) = row else {
                    return Err(Error::NotFound("no email row for message-id"));
                };
                Ok(EmailRecord::aggregate(&email.recipients, &email.recipient_status))
            }
            Store::Memory(mem) => {
                let mut emails = mem.emails.lock().unwrap();
                let Some(email) = emails.get_mut(message_id) else {
                    return Err(Error::NotFound("no email row for message-id"));
                };
                email
                    .recipient_status
                    .insert(recipient.to_string(), outcome);
                email.updated_at = Utc::now();
                Ok(EmailRecord::aggregate(&email.recipients, &email.recipient_status))
            }
        }
    }

    /// Pending rows older than the reconciliation interval. The reconciler
    /// re-enqueues a job for each of them.
    pub async fn find_stale_pending(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<EmailRecord>, Error> {
        match &self.store {
            Store::Postgres(pool) => {
                let emails = sqlx::query_as::<_, EmailRecord>(
                    r#"
                    SELECT * FROM emails
                    WHERE status = 'pending' AND direction = 'outbound' AND updated_at < $1
                    ORDER BY updated_at
                    LIMIT 100
                    "#,
                )
                .bind(older_than)
                .fetch_all(pool)
                .await?;
                Ok(emails)
            }
            Store::Memory(mem) => Ok(mem
                .emails
                .lock()
                .unwrap()
                .values()
                .filter(|e| {
                    e.status == EmailStatus::Pending
                        && e.direction == Direction::Outbound
                        && e.updated_at < older_than
                })
                .cloned()
                .collect()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn outbound(message_id: &str, recipients: &[&str]) -> EmailRecord {
        EmailRecord::new(
            message_id.into(),
            Uuid::new_v4().into(),
            Direction::Outbound,
            "alice@verified.tld".into(),
            recipients.iter().map(|r| r.to_string()).collect(),
            b"Subject: hi\r\n\r\nhello".to_vec(),
        )
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let repository = EmailRepository::new(Store::memory());
        let email = outbound("msg-1@mx.example", &["bob@gmail.com"]);

        let first = repository.upsert_pending(&email).await.unwrap();
        let mut retry = outbound("msg-1@mx.example", &["bob@gmail.com"]);
        retry.from_email = "mallory@evil.tld".into();
        let second = repository.upsert_pending(&retry).await.unwrap();

        assert_eq!(first.from_email, second.from_email);
    }

    #[tokio::test]
    async fn transitions_are_conditional() {
        let repository = EmailRepository::new(Store::memory());
        let email = outbound("msg-2@mx.example", &["bob@gmail.com"]);
        repository.upsert_pending(&email).await.unwrap();

        assert!(
            repository
                .transition("msg-2@mx.example", EmailStatus::Pending, EmailStatus::Sent)
                .await
                .unwrap()
        );
        // a second worker replaying the same transition loses
        assert!(
            !repository
                .transition("msg-2@mx.example", EmailStatus::Pending, EmailStatus::Sent)
                .await
                .unwrap()
        );
        assert!(
            repository
                .transition("msg-2@mx.example", EmailStatus::Sent, EmailStatus::Delivered)
                .await
                .unwrap()
        );

        let email = repository.get("msg-2@mx.example").await.unwrap().unwrap();
        assert_eq!(email.status, EmailStatus::Delivered);
        assert!(email.delivered_at.is_some());
    }

    #[tokio::test]
    async fn aggregate_waits_for_all_recipients() {
        let repository = EmailRepository::new(Store::memory());
        let email = outbound("msg-3@mx.example", &["bob@gmail.com", "carol@fastmail.com"]);
        repository.upsert_pending(&email).await.unwrap();

        let partial = repository
            .record_recipient_outcome("msg-3@mx.example", "bob@gmail.com", RecipientOutcome::Delivered)
            .await
            .unwrap();
        assert_eq!(partial, None);

        let settled = repository
            .record_recipient_outcome(
                "msg-3@mx.example",
                "carol@fastmail.com",
                RecipientOutcome::Bounced,
            )
            .await
            .unwrap();
        assert_eq!(settled, Some(EmailStatus::Bounced));
    }

    #[tokio::test]
    async fn stale_pending_shows_up_for_reconciliation() {
        let repository = EmailRepository::new(Store::memory());
        let email = outbound("msg-4@mx.example", &["bob@gmail.com"]);
        repository.upsert_pending(&email).await.unwrap();

        let stale = repository
            .find_stale_pending(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].message_id, "msg-4@mx.example");
    }
}
