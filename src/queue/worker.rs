use crate::{
    delivery::{DeliveryEngine, DeliveryError, OutboundMessage},
    models::{
        EmailRepository, EmailStatus, EventRepository, EventSeverity, RecipientOutcome,
        SecurityEvent,
    },
    queue::{FailureDisposition, Job, JobKind, QueueName, QueueService},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Endpoint bounce/alert webhooks are posted to. Without one, webhook
    /// jobs are simply not enqueued.
    pub webhook_url: Option<String>,
}

enum ExecutionOutcome {
    Done,
    Failed {
        error: String,
        retryable: bool,
        retry_after: Option<Duration>,
    },
}

/// Consumes jobs from all queues: delivers emails, posts webhooks, folds
/// analytics events. One pool instance runs per worker process.
#[derive(Clone)]
pub struct WorkerPool {
    queue: QueueService,
    emails: EmailRepository,
    events: EventRepository,
    engine: DeliveryEngine,
    http: reqwest::Client,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        queue: QueueService,
        emails: EmailRepository,
        events: EventRepository,
        engine: DeliveryEngine,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            emails,
            events,
            engine,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        QueueName::ALL
            .into_iter()
            .map(|queue| {
                let pool = self.clone();
                tokio::spawn(async move { pool.worker_loop(queue).await })
            })
            .collect()
    }

    async fn worker_loop(self, queue: QueueName) {
        info!(queue = queue.as_str(), "worker loop started");
        let slots = Arc::new(Semaphore::new(self.queue.concurrency()));

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(queue = queue.as_str(), "worker loop shutting down");
                    return;
                }
                permit = slots.clone().acquire_owned() => {
                    permit.expect("worker semaphore closed")
                }
            };

            match self.queue.next_job(queue).await {
                Ok(Some(job)) => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        let _slot = permit;
                        pool.run_job(job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
                Err(err) => {
                    drop(permit);
                    error!(queue = queue.as_str(), "failed to poll queue: {err}");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    pub(crate) async fn run_job(&self, job: Job) {
        let queue = job.queue();
        let deadline = queue.execution_deadline();

        let outcome = match tokio::time::timeout(deadline, self.execute(&job)).await {
            Ok(outcome) => outcome,
            Err(_) => ExecutionOutcome::Failed {
                error: "execution deadline exceeded".to_string(),
                retryable: true,
                retry_after: None,
            },
        };

        match outcome {
            ExecutionOutcome::Done => {
                if let Err(err) = self.queue.complete(&job).await {
                    error!(job_id = job.id, "failed to complete job: {err}");
                }
            }
            ExecutionOutcome::Failed {
                error,
                retryable,
                retry_after,
            } => {
                let kind = job.kind.clone();
                match self.queue.fail(job, &error, retryable, retry_after).await {
                    Ok(FailureDisposition::Retried { .. }) => {}
                    Ok(FailureDisposition::DeadLettered) => {
                        self.settle_dead_letter(&kind).await;
                    }
                    Err(err) => error!("failed to record job failure: {err}"),
                }
            }
        }
    }

    /// A dead-lettered send-email job settles its recipient as failed so the
    /// email row still reaches a terminal state.
    async fn settle_dead_letter(&self, kind: &JobKind) {
        let JobKind::SendEmail {
            message_id,
            recipient,
        } = kind
        else {
            return;
        };
        match self
            .emails
            .record_recipient_outcome(message_id, recipient, RecipientOutcome::Failed)
            .await
        {
            Ok(Some(aggregate)) => {
                self.finish_email(message_id, aggregate).await;
            }
            Ok(None) => {}
            Err(err) => error!(message_id, "failed to settle dead-lettered email: {err}"),
        }
    }

    async fn finish_email(&self, message_id: &str, terminal: EmailStatus) {
        for expected in [EmailStatus::Sent, EmailStatus::Pending] {
            match self.emails.transition(message_id, expected, terminal).await {
                Ok(true) => {
                    info!(message_id, status = ?terminal, "email settled");
                    return;
                }
                Ok(false) => {}
                Err(err) => {
                    error!(message_id, "failed to settle email: {err}");
                    return;
                }
            }
        }
        // already terminal: a replayed job observed the settled row
        debug!(message_id, "email was already settled");
    }

    async fn execute(&self, job: &Job) -> ExecutionOutcome {
        match &job.kind {
            JobKind::SendEmail {
                message_id,
                recipient,
            } => self.execute_send_email(job, message_id, recipient).await,
            JobKind::SendWebhook {
                url,
                event,
                payload,
            } => self.execute_send_webhook(job, url, event, payload).await,
            JobKind::UpdateAnalytics { event, payload } => {
                self.execute_update_analytics(job, event, payload).await
            }
        }
    }

    async fn execute_send_email(
        &self,
        job: &Job,
        message_id: &str,
        recipient: &str,
    ) -> ExecutionOutcome {
        let email = match self.emails.get(message_id).await {
            Ok(Some(email)) => email,
            Ok(None) => {
                warn!(message_id, "job references a missing email row");
                return ExecutionOutcome::Done;
            }
            Err(err) => {
                return ExecutionOutcome::Failed {
                    error: format!("storage error: {err}"),
                    retryable: true,
                    retry_after: None,
                };
            }
        };

        // re-execution after a crash is safe: settled rows are left alone
        if email.status.is_terminal() {
            debug!(message_id, "email already settled, skipping");
            return ExecutionOutcome::Done;
        }

        // a job must never act on another tenant's rows
        if email.tenant_id != job.tenant_id {
            if let Err(err) = self
                .events
                .record_security_event(SecurityEvent::new(
                    "job tenant does not own the referenced email",
                    message_id,
                    EventSeverity::Critical,
                ))
                .await
            {
                error!("failed to record security event: {err}");
            }
            return ExecutionOutcome::Failed {
                error: "tenant mismatch".to_string(),
                retryable: false,
                retry_after: None,
            };
        }

        if let Err(err) = self
            .emails
            .transition(message_id, EmailStatus::Pending, EmailStatus::Sent)
            .await
        {
            error!(message_id, "failed to mark email sent: {err}");
        }

        let message = OutboundMessage {
            message_id: message_id.to_string(),
            tenant_id: email.tenant_id,
            from: email.from_email.clone(),
            recipient: recipient.to_string(),
            raw: email.raw_data.clone(),
        };
        let outcome = self.engine.deliver(&message).await;

        let error_label = outcome.error.as_ref().map(|e| e.to_string());
        if let Err(err) = self
            .emails
            .record_attempt(message_id, outcome.mx_server.as_deref(), error_label.as_deref())
            .await
        {
            error!(message_id, "failed to record delivery attempt: {err}");
        }

        if outcome.success {
            self.enqueue_analytics(job, "delivered", message_id).await;
            return self
                .settle_recipient(message_id, recipient, RecipientOutcome::Delivered)
                .await;
        }

        let error = outcome
            .error
            .unwrap_or_else(|| DeliveryError::UpstreamTransient("unknown failure".to_string()));
        if error.is_retryable() {
            return ExecutionOutcome::Failed {
                error: error.to_string(),
                retryable: true,
                retry_after: error.retry_after(),
            };
        }

        // permanent: the recipient bounced; no retries, notify via webhook
        let settled = self
            .settle_recipient(message_id, recipient, RecipientOutcome::Bounced)
            .await;
        self.enqueue_bounce_webhook(job, message_id, recipient, &error).await;
        self.enqueue_analytics(job, "bounced", message_id).await;
        settled
    }

    async fn enqueue_analytics(&self, job: &Job, event: &str, message_id: &str) {
        let analytics = Job::new(
            job.tenant_id,
            JobKind::UpdateAnalytics {
                event: event.to_string(),
                payload: serde_json::json!({ "message_id": message_id }),
            },
        );
        if let Err(err) = self.queue.enqueue(analytics).await {
            error!(message_id, "failed to enqueue analytics job: {err}");
        }
    }

    async fn settle_recipient(
        &self,
        message_id: &str,
        recipient: &str,
        outcome: RecipientOutcome,
    ) -> ExecutionOutcome {
        match self
            .emails
            .record_recipient_outcome(message_id, recipient, outcome)
            .await
        {
            Ok(Some(aggregate)) => {
                self.finish_email(message_id, aggregate).await;
                ExecutionOutcome::Done
            }
            Ok(None) => ExecutionOutcome::Done,
            Err(err) => ExecutionOutcome::Failed {
                error: format!("storage error: {err}"),
                retryable: true,
                retry_after: None,
            },
        }
    }

    async fn enqueue_bounce_webhook(
        &self,
        job: &Job,
        message_id: &str,
        recipient: &str,
        error: &DeliveryError,
    ) {
        let Some(url) = &self.config.webhook_url else {
            return;
        };
        let webhook = Job::new(
            job.tenant_id,
            JobKind::SendWebhook {
                url: url.clone(),
                event: "bounce".to_string(),
                payload: serde_json::json!({
                    "message_id": message_id,
                    "recipient": recipient,
                    "classification": error.to_string(),
                }),
            },
        );
        if let Err(err) = self.queue.enqueue(webhook).await {
            error!(message_id, "failed to enqueue bounce webhook: {err}");
        }
    }

    async fn execute_send_webhook(
        &self,
        job: &Job,
        url: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> ExecutionOutcome {
        let body = serde_json::json!({
            "event": event,
            "tenant_id": job.tenant_id,
            "payload": payload,
            "attempt": job.attempts_made + 1,
        });

        match self.http.post(url).json(&body).send().await {
            Ok(response) if response.status().is_success() => ExecutionOutcome::Done,
            Ok(response) => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .map(Duration::from_secs);
                ExecutionOutcome::Failed {
                    error: format!("webhook endpoint returned {}", response.status()),
                    retryable: true,
                    retry_after,
                }
            }
            Err(err) => ExecutionOutcome::Failed {
                error: format!("webhook request failed: {err}"),
                retryable: true,
                retry_after: None,
            },
        }
    }

    /// Best-effort fold of a delivery event into rolling per-tenant counters.
    async fn execute_update_analytics(
        &self,
        job: &Job,
        event: &str,
        _payload: &serde_json::Value,
    ) -> ExecutionOutcome {
        let key = format!("analytics:{}:{event}", job.tenant_id);
        match self
            .queue
            .broker()
            .incr_window(&key, Duration::from_secs(24 * 60 * 60))
            .await
        {
            Ok(_) => ExecutionOutcome::Done,
            Err(err) => ExecutionOutcome::Failed {
                error: format!("analytics update failed: {err}"),
                retryable: false,
                retry_after: None,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        broker::Broker,
        delivery::{
            DeliveryConfig, DeliveryEngine, dns::DnsResolver, mock, pool::PoolConfig,
            pool::SmtpConnectionPool,
        },
        limiter::{RateLimitConfig, RateLimiter},
        models::{Direction, EmailRecord, Store, TenantId},
        queue::{QueueConfig, QueueService},
        reputation::{ReputationConfig, ReputationManager},
    };
    use mailcrab::TestMailServerHandle;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use uuid::Uuid;

    struct TestRig {
        pool: WorkerPool,
        queue: QueueService,
        emails: EmailRepository,
        events: EventRepository,
    }

    fn rig(resolver: mock::Resolver, webhook_url: Option<String>) -> TestRig {
        let store = Store::memory();
        let broker = Broker::memory();
        let events = EventRepository::new(store.clone());
        let emails = EmailRepository::new(store.clone());
        let queue = QueueService::new(broker, events.clone(), QueueConfig::default());
        let engine = DeliveryEngine::new(
            DnsResolver::mock(resolver),
            SmtpConnectionPool::new(
                PoolConfig {
                    allow_invalid_certs: true,
                    ..Default::default()
                },
                "test.example".into(),
            ),
            ReputationManager::new(ReputationConfig::default()),
            RateLimiter::new(Broker::memory(), RateLimitConfig::default()),
            events.clone(),
            DeliveryConfig {
                allow_plain: true,
                ..Default::default()
            },
        );
        let pool = WorkerPool::new(
            queue.clone(),
            emails.clone(),
            events.clone(),
            engine,
            WorkerConfig { webhook_url },
            CancellationToken::new(),
        );
        TestRig {
            pool,
            queue,
            emails,
            events,
        }
    }

    async fn seed_email(rig: &TestRig, tenant: TenantId, recipient: &str) -> String {
        let message_id = format!("{}@test.example", Uuid::new_v4());
        let email = EmailRecord::new(
            message_id.clone(),
            tenant,
            Direction::Outbound,
            "alice@verified.tld".into(),
            vec![recipient.to_string()],
            format!("From: alice@verified.tld\r\nTo: {recipient}\r\nSubject: hi\r\n\r\nhello\r\n")
                .into_bytes(),
        );
        rig.emails.upsert_pending(&email).await.unwrap();
        message_id
    }

    async fn rejecting_mx() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    let _ = write.write_all(b"220 reject.example ESMTP\r\n").await;
                    while let Ok(Some(line)) = lines.next_line().await {
                        let verb = line.split_whitespace().next().unwrap_or("").to_uppercase();
                        let reply: &[u8] = match verb.as_str() {
                            "EHLO" | "HELO" => b"250 reject.example\r\n",
                            "MAIL" => b"250 2.1.0 ok\r\n",
                            "RCPT" => b"550 5.1.1 no such user\r\n",
                            "QUIT" => {
                                let _ = write.write_all(b"221 2.0.0 bye\r\n").await;
                                return;
                            }
                            _ => b"250 2.0.0 ok\r\n",
                        };
                        if write.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn delivered_email_reaches_terminal_state() {
        let port = crate::test_support::random_port();
        let TestMailServerHandle { token, rx } =
            mailcrab::development_mail_server(Ipv4Addr::new(127, 0, 0, 1), port).await;
        let _guard = token.drop_guard();
        drop(rx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let rig = rig(mock::Resolver::local(port), None);
        let tenant = TenantId::from(Uuid::new_v4());
        let message_id = seed_email(&rig, tenant, "bob@example.org").await;

        rig.queue
            .enqueue(Job::new(
                tenant,
                JobKind::SendEmail {
                    message_id: message_id.clone(),
                    recipient: "bob@example.org".into(),
                },
            ))
            .await
            .unwrap();
        let job = rig.queue.next_job(QueueName::SendEmail).await.unwrap().unwrap();
        rig.pool.run_job(job).await;

        let email = rig.emails.get(&message_id).await.unwrap().unwrap();
        assert_eq!(email.status, EmailStatus::Delivered);
        assert_eq!(email.mx_server.as_deref(), Some("localhost"));
        assert_eq!(email.attempts, 1);
        assert!(email.delivered_at.is_some());
    }

    #[tokio::test]
    async fn recipient_rejection_bounces_and_notifies() {
        let port = rejecting_mx().await;
        let rig = rig(
            mock::Resolver {
                mx: vec![mock::mx(10, "localhost", port)],
                ..Default::default()
            },
            Some("http://localhost:9/webhooks".into()),
        );
        let tenant = TenantId::from(Uuid::new_v4());
        let message_id = seed_email(&rig, tenant, "nobody@example.org").await;

        rig.queue
            .enqueue(Job::new(
                tenant,
                JobKind::SendEmail {
                    message_id: message_id.clone(),
                    recipient: "nobody@example.org".into(),
                },
            ))
            .await
            .unwrap();
        let job = rig.queue.next_job(QueueName::SendEmail).await.unwrap().unwrap();
        rig.pool.run_job(job).await;

        let email = rig.emails.get(&message_id).await.unwrap().unwrap();
        assert_eq!(email.status, EmailStatus::Bounced);
        assert_eq!(email.attempts, 1);

        // a bounce webhook was enqueued with the classification
        let webhook = rig
            .queue
            .next_job(QueueName::SendWebhook)
            .await
            .unwrap()
            .unwrap();
        let JobKind::SendWebhook { event, payload, .. } = &webhook.kind else {
            panic!("expected webhook job");
        };
        assert_eq!(event, "bounce");
        assert_eq!(payload["recipient"], "nobody@example.org");
    }

    #[tokio::test]
    async fn tenant_mismatch_is_rejected_and_audited() {
        let rig = rig(mock::Resolver::default(), None);
        let owner = TenantId::from(Uuid::new_v4());
        let intruder = TenantId::from(Uuid::new_v4());
        let message_id = seed_email(&rig, owner, "bob@example.org").await;

        rig.pool
            .run_job(Job::new(
                intruder,
                JobKind::SendEmail {
                    message_id: message_id.clone(),
                    recipient: "bob@example.org".into(),
                },
            ))
            .await;

        // the email row is untouched and the attempt is audited
        let email = rig.emails.get(&message_id).await.unwrap().unwrap();
        assert_eq!(email.status, EmailStatus::Pending);
        assert_eq!(email.attempts, 0);
        let events = rig.events.security_events().await;
        assert!(events.iter().any(|e| e.reason.contains("tenant")));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_dead_lettered() {
        // DNS failure: retryable
        let rig = rig(
            mock::Resolver {
                fail: true,
                ..Default::default()
            },
            None,
        );
        let tenant = TenantId::from(Uuid::new_v4());
        let message_id = seed_email(&rig, tenant, "bob@example.org").await;

        rig.queue
            .enqueue(Job::new(
                tenant,
                JobKind::SendEmail {
                    message_id: message_id.clone(),
                    recipient: "bob@example.org".into(),
                },
            ))
            .await
            .unwrap();

        // burn through every attempt; a zero retry-delay keeps the job due
        for _ in 0..QueueName::SendEmail.default_max_attempts() {
            let job = rig
                .queue
                .next_job(QueueName::SendEmail)
                .await
                .unwrap()
                .expect("job should be due immediately in this test");
            match rig.pool.execute(&job).await {
                ExecutionOutcome::Failed { retryable, .. } => assert!(retryable),
                ExecutionOutcome::Done => panic!("execution must fail"),
            }
            rig.queue
                .fail(job, "dns-error", true, Some(Duration::ZERO))
                .await
                .unwrap();
        }

        // attempts exhausted: the job is dead-lettered with its final error
        assert!(rig.queue.next_job(QueueName::SendEmail).await.unwrap().is_none());
        let failures = rig.events.queue_failures().await;
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn webhooks_honour_retry_after() {
        // minimal HTTP endpoint that returns 503 with Retry-After: 7
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    use tokio::io::AsyncReadExt;
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 503 Service Unavailable\r\nRetry-After: 7\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });

        let rig = rig(mock::Resolver::default(), None);
        let job = Job::new(
            TenantId::from(Uuid::new_v4()),
            JobKind::SendWebhook {
                url: format!("http://127.0.0.1:{port}/hook"),
                event: "bounce".into(),
                payload: serde_json::json!({}),
            },
        );

        match rig.pool.execute(&job).await {
            ExecutionOutcome::Failed {
                retryable,
                retry_after,
                ..
            } => {
                assert!(retryable);
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            ExecutionOutcome::Done => panic!("503 must not complete the job"),
        }
    }

    #[tokio::test]
    async fn analytics_jobs_fold_into_counters() {
        let rig = rig(mock::Resolver::default(), None);
        let tenant = TenantId::from(Uuid::new_v4());
        let job = Job::new(
            tenant,
            JobKind::UpdateAnalytics {
                event: "delivered".into(),
                payload: serde_json::json!({"count": 1}),
            },
        );
        assert!(matches!(
            rig.pool.execute(&job).await,
            ExecutionOutcome::Done
        ));

        let counts = rig
            .queue
            .broker()
            .window_counts(&[format!("analytics:{tenant}:delivered")])
            .await
            .unwrap();
        assert_eq!(counts, vec![1]);
    }
}
