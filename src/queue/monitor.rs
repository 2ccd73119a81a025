use crate::{
    broker::now_unix,
    models::{EmailRepository, TenantId},
    queue::{Job, JobKind, QueueName, QueueService, QueueStats},
};
use chrono::Utc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// failures / (failures + completions) over the recent window.
    pub failure_rate_threshold: f64,
    pub waiting_threshold: u64,
    /// Interval after which a pending email without a settled job is
    /// re-enqueued.
    pub reconcile_after: Duration,
    /// Endpoint monitor alerts are posted to.
    pub alert_webhook_url: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_rate_threshold: 0.2,
            waiting_threshold: 1_000,
            reconcile_after: Duration::from_secs(60),
            alert_webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub rule: &'static str,
    pub queue: &'static str,
    pub detail: String,
}

/// Threshold evaluation, separated from sampling so it can be checked in
/// isolation.
pub fn evaluate(
    queue: QueueName,
    stats: &QueueStats,
    oldest_active_started: Option<u64>,
    config: &MonitorConfig,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    let settled = stats.failed_recent + stats.completed_recent;
    if settled > 0 {
        let rate = stats.failed_recent as f64 / settled as f64;
        if rate > config.failure_rate_threshold {
            alerts.push(Alert {
                rule: "high_failure_rate",
                queue: queue.as_str(),
                detail: format!("{:.0}% of recent jobs failed", rate * 100.0),
            });
        }
    }

    if stats.waiting > config.waiting_threshold {
        alerts.push(Alert {
            rule: "high_waiting_count",
            queue: queue.as_str(),
            detail: format!("{} jobs waiting", stats.waiting),
        });
    }

    if let Some(started) = oldest_active_started {
        let age = now_unix().saturating_sub(started);
        if age > queue.execution_deadline().as_secs() {
            alerts.push(Alert {
                rule: "queue_stuck",
                queue: queue.as_str(),
                detail: format!("oldest active job is {age}s old"),
            });
        }
    }

    alerts
}

/// Periodic health check of the queues: depth, failure rate, stuck jobs,
/// broker heartbeat. Also reconciles pending emails that lost their job.
pub struct QueueMonitor {
    queue: QueueService,
    emails: EmailRepository,
    config: MonitorConfig,
    system_tenant: TenantId,
    shutdown: CancellationToken,
}

impl QueueMonitor {
    pub fn new(
        queue: QueueService,
        emails: EmailRepository,
        config: MonitorConfig,
        system_tenant: TenantId,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            emails,
            config,
            system_tenant,
            shutdown,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                select! {
                    _ = self.shutdown.cancelled() => {
                        info!("queue monitor shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        self.sample().await;
                        self.reconcile().await;
                    }
                }
            }
        })
    }

    async fn sample(&self) {
        if let Err(err) = self.queue.broker().ping().await {
            error!("broker heartbeat failed: {err}");
            self.raise(Alert {
                rule: "broker_disconnection",
                queue: "*",
                detail: "heartbeat to key/value broker failed".to_string(),
            })
            .await;
            return;
        }

        for queue in QueueName::ALL {
            let stats = match self.queue.stats(queue).await {
                Ok(stats) => stats,
                Err(err) => {
                    warn!(queue = queue.as_str(), "failed to sample queue: {err}");
                    continue;
                }
            };
            let oldest = self.queue.oldest_active(queue).await.ok().flatten();
            debug!(
                queue = queue.as_str(),
                waiting = stats.waiting,
                active = stats.active,
                delayed = stats.delayed,
                "queue sample"
            );
            for alert in evaluate(queue, &stats, oldest, &self.config) {
                self.raise(alert).await;
            }
        }
    }

    async fn raise(&self, alert: Alert) {
        warn!(
            rule = alert.rule,
            queue = alert.queue,
            detail = alert.detail,
            "queue alert"
        );

        // alerts about the webhook queue itself are not pushed back into it
        if alert.queue == QueueName::SendWebhook.as_str() || alert.rule == "broker_disconnection" {
            return;
        }
        let Some(url) = &self.config.alert_webhook_url else {
            return;
        };

        let job = Job::new(
            self.system_tenant,
            JobKind::SendWebhook {
                url: url.clone(),
                event: "queue-alert".to_string(),
                payload: serde_json::json!({
                    "rule": alert.rule,
                    "queue": alert.queue,
                    "detail": alert.detail,
                }),
            },
        );
        if let Err(err) = self.queue.enqueue(job).await {
            error!("failed to enqueue alert webhook: {err}");
        }
    }

    /// No pending email may sit without a job: anything stale gets its
    /// send-email jobs re-enqueued. Workers treat replays as no-ops once the
    /// row settles, so over-enqueueing here is harmless.
    async fn reconcile(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.reconcile_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let stale = match self.emails.find_stale_pending(cutoff).await {
            Ok(stale) => stale,
            Err(err) => {
                error!("reconciler failed to scan pending emails: {err}");
                return;
            }
        };

        for email in stale {
            info!(
                message_id = email.message_id,
                "re-enqueueing stale pending email"
            );
            for recipient in &email.recipients {
                if email.recipient_status.contains_key(recipient) {
                    continue;
                }
                let job = Job::new(
                    email.tenant_id,
                    JobKind::SendEmail {
                        message_id: email.message_id.clone(),
                        recipient: recipient.clone(),
                    },
                );
                if let Err(err) = self.queue.enqueue(job).await {
                    error!(
                        message_id = email.message_id,
                        "reconciler failed to enqueue job: {err}"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        broker::Broker,
        models::{Direction, EmailRecord, EventRepository, Store},
        queue::QueueConfig,
    };
    use uuid::Uuid;

    fn stats(waiting: u64, completed: u64, failed: u64) -> QueueStats {
        QueueStats {
            waiting,
            active: 0,
            delayed: 0,
            completed_recent: completed,
            failed_recent: failed,
        }
    }

    #[test]
    fn failure_rate_rule_fires_above_threshold() {
        let config = MonitorConfig::default();
        let alerts = evaluate(QueueName::SendEmail, &stats(0, 7, 3), None, &config);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule, "high_failure_rate");

        let alerts = evaluate(QueueName::SendEmail, &stats(0, 9, 1), None, &config);
        assert!(alerts.is_empty());
    }

    #[test]
    fn quiet_queues_do_not_divide_by_zero() {
        let config = MonitorConfig::default();
        assert!(evaluate(QueueName::SendEmail, &stats(0, 0, 0), None, &config).is_empty());
    }

    #[test]
    fn waiting_depth_rule() {
        let config = MonitorConfig {
            waiting_threshold: 10,
            ..Default::default()
        };
        let alerts = evaluate(QueueName::SendWebhook, &stats(11, 0, 0), None, &config);
        assert_eq!(alerts[0].rule, "high_waiting_count");
    }

    #[test]
    fn stuck_rule_uses_the_queue_deadline() {
        let config = MonitorConfig::default();
        let long_ago = now_unix() - 10 * 60;
        let alerts = evaluate(QueueName::SendEmail, &stats(0, 0, 0), Some(long_ago), &config);
        assert_eq!(alerts[0].rule, "queue_stuck");

        // 10 minutes is fine for email (5 min deadline) but way past the
        // webhook deadline
        let recent = now_unix() - 10;
        let alerts = evaluate(QueueName::SendEmail, &stats(0, 0, 0), Some(recent), &config);
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn reconciler_reenqueues_stale_pending_emails() {
        let store = Store::memory();
        let emails = EmailRepository::new(store.clone());
        let queue = QueueService::new(
            Broker::memory(),
            EventRepository::new(store),
            QueueConfig::default(),
        );

        let email = EmailRecord::new(
            "stale@test.example".into(),
            Uuid::new_v4().into(),
            Direction::Outbound,
            "alice@verified.tld".into(),
            vec!["bob@example.org".into()],
            b"Subject: hi\r\n\r\nhello".to_vec(),
        );
        emails.upsert_pending(&email).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let monitor = QueueMonitor::new(
            queue.clone(),
            emails,
            MonitorConfig {
                reconcile_after: Duration::ZERO,
                ..Default::default()
            },
            Uuid::new_v4().into(),
            CancellationToken::new(),
        );
        monitor.reconcile().await;

        let job = queue.next_job(QueueName::SendEmail).await.unwrap().unwrap();
        let JobKind::SendEmail { message_id, .. } = job.kind else {
            panic!("expected a send-email job");
        };
        assert_eq!(message_id, "stale@test.example");
    }
}
