use crate::{
    limiter::{Decision, RateLimiter, Scope},
    models::{DeliveryAttempt, EventRepository, TenantId},
    reputation::{FailureKind, ReputationManager},
};
use mail_send::{SmtpClientBuilder, smtp::message::Message};
use smtp_proto::Severity;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod dns;
pub mod pool;

#[cfg(test)]
pub(crate) mod mock;

use dns::{DnsResolver, ResolveError};
use pool::SmtpConnectionPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Plaintext,
    Tls,
}

/// Emergency escape hatch for networks that block outbound 25: submit the
/// already-signed message to a relay instead of the recipient MX. Signatures
/// are untouched either way.
#[derive(Debug, Clone)]
pub enum DeliveryMode {
    Direct,
    Relay(RelayConfig),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub implicit_tls: bool,
    pub credentials: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub mode: DeliveryMode,
    /// Tries plaintext after TLS; development only.
    pub allow_plain: bool,
    /// Wall limit for one complete message transaction.
    pub message_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Direct,
            allow_plain: false,
            message_timeout: Duration::from_secs(120),
        }
    }
}

/// Delivery failure classification. Raw remote banners stay out of this;
/// only codes and classifications surface upward.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("destination rate-limited, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("destination temporarily blocked by reputation")]
    ReputationBlocked,
    #[error("DNS lookup failed")]
    Dns(String),
    #[error("domain has no mail servers")]
    NoMailServers,
    #[error("transient upstream failure: {0}")]
    UpstreamTransient(String),
    #[error("permanent upstream failure: {detail}")]
    UpstreamPermanent {
        detail: String,
        /// 5.1.x: the recipient itself was rejected.
        recipient_rejected: bool,
    },
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::RateLimited { .. }
            | DeliveryError::ReputationBlocked
            | DeliveryError::Dns(_)
            | DeliveryError::UpstreamTransient(_) => true,
            DeliveryError::NoMailServers | DeliveryError::UpstreamPermanent { .. } => false,
        }
    }

    /// Hint for the retry scheduler, where the failure carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            DeliveryError::RateLimited { .. } => "rate-limited",
            DeliveryError::ReputationBlocked => "reputation-blocked",
            DeliveryError::Dns(_) => "dns-error",
            DeliveryError::NoMailServers => "no-mail-servers",
            DeliveryError::UpstreamTransient(_) => "upstream-transient",
            DeliveryError::UpstreamPermanent { .. } => "upstream-permanent",
        }
    }
}

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub mx_server: Option<String>,
    pub error: Option<DeliveryError>,
}

impl DeliveryOutcome {
    fn delivered(mx_server: String) -> Self {
        Self {
            success: true,
            mx_server: Some(mx_server),
            error: None,
        }
    }

    fn failed(error: DeliveryError, mx_server: Option<String>) -> Self {
        Self {
            success: false,
            mx_server,
            error: Some(error),
        }
    }
}

/// One message for one recipient, already signed.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_id: String,
    pub tenant_id: TenantId,
    pub from: String,
    pub recipient: String,
    pub raw: Vec<u8>,
}

impl OutboundMessage {
    fn smtp_message(&self) -> Message<'_> {
        Message {
            mail_from: self.from.as_str().into(),
            rcpt_to: vec![self.recipient.as_str().into()],
            body: self.raw.as_slice().into(),
        }
    }

    fn destination_domain(&self) -> Option<&str> {
        self.recipient.rsplit_once('@').map(|(_, domain)| domain)
    }
}

enum AttemptError {
    Transient(String),
    Permanent { detail: String, recipient_rejected: bool },
}

/// Delivers one message to one recipient by talking directly to the
/// recipient domain's MX.
#[derive(Clone)]
pub struct DeliveryEngine {
    resolver: DnsResolver,
    pool: SmtpConnectionPool,
    reputation: ReputationManager,
    limiter: RateLimiter,
    events: EventRepository,
    config: DeliveryConfig,
}

impl DeliveryEngine {
    pub fn new(
        resolver: DnsResolver,
        pool: SmtpConnectionPool,
        reputation: ReputationManager,
        limiter: RateLimiter,
        events: EventRepository,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            resolver,
            pool,
            reputation,
            limiter,
            events,
            config,
        }
    }

    pub fn reputation(&self) -> &ReputationManager {
        &self.reputation
    }

    pub async fn deliver(&self, message: &OutboundMessage) -> DeliveryOutcome {
        let started = Instant::now();
        let outcome = match &self.config.mode {
            DeliveryMode::Direct => self.deliver_direct(message).await,
            DeliveryMode::Relay(relay) => self.deliver_via_relay(message, relay).await,
        };

        let destination = message.destination_domain().unwrap_or("invalid");
        let label = outcome
            .error
            .as_ref()
            .map(DeliveryError::label)
            .unwrap_or("delivered");
        if let Err(err) = self
            .events
            .record_delivery_attempt(DeliveryAttempt::new(
                message.tenant_id,
                &message.message_id,
                destination,
                outcome.mx_server.as_deref(),
                label,
                started.elapsed().as_millis() as i64,
            ))
            .await
        {
            warn!("failed to record delivery attempt: {err}");
        }

        outcome
    }

    async fn deliver_direct(&self, message: &OutboundMessage) -> DeliveryOutcome {
        let Some(domain) = message.destination_domain() else {
            return DeliveryOutcome::failed(
                DeliveryError::UpstreamPermanent {
                    detail: "recipient address has no domain".to_string(),
                    recipient_rejected: true,
                },
                None,
            );
        };

        match self.limiter.check(Scope::SendDestination, domain).await {
            Ok(Decision::Allowed) => {}
            Ok(Decision::Deferred { retry_after }) => {
                return DeliveryOutcome::failed(DeliveryError::RateLimited { retry_after }, None);
            }
            Err(err) => {
                return DeliveryOutcome::failed(
                    DeliveryError::UpstreamTransient(format!("broker unavailable: {err}")),
                    None,
                );
            }
        }

        let domain_key = ReputationManager::domain_key(domain);
        if !self.reputation.delivery_allowed(&domain_key) {
            return DeliveryOutcome::failed(DeliveryError::ReputationBlocked, None);
        }

        let candidates = match self.resolver.resolve_candidates(domain).await {
            Ok(candidates) => candidates,
            Err(ResolveError::NoMailServers) => {
                self.reputation
                    .record_failure(&domain_key, FailureKind::Transient);
                return DeliveryOutcome::failed(DeliveryError::NoMailServers, None);
            }
            Err(ResolveError::Dns(err)) => {
                return DeliveryOutcome::failed(DeliveryError::Dns(err), None);
            }
        };

        let order: &[Protection] = if self.config.allow_plain {
            &[Protection::Tls, Protection::Plaintext]
        } else {
            &[Protection::Tls]
        };

        let mut saw_transient = false;
        let mut saw_candidate = false;
        let mut last_permanent: Option<String> = None;

        for candidate in &candidates {
            let mx_key = ReputationManager::mx_key(&candidate.hostname);
            if !self.reputation.delivery_allowed(&mx_key) {
                debug!(mx = candidate.hostname, "skipping reputation-blocked MX");
                continue;
            }
            saw_candidate = true;

            for &protection in order {
                match self.attempt(message, &candidate.hostname, candidate.port, protection).await {
                    Ok(()) => {
                        self.reputation.record_success(&mx_key);
                        self.reputation.record_success(&domain_key);
                        info!(
                            message_id = message.message_id,
                            mx = candidate.hostname,
                            "message accepted by destination"
                        );
                        return DeliveryOutcome::delivered(candidate.hostname.clone());
                    }
                    Err(AttemptError::Transient(detail)) => {
                        debug!(mx = candidate.hostname, detail, "transient delivery failure");
                        self.reputation.record_failure(&mx_key, FailureKind::Transient);
                        saw_transient = true;
                    }
                    Err(AttemptError::Permanent {
                        detail,
                        recipient_rejected,
                    }) => {
                        self.reputation
                            .record_failure(&mx_key, FailureKind::HardBounce);
                        if recipient_rejected {
                            // a firmly rejected recipient is not retried on
                            // other hosts (RFC 5321 §4.2.4 guidance)
                            return DeliveryOutcome::failed(
                                DeliveryError::UpstreamPermanent {
                                    detail,
                                    recipient_rejected: true,
                                },
                                Some(candidate.hostname.clone()),
                            );
                        }
                        last_permanent = Some(detail);
                    }
                }
            }
        }

        if !saw_candidate && !candidates.is_empty() {
            return DeliveryOutcome::failed(DeliveryError::ReputationBlocked, None);
        }

        self.reputation
            .record_failure(&domain_key, FailureKind::Transient);
        if saw_transient {
            DeliveryOutcome::failed(
                DeliveryError::UpstreamTransient("all mail servers exhausted".to_string()),
                None,
            )
        } else {
            DeliveryOutcome::failed(
                DeliveryError::UpstreamPermanent {
                    detail: last_permanent.unwrap_or_else(|| "no mail server accepted the message".to_string()),
                    recipient_rejected: false,
                },
                None,
            )
        }
    }

    async fn attempt(
        &self,
        message: &OutboundMessage,
        hostname: &str,
        port: u16,
        protection: Protection,
    ) -> Result<(), AttemptError> {
        let mut session = self
            .pool
            .checkout(hostname, port, protection)
            .await
            .map_err(classify_send_error)?;

        let send = session.send(message.smtp_message());
        match tokio::time::timeout(self.config.message_timeout, send).await {
            Ok(Ok(())) => {
                self.pool.checkin(session).await;
                Ok(())
            }
            Ok(Err(err)) => {
                // an errored session never goes back to the pool
                drop(session);
                Err(classify_send_error(err))
            }
            Err(_) => {
                drop(session);
                Err(AttemptError::Transient("message transaction timed out".to_string()))
            }
        }
    }

    async fn deliver_via_relay(
        &self,
        message: &OutboundMessage,
        relay: &RelayConfig,
    ) -> DeliveryOutcome {
        debug!(relay = relay.host, "delivering through configured relay");

        let mut builder = SmtpClientBuilder::new(relay.host.clone(), relay.port)
            .implicit_tls(relay.implicit_tls)
            .timeout(Duration::from_secs(30));
        if let Some((username, password)) = &relay.credentials {
            builder = builder.credentials((username.clone(), password.clone()));
        }

        let send = async {
            let mut client = builder.connect().await?;
            client.send(message.smtp_message()).await?;
            client.quit().await
        };
        match tokio::time::timeout(self.config.message_timeout, send).await {
            Ok(Ok(())) => DeliveryOutcome::delivered(relay.host.clone()),
            Ok(Err(err)) => {
                let error = match classify_send_error(err) {
                    AttemptError::Transient(detail) => DeliveryError::UpstreamTransient(detail),
                    AttemptError::Permanent {
                        detail,
                        recipient_rejected,
                    } => DeliveryError::UpstreamPermanent {
                        detail,
                        recipient_rejected,
                    },
                };
                DeliveryOutcome::failed(error, Some(relay.host.clone()))
            }
            Err(_) => DeliveryOutcome::failed(
                DeliveryError::UpstreamTransient("relay transaction timed out".to_string()),
                Some(relay.host.clone()),
            ),
        }
    }
}

/// Maps client errors onto the transient/permanent taxonomy. Only codes are
/// kept; remote banner text never travels upward.
fn classify_send_error(err: mail_send::Error) -> AttemptError {
    match err {
        mail_send::Error::UnexpectedReply(response)
        | mail_send::Error::AuthenticationFailed(response) => {
            if response.severity() == Severity::TransientNegativeCompletion {
                AttemptError::Transient(format!("{} response", response.code))
            } else {
                let recipient_rejected = response.esc[0] == 5 && response.esc[1] == 1;
                AttemptError::Permanent {
                    detail: format!(
                        "{} {}.{}.{}",
                        response.code, response.esc[0], response.esc[1], response.esc[2]
                    ),
                    recipient_rejected,
                }
            }
        }
        mail_send::Error::Io(_)
        | mail_send::Error::Tls(_)
        | mail_send::Error::Base64(_)
        | mail_send::Error::Auth(_)
        | mail_send::Error::UnparseableReply
        | mail_send::Error::InvalidTLSName
        | mail_send::Error::Timeout => AttemptError::Transient("connection failure".to_string()),
        mail_send::Error::MissingCredentials
        | mail_send::Error::MissingMailFrom
        | mail_send::Error::MissingRcptTo
        | mail_send::Error::UnsupportedAuthMechanism
        | mail_send::Error::MissingStartTls => AttemptError::Permanent {
            detail: "session could not be established".to_string(),
            recipient_rejected: false,
        },
    }
}
