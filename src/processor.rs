use crate::{
    delivery::dns::DnsResolver,
    dkim::{DkimManager, extract_signature_header, parse_dns_record, signature_tag},
    models::{
        Direction, Domain, DomainRepository, EmailRecord, EmailRepository, Error,
        EventRepository, EventSeverity, SecurityEvent, TenantId, User,
    },
    queue::{Job, JobKind, QueueService},
    security::SecurityManager,
    validator::{DomainValidator, FallbackPolicy},
};
use chrono::Utc;
use email_address::EmailAddress;
use mail_parser::{HeaderName, MessageParser};
use thiserror::Error as ThisError;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, ThisError)]
pub enum ProcessRejection {
    #[error("sender not allowed: {0}")]
    SenderNotAllowed(String),
    #[error("message classified as spam (score {0:.1})")]
    SpamDetected(f32),
    #[error("message rejected: {0}")]
    InvalidMessage(String),
    /// Storage or queue trouble; the client should retry.
    #[error("temporary processing failure")]
    Temporary(String),
}

impl From<Error> for ProcessRejection {
    fn from(err: Error) -> Self {
        ProcessRejection::Temporary(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Public identity; also the domain of generated message-ids.
    pub hostname: String,
    /// Primary system domain: fallback signer and fallback sender domain.
    pub primary_domain: String,
    pub mail_from_email: String,
    /// A failed inbound DKIM audit normally only records an event; this
    /// turns it into a rejection.
    pub reject_inbound_on_dkim_failure: bool,
}

/// An authenticated outbound submission, as handed over by the SMTP session
/// or the internal enqueue interface.
pub struct OutgoingSubmission {
    pub user: User,
    pub mail_from: EmailAddress,
    pub recipients: Vec<EmailAddress>,
    pub raw: Vec<u8>,
}

/// An anonymous inbound message addressed to a locally hosted domain.
pub struct IncomingMessage {
    pub mail_from: String,
    pub recipients: Vec<EmailAddress>,
    pub raw: Vec<u8>,
    pub remote_ip: String,
}

pub struct Accepted {
    pub message_id: String,
    /// The From was rewritten to the tenant fallback address.
    pub modified: bool,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Single entry point for accepted messages: validation, DKIM signing, and
/// fan-out between local delivery and the outbound queue.
#[derive(Clone)]
pub struct EmailProcessor {
    emails: EmailRepository,
    domains: DomainRepository,
    events: EventRepository,
    security: SecurityManager,
    validator: DomainValidator,
    dkim: DkimManager,
    queue: QueueService,
    dns: Option<DnsResolver>,
    config: ProcessorConfig,
}

impl EmailProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        emails: EmailRepository,
        domains: DomainRepository,
        events: EventRepository,
        security: SecurityManager,
        validator: DomainValidator,
        dkim: DkimManager,
        queue: QueueService,
        dns: Option<DnsResolver>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            emails,
            domains,
            events,
            security,
            validator,
            dkim,
            queue,
            dns,
            config,
        }
    }

    pub fn validate_local_recipient(&self, address: &EmailAddress) -> bool {
        self.validator.is_local_domain(address.domain())
    }

    pub fn validator(&self) -> &DomainValidator {
        &self.validator
    }

    /// Validates, signs and queues one authenticated submission. The Email
    /// row lands in `pending` before any job exists; a reconciler re-creates
    /// jobs for rows whose enqueue was interrupted.
    pub async fn process_outgoing(
        &self,
        submission: OutgoingSubmission,
    ) -> Result<Accepted, ProcessRejection> {
        let OutgoingSubmission {
            user,
            mail_from,
            recipients,
            mut raw,
        } = submission;

        let check = self.security.check_message(&raw);
        if !check.secure {
            return Err(ProcessRejection::InvalidMessage(check.issues.join("; ")));
        }

        let analysis = self.security.analyse_spam(&raw);
        if analysis.is_spam(self.security.spam_threshold()) {
            self.events
                .record_security_event(SecurityEvent::new(
                    "outbound message classified as spam",
                    mail_from.to_string(),
                    EventSeverity::Warning,
                ))
                .await?;
            return Err(ProcessRejection::SpamDetected(analysis.score));
        }

        let sender_check = self
            .validator
            .check(&user, &mail_from)
            .await?;

        let mut modified = false;
        let mut envelope_from = mail_from.clone();
        let signing_domain: Domain = if sender_check.ok {
            match sender_check.domain {
                Some(domain) => domain,
                // a local system domain without its own row signs as primary
                None => self.primary_domain().await?,
            }
        } else {
            if self.validator.policy() == FallbackPolicy::Reject {
                return Err(ProcessRejection::SenderNotAllowed(format!(
                    "domain {} is not verified for this account",
                    mail_from.domain()
                )));
            }
            let fallback = sender_check
                .fallback
                .ok_or_else(|| ProcessRejection::Temporary("no fallback sender".to_string()))?;
            debug!(from = %mail_from, fallback = %fallback, "rewriting unverified sender");
            replace_header(&mut raw, "From", fallback.as_str());
            envelope_from = fallback;
            modified = true;
            self.primary_domain().await?
        };

        let message_id = format!("{}@{}", Uuid::new_v4(), self.config.hostname);
        self.repair_headers(&mut raw, &message_id);

        // sign with the sender domain's key; a keyless domain falls back to
        // the primary key, which requires the primary envelope identity
        let mut dkim_header = self.dkim.sign(&signing_domain, &raw).await?;
        if dkim_header.is_none() && signing_domain.name != self.validator_primary() {
            warn!(
                domain = signing_domain.name,
                "domain has no active DKIM key, signing as primary"
            );
            let primary = self.primary_domain().await?;
            envelope_from = self
                .config
                .mail_from_email
                .parse::<EmailAddress>()
                .map_err(Error::Email)?;
            replace_header(&mut raw, "From", envelope_from.as_str());
            modified = true;
            dkim_header = self.dkim.sign(&primary, &raw).await?;
        }
        if let Some(header) = dkim_header {
            prepend_header(&mut raw, &header);
        }

        let subject = MessageParser::default()
            .parse(&raw)
            .and_then(|m| m.subject().map(str::to_string));

        let mut email = EmailRecord::new(
            message_id.clone(),
            user.tenant_id(),
            Direction::Outbound,
            envelope_from.to_string(),
            recipients.iter().map(|r| r.to_string()).collect(),
            raw,
        );
        email.user_id = Some(user.id());
        email.subject = subject;
        email.modified = modified;
        self.emails.upsert_pending(&email).await?;

        for recipient in &recipients {
            let job = Job::new(
                user.tenant_id(),
                JobKind::SendEmail {
                    message_id: message_id.clone(),
                    recipient: recipient.to_string(),
                },
            );
            self.queue
                .enqueue(job)
                .await
                .map_err(|err| ProcessRejection::Temporary(err.to_string()))?;
        }

        info!(
            message_id,
            tenant_id = %user.tenant_id(),
            recipients = recipients.len(),
            modified,
            "submission queued for delivery"
        );
        Ok(Accepted {
            message_id,
            modified,
        })
    }

    /// Records an inbound message addressed to a local domain. There is no
    /// onward relay, so acceptance is terminal.
    pub async fn process_incoming(
        &self,
        message: IncomingMessage,
    ) -> Result<Accepted, ProcessRejection> {
        let check = self.security.check_message(&message.raw);
        if !check.secure {
            self.events
                .record_security_event(
                    SecurityEvent::new(
                        "malformed inbound message",
                        message.mail_from.clone(),
                        EventSeverity::Warning,
                    )
                    .with_ip(message.remote_ip.clone()),
                )
                .await?;
            return Err(ProcessRejection::InvalidMessage(check.issues.join("; ")));
        }

        let analysis = self.security.analyse_spam(&message.raw);
        if analysis.is_spam(self.security.spam_threshold()) {
            // quarantine: the message is recorded, the event is audited,
            // nothing is relayed onward anyway
            self.events
                .record_security_event(
                    SecurityEvent::new(
                        "inbound message quarantined as spam",
                        message.mail_from.clone(),
                        EventSeverity::Warning,
                    )
                    .with_ip(message.remote_ip.clone()),
                )
                .await?;
        }

        if let Some(reason) = self.audit_inbound_dkim(&message.raw).await {
            self.events
                .record_security_event(
                    SecurityEvent::new(&reason, message.mail_from.clone(), EventSeverity::Info)
                        .with_ip(message.remote_ip.clone()),
                )
                .await?;
            if self.config.reject_inbound_on_dkim_failure {
                return Err(ProcessRejection::InvalidMessage(reason));
            }
        }

        let message_id = format!("{}@{}", Uuid::new_v4(), self.config.hostname);
        let subject = MessageParser::default()
            .parse(&message.raw)
            .and_then(|m| m.subject().map(str::to_string));

        let tenant = self.system_tenant().await?;
        let mut email = EmailRecord::new(
            message_id.clone(),
            tenant,
            Direction::Inbound,
            message.mail_from,
            message.recipients.iter().map(|r| r.to_string()).collect(),
            message.raw,
        );
        email.subject = subject;
        let stored = self.emails.upsert_pending(&email).await?;
        self.emails
            .transition(
                &stored.message_id,
                crate::models::EmailStatus::Pending,
                crate::models::EmailStatus::Delivered,
            )
            .await?;

        trace!(message_id, "inbound message recorded");
        Ok(Accepted {
            message_id,
            modified: false,
        })
    }

    /// The internal enqueue interface the HTTP façade consumes: builds the
    /// MIME message and routes it through the same validation and signing
    /// path as SMTP submissions.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_email(
        &self,
        user: &User,
        from: &str,
        to: &[String],
        subject: &str,
        html: Option<&str>,
        text: Option<&str>,
        headers: &[(String, String)],
        attachments: &[Attachment],
    ) -> Result<String, ProcessRejection> {
        let mail_from = from
            .parse::<EmailAddress>()
            .map_err(|err| ProcessRejection::InvalidMessage(err.to_string()))?;
        let mut recipients = Vec::with_capacity(to.len());
        for address in to {
            recipients.push(
                address
                    .parse::<EmailAddress>()
                    .map_err(|err| ProcessRejection::InvalidMessage(err.to_string()))?,
            );
        }
        if recipients.is_empty() {
            return Err(ProcessRejection::InvalidMessage(
                "no recipients".to_string(),
            ));
        }

        let mut builder = mail_builder::MessageBuilder::new()
            .from(("", from))
            .to(to.iter().map(|r| ("", r.as_str())).collect::<Vec<_>>())
            .subject(subject);
        if let Some(html) = html {
            builder = builder.html_body(html);
        }
        if let Some(text) = text {
            builder = builder.text_body(text);
        }
        for attachment in attachments {
            builder = builder.attachment(
                attachment.content_type.as_str(),
                attachment.filename.as_str(),
                attachment.body.as_slice(),
            );
        }
        let mut raw = builder
            .write_to_vec()
            .map_err(|err| ProcessRejection::InvalidMessage(err.to_string()))?;

        for (name, value) in headers.iter().rev() {
            prepend_header(&mut raw, &format!("{name}: {value}\r\n"));
        }

        let accepted = self
            .process_outgoing(OutgoingSubmission {
                user: user.clone(),
                mail_from,
                recipients,
                raw,
            })
            .await?;
        Ok(accepted.message_id)
    }

    /// Optional audit of an inbound DKIM signature: the signing domain must
    /// publish a well-formed key at the claimed selector. Returns a failure
    /// reason, or `None` when the audit passes or cannot run.
    async fn audit_inbound_dkim(&self, raw: &[u8]) -> Option<String> {
        let resolver = self.dns.as_ref()?;
        let header = extract_signature_header(raw)?;
        let domain = signature_tag(&header, "d")?.to_string();
        let selector = signature_tag(&header, "s")?.to_string();

        match resolver.dkim_txt(&selector, &domain).await {
            Ok(record) => match parse_dns_record(&record) {
                Ok(_) => None,
                Err(reason) => Some(format!(
                    "inbound DKIM audit failed for {domain}: {reason}"
                )),
            },
            Err(reason) => Some(format!(
                "inbound DKIM audit failed for {domain}: {reason}"
            )),
        }
    }

    fn validator_primary(&self) -> &str {
        &self.config.primary_domain
    }

    async fn primary_domain(&self) -> Result<Domain, ProcessRejection> {
        self.domains
            .find_by_name(self.validator_primary())
            .await?
            .ok_or_else(|| {
                ProcessRejection::Temporary("primary system domain is not provisioned".to_string())
            })
    }

    async fn system_tenant(&self) -> Result<TenantId, ProcessRejection> {
        Ok(self.primary_domain().await?.tenant_id())
    }

    /// Adds Message-ID and Date when the client left them out, the same way
    /// upstream MTAs repair submissions.
    fn repair_headers(&self, raw: &mut Vec<u8>, message_id: &str) {
        let (has_message_id, has_date) = {
            let parsed = MessageParser::default().parse(raw.as_slice());
            let has_header = |name: HeaderName| {
                parsed
                    .as_ref()
                    .and_then(|m| m.parts.first())
                    .is_some_and(|part| part.headers.iter().any(|h| h.name == name))
            };
            (has_header(HeaderName::MessageId), has_header(HeaderName::Date))
        };

        if !has_message_id {
            trace!("adding Message-ID header: {message_id}");
            prepend_header(raw, &format!("Message-ID: <{message_id}>\r\n"));
        }
        if !has_date {
            trace!("adding Date header");
            prepend_header(raw, &format!("Date: {}\r\n", Utc::now().to_rfc2822()));
        }
    }
}

fn prepend_header(raw: &mut Vec<u8>, header: &str) {
    let mut updated = Vec::with_capacity(raw.len() + header.len());
    updated.extend_from_slice(header.as_bytes());
    if !header.ends_with("\r\n") {
        updated.extend_from_slice(b"\r\n");
    }
    updated.extend_from_slice(raw);
    *raw = updated;
}

/// Replaces a header's value in the raw message, including any folded
/// continuation lines; prepends the header when it was absent.
fn replace_header(raw: &mut Vec<u8>, name: &str, value: &str) {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 2)
        .unwrap_or(raw.len());

    let prefix = format!("{}:", name.to_ascii_lowercase());
    let mut output = Vec::with_capacity(raw.len());
    let mut cursor = 0;
    let mut replaced = false;

    while cursor < header_end {
        let line_end = raw[cursor..header_end]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| cursor + p + 2)
            .unwrap_or(header_end);
        let line = &raw[cursor..line_end];

        let is_target = line.len() >= prefix.len()
            && line[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes());
        if is_target && !replaced {
            output.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
            replaced = true;
            // swallow folded continuation lines
            cursor = line_end;
            while cursor < header_end && (raw[cursor] == b' ' || raw[cursor] == b'\t') {
                let fold_end = raw[cursor..header_end]
                    .windows(2)
                    .position(|w| w == b"\r\n")
                    .map(|p| cursor + p + 2)
                    .unwrap_or(header_end);
                cursor = fold_end;
            }
            continue;
        }

        output.extend_from_slice(line);
        cursor = line_end;
    }

    output.extend_from_slice(&raw[header_end..]);
    if !replaced {
        prepend_header(&mut output, &format!("{name}: {value}\r\n"));
    }
    *raw = output;
}
