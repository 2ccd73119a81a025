use crate::{
    limiter::{Decision, RateLimiter, Scope},
    models::{AuthAttempt, EventRepository, User, UserRepository},
    processor::{EmailProcessor, IncomingMessage, OutgoingSubmission, ProcessRejection},
    security::SecurityManager,
    smtp::{ListenerKind, SmtpConfig},
    validator::FallbackPolicy,
};
use base64ct::{Base64, Encoding};
use email_address::EmailAddress;
use smtp_proto::{
    AUTH_LOGIN, AUTH_PLAIN, EXT_8BIT_MIME, EXT_ENHANCED_STATUS_CODES, EXT_PIPELINING, EXT_SIZE,
    EXT_START_TLS, EhloResponse, Request,
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, trace, warn};

/// Everything a session consults while handling commands.
#[derive(Clone)]
pub struct SessionContext {
    pub users: UserRepository,
    pub events: EventRepository,
    pub limiter: RateLimiter,
    pub security: SecurityManager,
    pub processor: EmailProcessor,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    /// Reply, then switch the connection into DATA ingestion.
    IngestData(u16, String),
    /// Reply with a 334 challenge, then feed the next line to
    /// [`SmtpSession::handle_auth_line`].
    IngestAuth(u16, String),
    /// Reply 220, then upgrade the stream to TLS.
    UpgradeTls(u16, String),
}

enum PendingAuth {
    Plain,
    LoginUsername,
    LoginPassword { username: String },
}

struct Envelope {
    from: Option<EmailAddress>,
    recipients: Vec<EmailAddress>,
}

/// Per-session SMTP state machine, shared between both listener kinds; the
/// kind selects the policy applied at each hook.
pub struct SmtpSession {
    kind: ListenerKind,
    ctx: SessionContext,
    config: Arc<SmtpConfig>,
    peer_addr: SocketAddr,
    peer_name: Option<String>,
    tls_active: bool,
    tls_available: bool,
    authenticated: Option<User>,
    envelope: Option<Envelope>,
    pending_auth: Option<PendingAuth>,
}

impl SmtpSession {
    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &str = "2.1.0 Originator ok";
    const RESPONSE_TO_OK: &str = "2.1.5 Recipient ok";
    const RESPONSE_SYNTAX_ERROR: &str = "5.5.2 Syntax error";
    const RESPONSE_AUTH_SUCCESS: &str = "2.7.0 Authentication succeeded";
    const RESPONSE_AUTH_FAILED: &str = "5.7.8 Authentication credentials invalid";
    const RESPONSE_AUTH_REQUIRED: &str = "5.7.0 Authentication required";
    const RESPONSE_STARTTLS_FIRST: &str = "5.7.0 Must issue a STARTTLS command first";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Say EHLO first";
    const RESPONSE_NO_VALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
    const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
    const RESPONSE_INVALID_RECIPIENT: &str = "5.1.3 This recipient address is not valid";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_ALREADY_AUTHENTICATED: &str = "5.5.1 Already authenticated";
    const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
    const RESPONSE_TLS_UNAVAILABLE: &str = "5.7.4 TLS not available";
    const RESPONSE_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
    const RESPONSE_RELAY_DENIED: &str = "5.7.1 Relay access denied";
    const RESPONSE_UNKNOWN_RECIPIENT: &str = "5.1.1 Unknown local recipient";
    const RESPONSE_TOO_MANY_RECIPIENTS: &str = "4.5.3 Too many recipients";
    const RESPONSE_RATE_LIMITED: &str = "4.7.0 Rate limit exceeded, try again later";
    const RESPONSE_TEMPORARY: &str = "4.3.0 Temporary processing failure, try again";

    pub fn new(
        kind: ListenerKind,
        ctx: SessionContext,
        config: Arc<SmtpConfig>,
        peer_addr: SocketAddr,
        tls_active: bool,
        tls_available: bool,
    ) -> Self {
        Self {
            kind,
            ctx,
            config,
            peer_addr,
            peer_name: None,
            tls_active,
            tls_available,
            authenticated: None,
            envelope: None,
            pending_auth: None,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    pub fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    /// RFC 3207: knowledge gained before the TLS handshake is discarded.
    pub fn tls_established(&mut self) {
        self.tls_active = true;
        self.peer_name = None;
        self.envelope = None;
        self.pending_auth = None;
        self.authenticated = None;
    }

    fn tls_satisfied_for_auth(&self) -> bool {
        self.tls_active || !self.config.require_tls
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                debug!("failed to parse request: {err}");
                return SessionReply::ReplyAndContinue(500, Self::RESPONSE_SYNTAX_ERROR.into());
            }
        };

        if let Request::Auth { mechanism, .. } = request {
            // credentials never reach the logs
            trace!(
                "received AUTH with mechanism {mechanism} from {}",
                self.peer_addr
            );
        } else {
            trace!("received request: {request:?} from {}", self.peer_addr);
        }

        match request {
            Request::Ehlo { host } => {
                // RFC 5321, 4.1.1.1
                let mut response = EhloResponse::new(self.config.hostname.clone());
                response.capabilities =
                    EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_PIPELINING | EXT_SIZE;
                response.size = self.config.max_message_size;
                if self.tls_available && !self.tls_active {
                    response.capabilities |= EXT_START_TLS;
                }
                if self.kind == ListenerKind::Submission && self.tls_satisfied_for_auth() {
                    response.capabilities |= smtp_proto::EXT_AUTH;
                    response.auth_mechanisms = AUTH_PLAIN | AUTH_LOGIN;
                }

                let mut buf = Vec::with_capacity(128);
                response.write(&mut buf).ok();
                self.peer_name = Some(host);
                SessionReply::RawReply(buf)
            }
            Request::Helo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::Lhlo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NOT_IMPLEMENTED.into())
            }
            Request::StartTls => {
                if self.tls_active {
                    SessionReply::ReplyAndContinue(504, Self::RESPONSE_ALREADY_TLS.into())
                } else if self.tls_available {
                    SessionReply::UpgradeTls(220, "2.0.0 Ready to start TLS".into())
                } else {
                    SessionReply::ReplyAndContinue(502, Self::RESPONSE_TLS_UNAVAILABLE.into())
                }
            }
            Request::Auth {
                mechanism,
                initial_response,
            } => self.handle_auth(mechanism, initial_response).await,
            Request::Quit => SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into()),
            Request::Noop { value: _ } => {
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Rset => {
                // RFC 5321, 4.1.1.5: clears the envelope, not EHLO or AUTH
                self.envelope = None;
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            // everything below requires a hello first
            _ignored if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Mail { from } => self.handle_mail_from(from.address).await,
            Request::Rcpt { to } => self.handle_rcpt_to(to.address).await,
            Request::Data => {
                let Some(envelope) = self.envelope.as_ref() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                };
                if envelope.recipients.is_empty() {
                    return SessionReply::ReplyAndContinue(
                        554,
                        Self::RESPONSE_NO_VALID_RECIPIENTS.into(),
                    );
                }
                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Vrfy { value: _ } => {
                SessionReply::ReplyAndContinue(502, "5.5.1 VRFY command is disabled".into())
            }
            Request::Bdat { .. }
            | Request::Expn { .. }
            | Request::Help { .. }
            | Request::Etrn { .. }
            | Request::Atrn { .. }
            | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NOT_IMPLEMENTED.into())
            }
        }
    }

    async fn handle_auth(&mut self, mechanism: u64, initial_response: String) -> SessionReply {
        // RFC 4954; AUTH only exists on the submission listener
        if self.kind == ListenerKind::Mx {
            return SessionReply::ReplyAndContinue(502, Self::RESPONSE_NOT_IMPLEMENTED.into());
        }
        if self.authenticated.is_some() {
            return SessionReply::ReplyAndContinue(
                503,
                Self::RESPONSE_ALREADY_AUTHENTICATED.into(),
            );
        }
        if !self.tls_satisfied_for_auth() {
            return SessionReply::ReplyAndContinue(530, Self::RESPONSE_STARTTLS_FIRST.into());
        }

        if mechanism == AUTH_PLAIN {
            if initial_response.is_empty() {
                self.pending_auth = Some(PendingAuth::Plain);
                return SessionReply::IngestAuth(334, String::new());
            }
            let mut data = initial_response.into_bytes();
            self.verify_plain_auth(&mut data).await
        } else if mechanism == AUTH_LOGIN {
            self.pending_auth = Some(PendingAuth::LoginUsername);
            // base64("Username:")
            SessionReply::IngestAuth(334, "VXNlcm5hbWU6".into())
        } else {
            debug!("received unsupported AUTH mechanism");
            SessionReply::ReplyAndContinue(504, "5.5.4 Mechanism not supported".into())
        }
    }

    /// Continuation line of a multi-step AUTH exchange.
    pub async fn handle_auth_line(&mut self, line: &[u8]) -> SessionReply {
        let trimmed = line.trim_ascii_end();
        if trimmed == b"*" {
            self.pending_auth = None;
            return SessionReply::ReplyAndContinue(501, "5.7.0 Authentication aborted".into());
        }

        match self.pending_auth.take() {
            Some(PendingAuth::Plain) => {
                let mut data = trimmed.to_vec();
                self.verify_plain_auth(&mut data).await
            }
            Some(PendingAuth::LoginUsername) => match Base64::decode_vec(
                std::str::from_utf8(trimmed).unwrap_or_default(),
            ) {
                Ok(username) if String::from_utf8(username.clone()).is_ok() => {
                    self.pending_auth = Some(PendingAuth::LoginPassword {
                        username: String::from_utf8(username).unwrap_or_default(),
                    });
                    // base64("Password:")
                    SessionReply::IngestAuth(334, "UGFzc3dvcmQ6".into())
                }
                _ => SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into()),
            },
            Some(PendingAuth::LoginPassword { username }) => {
                match Base64::decode_vec(std::str::from_utf8(trimmed).unwrap_or_default()) {
                    Ok(password) => {
                        let password = String::from_utf8(password).unwrap_or_default();
                        self.verify_credentials(&username, &password).await
                    }
                    Err(_) => SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into()),
                }
            }
            None => SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into()),
        }
    }

    pub fn auth_pending(&self) -> bool {
        self.pending_auth.is_some()
    }

    fn decode_plain_auth(data: &mut [u8]) -> Option<(String, String)> {
        // RFC 4616: authzid NUL authcid NUL passwd, base64 encoded
        let len = data.trim_ascii_end().len();
        let decoded = Base64::decode_in_place(&mut data[..len]).ok()?;

        let mut parts = decoded.split(|&b| b == 0);
        let authzid = parts.next()?;
        if !authzid.is_empty() {
            trace!(
                "ignoring authorization identity: {}",
                String::from_utf8_lossy(authzid)
            );
        }
        let username = std::str::from_utf8(parts.next()?).ok()?;
        let password = std::str::from_utf8(parts.next()?).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((username.to_string(), password.to_string()))
    }

    async fn verify_plain_auth(&mut self, data: &mut [u8]) -> SessionReply {
        let Some((username, password)) = Self::decode_plain_auth(data) else {
            return SessionReply::ReplyAndContinue(501, Self::RESPONSE_SYNTAX_ERROR.into());
        };
        self.verify_credentials(&username, &password).await
    }

    async fn verify_credentials(&mut self, username: &str, password: &str) -> SessionReply {
        let ip = self.peer_addr.ip().to_string();

        // every attempt is counted, including ones the limiter turns away
        let decision = self
            .ctx
            .limiter
            .check(Scope::Auth, &format!("{ip}:{username}"))
            .await;

        if let Ok(Decision::Deferred { retry_after }) = decision {
            self.record_auth_attempt(&ip, username, false).await;
            return SessionReply::ReplyAndContinue(
                421,
                format!(
                    "4.7.0 Too many authentication attempts, try again in {} seconds",
                    retry_after.as_secs()
                ),
            );
        }

        let verified = match self.ctx.users.find_active_by_email(username).await {
            Ok(Some(user)) if user.verify_password(password) => Some(user),
            Ok(_) => None,
            Err(err) => {
                warn!("credential lookup failed: {err}");
                return SessionReply::ReplyAndContinue(451, Self::RESPONSE_TEMPORARY.into());
            }
        };

        match verified {
            Some(user) => {
                self.record_auth_attempt(&ip, username, true).await;
                debug!(user = username, "authentication succeeded");
                self.authenticated = Some(user);
                SessionReply::ReplyAndContinue(235, Self::RESPONSE_AUTH_SUCCESS.into())
            }
            None => {
                self.record_auth_attempt(&ip, username, false).await;
                SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_FAILED.into())
            }
        }
    }

    async fn record_auth_attempt(&self, ip: &str, username: &str, success: bool) {
        if let Err(err) = self
            .ctx
            .events
            .record_auth_attempt(AuthAttempt::new(ip, username, success))
            .await
        {
            warn!("failed to record auth attempt: {err}");
        }
    }

    async fn handle_mail_from(&mut self, address: String) -> SessionReply {
        // RFC 5321, 4.1.1.2
        debug!("received MAIL FROM: {address}");

        if self.envelope.is_some() {
            return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
        }

        // the null reverse-path carries bounces
        let from = if address.is_empty() {
            None
        } else {
            match address.parse::<EmailAddress>() {
                Ok(from) => Some(from),
                Err(_) => {
                    return SessionReply::ReplyAndContinue(
                        553,
                        Self::RESPONSE_INVALID_SENDER.into(),
                    );
                }
            }
        };

        match self.kind {
            ListenerKind::Mx => {
                // envelope senders per IP share the connection window
                let subject = format!("mail:{}", self.peer_addr.ip());
                match self.ctx.limiter.check(Scope::Connection, &subject).await {
                    Ok(Decision::Allowed) => {}
                    Ok(Decision::Deferred { .. }) => {
                        return SessionReply::ReplyAndContinue(
                            421,
                            Self::RESPONSE_RATE_LIMITED.into(),
                        );
                    }
                    Err(err) => {
                        warn!("rate limiter unavailable: {err}");
                        return SessionReply::ReplyAndContinue(451, Self::RESPONSE_TEMPORARY.into());
                    }
                }
            }
            ListenerKind::Submission => {
                let Some(user) = self.authenticated.clone() else {
                    return SessionReply::ReplyAndContinue(530, Self::RESPONSE_AUTH_REQUIRED.into());
                };

                let mut scopes = vec![(Scope::SendUser, user.id().to_string())];
                if self.config.enforce_tenant_limits {
                    scopes.push((Scope::SendTenant, user.tenant_id().to_string()));
                }
                for (scope, subject) in scopes {
                    match self.ctx.limiter.check(scope, &subject).await {
                        Ok(Decision::Allowed) => {}
                        Ok(Decision::Deferred { retry_after }) => {
                            return SessionReply::ReplyAndContinue(
                                421,
                                format!(
                                    "4.7.0 Sending quota exceeded, try again in {} seconds",
                                    retry_after.as_secs()
                                ),
                            );
                        }
                        Err(err) => {
                            warn!("rate limiter unavailable: {err}");
                            return SessionReply::ReplyAndContinue(
                                451,
                                Self::RESPONSE_TEMPORARY.into(),
                            );
                        }
                    }
                }

                // under the reject policy an unusable sender domain fails
                // at MAIL FROM; under rewrite it is fixed up at processing
                if let Some(from) = &from
                    && self.ctx.processor.validator().policy() == FallbackPolicy::Reject
                {
                    match self.ctx.processor.validator().check(&user, from).await {
                        Ok(check) if !check.ok => {
                            return SessionReply::ReplyAndContinue(
                                550,
                                Self::RESPONSE_RELAY_DENIED.into(),
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!("sender validation failed: {err}");
                            return SessionReply::ReplyAndContinue(
                                451,
                                Self::RESPONSE_TEMPORARY.into(),
                            );
                        }
                    }
                }
            }
        }

        self.envelope = Some(Envelope {
            from,
            recipients: Vec::new(),
        });
        SessionReply::ReplyAndContinue(250, Self::RESPONSE_FROM_OK.into())
    }

    async fn handle_rcpt_to(&mut self, address: String) -> SessionReply {
        // RFC 5321, 4.1.1.3
        debug!("received RCPT TO: {address}");

        let Ok(recipient) = address.parse::<EmailAddress>() else {
            return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_RECIPIENT.into());
        };
        let Some(envelope) = self.envelope.as_mut() else {
            return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
        };
        if envelope.recipients.len() >= self.config.max_recipients {
            return SessionReply::ReplyAndContinue(452, Self::RESPONSE_TOO_MANY_RECIPIENTS.into());
        }

        // the MX port accepts local recipients only; everything else is an
        // attempt to use us as an open relay
        if self.kind == ListenerKind::Mx {
            if !self.ctx.processor.validate_local_recipient(&recipient) {
                if let Err(err) = self
                    .ctx
                    .security
                    .record_rejection(self.peer_addr.ip(), "relay attempt rejected")
                    .await
                {
                    warn!("failed to record relay rejection: {err}");
                }
                return SessionReply::ReplyAndContinue(550, Self::RESPONSE_RELAY_DENIED.into());
            }

            // role addresses are always deliverable (RFC 2142); anything
            // else must belong to a known user
            let local_part = recipient.local_part().to_ascii_lowercase();
            let is_role = matches!(local_part.as_str(), "postmaster" | "abuse" | "noreply");
            if !is_role {
                match self
                    .ctx
                    .users
                    .find_active_by_email(recipient.as_str())
                    .await
                {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        return SessionReply::ReplyAndContinue(
                            550,
                            Self::RESPONSE_UNKNOWN_RECIPIENT.into(),
                        );
                    }
                    Err(err) => {
                        warn!("recipient lookup failed: {err}");
                        return SessionReply::ReplyAndContinue(451, Self::RESPONSE_TEMPORARY.into());
                    }
                }
            }
        }

        envelope.recipients.push(recipient);
        SessionReply::ReplyAndContinue(250, Self::RESPONSE_TO_OK.into())
    }

    /// Complete DATA payload, terminator already stripped and transparency
    /// undone by the connection layer.
    pub async fn handle_data_complete(&mut self, raw: Vec<u8>) -> SessionReply {
        if raw.len() > self.config.max_message_size {
            self.envelope = None;
            return SessionReply::ReplyAndContinue(552, "5.3.4 Message exceeds size limit".into());
        }

        let Some(envelope) = self.envelope.take() else {
            return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        match self.kind {
            ListenerKind::Mx => {
                let message = IncomingMessage {
                    mail_from: envelope
                        .from
                        .as_ref()
                        .map(|f| f.to_string())
                        .unwrap_or_default(),
                    recipients: envelope.recipients,
                    raw,
                    remote_ip: self.peer_addr.ip().to_string(),
                };
                match self.ctx.processor.process_incoming(message).await {
                    Ok(accepted) => SessionReply::ReplyAndContinue(
                        250,
                        format!("2.6.0 Message accepted as {}", accepted.message_id),
                    ),
                    Err(rejection) => self.map_rejection(rejection).await,
                }
            }
            ListenerKind::Submission => {
                let Some(user) = self.authenticated.clone() else {
                    return SessionReply::ReplyAndContinue(530, Self::RESPONSE_AUTH_REQUIRED.into());
                };
                let Some(from) = envelope.from else {
                    // submissions have no business using the null sender
                    return SessionReply::ReplyAndContinue(
                        553,
                        Self::RESPONSE_INVALID_SENDER.into(),
                    );
                };
                let submission = OutgoingSubmission {
                    user,
                    mail_from: from,
                    recipients: envelope.recipients,
                    raw,
                };
                match self.ctx.processor.process_outgoing(submission).await {
                    Ok(accepted) => SessionReply::ReplyAndContinue(
                        250,
                        format!("2.6.0 Message queued for delivery as {}", accepted.message_id),
                    ),
                    Err(rejection) => self.map_rejection(rejection).await,
                }
            }
        }
    }

    /// Policy rejections are permanent; anything internal is 4xx so the
    /// client retries instead of losing mail.
    async fn map_rejection(&self, rejection: ProcessRejection) -> SessionReply {
        match rejection {
            ProcessRejection::SenderNotAllowed(reason) => {
                SessionReply::ReplyAndContinue(550, format!("5.7.1 {reason}"))
            }
            ProcessRejection::SpamDetected(score) => {
                if let Err(err) = self
                    .ctx
                    .security
                    .record_rejection(self.peer_addr.ip(), "message rejected as spam")
                    .await
                {
                    warn!("failed to record spam rejection: {err}");
                }
                SessionReply::ReplyAndContinue(
                    550,
                    format!("5.7.1 Message rejected by content policy (score {score:.1})"),
                )
            }
            ProcessRejection::InvalidMessage(reason) => {
                SessionReply::ReplyAndContinue(554, format!("5.6.0 {reason}"))
            }
            ProcessRejection::Temporary(reason) => {
                warn!("temporary processing failure: {reason}");
                SessionReply::ReplyAndContinue(451, Self::RESPONSE_TEMPORARY.into())
            }
        }
    }

    /// Accept-time screening shared by both listeners; the caller drops the
    /// connection with 421 on a deny.
    pub async fn screen_connection(
        ctx: &SessionContext,
        peer_addr: SocketAddr,
    ) -> Result<(), String> {
        match ctx.security.validate_connection(peer_addr.ip()).await {
            Ok(crate::security::ConnectionPolicy::Allow) => {}
            Ok(crate::security::ConnectionPolicy::Deny(reason)) => {
                return Err(format!("4.7.0 {reason}"));
            }
            Err(err) => {
                warn!("connection screening failed: {err}");
                return Err("4.3.0 Temporary failure".to_string());
            }
        }

        match ctx
            .limiter
            .check(Scope::Connection, &peer_addr.ip().to_string())
            .await
        {
            Ok(Decision::Allowed) => Ok(()),
            Ok(Decision::Deferred { retry_after }) => Err(format!(
                "4.7.0 Too many connections, try again in {} seconds",
                retry_after.as_secs()
            )),
            Err(err) => {
                warn!("rate limiter unavailable during accept: {err}");
                Err("4.3.0 Temporary failure".to_string())
            }
        }
    }

}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{TestStack, request};
    use crate::models::{Direction, EmailStatus};

    fn assert_reply(reply: &SessionReply, expected_code: u16) {
        match reply {
            SessionReply::ReplyAndContinue(code, _)
            | SessionReply::ReplyAndStop(code, _)
            | SessionReply::IngestData(code, _)
            | SessionReply::IngestAuth(code, _)
            | SessionReply::UpgradeTls(code, _) => {
                assert_eq!(*code, expected_code);
            }
            SessionReply::RawReply(_) => panic!("expected coded reply"),
        }
    }

    async fn authed_session(stack: &TestStack) -> SmtpSession {
        let mut session = stack.session(ListenerKind::Submission, true);
        let SessionReply::RawReply(_) = session.handle(request("EHLO client.example")).await else {
            panic!("EHLO must yield a capability list");
        };
        session
    }

    impl TestStack {
        async fn plain_auth(&self, session: &mut SmtpSession, user: &str, pass: &str) -> SessionReply {
            let token = Base64::encode_string(format!("\0{user}\0{pass}").as_bytes());
            session
                .handle(request(&format!("AUTH PLAIN {token}")))
                .await
        }
    }

    #[tokio::test]
    async fn ehlo_advertises_per_listener_capabilities() {
        let stack = TestStack::new().await;

        let mut mx = stack.session(ListenerKind::Mx, false);
        let SessionReply::RawReply(buf) = mx.handle(request("EHLO remote.example")).await else {
            panic!("EHLO must yield a capability list");
        };
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("SIZE"));
        assert!(text.contains("PIPELINING"));
        assert!(text.contains("8BITMIME"));
        assert!(text.contains("ENHANCEDSTATUSCODES"));
        assert!(!text.contains("AUTH "));

        let mut submission = stack.session(ListenerKind::Submission, true);
        let SessionReply::RawReply(buf) = submission.handle(request("EHLO client.example")).await
        else {
            panic!("EHLO must yield a capability list");
        };
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("AUTH"));
        assert!(text.contains("PLAIN"));
        assert!(text.contains("LOGIN"));
    }

    #[tokio::test]
    async fn auth_requires_tls_when_configured() {
        let stack = TestStack::strict_tls().await;
        let mut session = stack.session(ListenerKind::Submission, false);
        session.handle(request("EHLO client.example")).await;

        let reply = stack.plain_auth(&mut session, "alice@verified.tld", "s3cret").await;
        assert_reply(&reply, 530);
    }

    #[tokio::test]
    async fn plain_auth_succeeds_with_valid_credentials() {
        let stack = TestStack::new().await;
        let mut session = authed_session(&stack).await;

        let reply = stack.plain_auth(&mut session, "alice@verified.tld", "s3cret").await;
        assert_reply(&reply, 235);
    }

    #[tokio::test]
    async fn login_auth_prompts_for_both_parts() {
        let stack = TestStack::new().await;
        let mut session = authed_session(&stack).await;

        let reply = session.handle(request("AUTH LOGIN")).await;
        assert_reply(&reply, 334);
        assert!(session.auth_pending());

        let username = Base64::encode_string(b"alice@verified.tld");
        let reply = session.handle_auth_line(username.as_bytes()).await;
        assert_reply(&reply, 334);

        let password = Base64::encode_string(b"s3cret");
        let reply = session.handle_auth_line(password.as_bytes()).await;
        assert_reply(&reply, 235);
    }

    #[tokio::test]
    async fn wrong_password_returns_535_and_is_recorded() {
        let stack = TestStack::new().await;
        let mut session = authed_session(&stack).await;

        let reply = stack.plain_auth(&mut session, "alice@verified.tld", "wrong").await;
        assert_reply(&reply, 535);

        let failures = stack
            .events
            .count_recent_auth_failures("127.0.0.1", "alice@verified.tld", chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(failures, 1);
    }

    /// Attempts 1..=10 fail with 535; the 11th hits the lockout and returns
    /// 421 with a retry-after hint. All attempts land in the audit table.
    #[tokio::test]
    async fn repeated_auth_failures_lock_out() {
        let stack = TestStack::new().await;
        let mut session = authed_session(&stack).await;

        for _ in 0..10 {
            let reply = stack.plain_auth(&mut session, "alice@verified.tld", "wrong").await;
            assert_reply(&reply, 535);
        }
        let reply = stack.plain_auth(&mut session, "alice@verified.tld", "wrong").await;
        match reply {
            SessionReply::ReplyAndContinue(421, message) => {
                assert!(message.contains("try again in"));
            }
            _ => panic!("attempt 11 must be deferred"),
        }

        let failures = stack
            .events
            .count_recent_auth_failures("127.0.0.1", "alice@verified.tld", chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(failures, 11);
    }

    #[tokio::test]
    async fn submission_requires_auth_before_mail() {
        let stack = TestStack::new().await;
        let mut session = authed_session(&stack).await;

        let reply = session.handle(request("MAIL FROM:<alice@verified.tld>")).await;
        assert_reply(&reply, 530);
    }

    #[tokio::test]
    async fn relay_attempts_on_the_mx_port_are_denied() {
        let stack = TestStack::new().await;
        let mut session = stack.session(ListenerKind::Mx, false);
        session.handle(request("EHLO remote.example")).await;

        assert_reply(
            &session.handle(request("MAIL FROM:<x@external.example>")).await,
            250,
        );
        let reply = session.handle(request("RCPT TO:<y@external.example>")).await;
        assert_reply(&reply, 550);

        // a security event was recorded and no email row was created
        let events = stack.events.security_events().await;
        assert!(events.iter().any(|e| e.reason.contains("relay")));
    }

    #[tokio::test]
    async fn unknown_local_recipients_get_511() {
        let stack = TestStack::new().await;
        let mut session = stack.session(ListenerKind::Mx, false);
        session.handle(request("EHLO remote.example")).await;
        session.handle(request("MAIL FROM:<x@external.example>")).await;

        let reply = session.handle(request("RCPT TO:<nobody@mail.example>")).await;
        match reply {
            SessionReply::ReplyAndContinue(550, message) => {
                assert!(message.starts_with("5.1.1"));
            }
            _ => panic!("unknown local recipient must get 550 5.1.1"),
        }

        // role addresses and real users are deliverable
        assert_reply(
            &session.handle(request("RCPT TO:<abuse@mail.example>")).await,
            250,
        );
        assert_reply(
            &session
                .handle(request("RCPT TO:<postmaster@mail.example>"))
                .await,
            250,
        );
    }

    #[tokio::test]
    async fn mx_accepts_mail_for_local_domains() {
        let stack = TestStack::new().await;
        let mut session = stack.session(ListenerKind::Mx, false);
        session.handle(request("EHLO remote.example")).await;

        session.handle(request("MAIL FROM:<someone@external.example>")).await;
        assert_reply(
            &session.handle(request("RCPT TO:<postmaster@mail.example>")).await,
            250,
        );
        assert_reply(&session.handle(request("DATA")).await, 354);

        let reply = session
            .handle_data_complete(
                b"From: someone@external.example\r\nSubject: q\r\nDate: Mon, 1 Jan 2024 10:00:00 +0000\r\n\r\nhello\r\n"
                    .to_vec(),
            )
            .await;
        assert_reply(&reply, 250);

        // accepted with 250 implies a terminal inbound row exists
        let emails = stack.all_emails().await;
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].direction, Direction::Inbound);
        assert_eq!(emails[0].status, EmailStatus::Delivered);
    }

    #[tokio::test]
    async fn full_submission_queues_an_outbound_email() {
        let stack = TestStack::new().await;
        let mut session = authed_session(&stack).await;
        stack.plain_auth(&mut session, "alice@verified.tld", "s3cret").await;

        assert_reply(
            &session.handle(request("MAIL FROM:<alice@verified.tld>")).await,
            250,
        );
        assert_reply(&session.handle(request("RCPT TO:<bob@gmail.com>")).await, 250);
        assert_reply(&session.handle(request("DATA")).await, 354);

        let reply = session
            .handle_data_complete(
                b"From: alice@verified.tld\r\nTo: bob@gmail.com\r\nSubject: hi\r\n\r\nhello\r\n"
                    .to_vec(),
            )
            .await;
        match reply {
            SessionReply::ReplyAndContinue(250, message) => {
                assert!(message.contains("queued for delivery"));
            }
            _ => panic!("submission must be accepted"),
        }

        let emails = stack.all_emails().await;
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].direction, Direction::Outbound);
        assert_eq!(emails[0].status, EmailStatus::Pending);
    }

    #[tokio::test]
    async fn data_with_no_recipients_is_refused() {
        let stack = TestStack::new().await;
        let mut session = stack.session(ListenerKind::Mx, false);
        session.handle(request("EHLO remote.example")).await;
        session.handle(request("MAIL FROM:<x@external.example>")).await;

        assert_reply(&session.handle(request("DATA")).await, 554);
    }

    #[tokio::test]
    async fn size_cap_boundary() {
        let stack = TestStack::new().await;
        let mut session = stack.session(ListenerKind::Mx, false);
        session.handle(request("EHLO remote.example")).await;
        session.handle(request("MAIL FROM:<x@external.example>")).await;
        session.handle(request("RCPT TO:<postmaster@mail.example>")).await;
        session.handle(request("DATA")).await;

        let cap = session.max_message_size();
        let padded = |len: usize| {
            let mut message = b"From: x@external.example\r\nSubject: big\r\nDate: Mon, 1 Jan 2024 10:00:00 +0000\r\n\r\n".to_vec();
            message.resize(len, b'a');
            message
        };
        assert_reply(&session.handle_data_complete(padded(cap)).await, 250);

        session.handle(request("MAIL FROM:<x@external.example>")).await;
        session.handle(request("RCPT TO:<postmaster@mail.example>")).await;
        session.handle(request("DATA")).await;
        assert_reply(&session.handle_data_complete(padded(cap + 1)).await, 552);
    }

    #[tokio::test]
    async fn rset_clears_the_envelope_only() {
        let stack = TestStack::new().await;
        let mut session = authed_session(&stack).await;
        stack.plain_auth(&mut session, "alice@verified.tld", "s3cret").await;

        session.handle(request("MAIL FROM:<alice@verified.tld>")).await;
        assert_reply(&session.handle(request("RSET")).await, 250);

        // envelope is gone, auth is kept
        assert_reply(&session.handle(request("RCPT TO:<bob@gmail.com>")).await, 503);
        assert_reply(
            &session.handle(request("MAIL FROM:<alice@verified.tld>")).await,
            250,
        );
    }

    #[tokio::test]
    async fn starttls_resets_prior_knowledge() {
        let stack = TestStack::strict_tls().await;
        let mut session = stack.session_with_tls_available(ListenerKind::Submission);
        session.handle(request("EHLO client.example")).await;

        let reply = session.handle(request("STARTTLS")).await;
        assert_reply(&reply, 220);

        session.tls_established();
        // pre-handshake EHLO state was discarded
        let reply = session.handle(request("MAIL FROM:<alice@verified.tld>")).await;
        assert_reply(&reply, 503);
    }
}
