//! Shared fixtures for the test-suite: an in-process stack wired the same
//! way the binaries wire the production one.

use crate::{
    broker::Broker,
    dkim::{DkimManager, DkimSettings},
    limiter::{RateLimitConfig, RateLimiter},
    models::{
        Domain, DomainRepository, EmailRecord, EmailRepository, EventRepository, Store, TenantId,
        User, UserRepository,
    },
    processor::{EmailProcessor, ProcessorConfig},
    queue::{QueueConfig, QueueService},
    reputation::{ReputationConfig, ReputationManager},
    security::{SecurityConfig, SecurityManager},
    smtp::{ListenerKind, SmtpConfig, session::{SessionContext, SmtpSession}},
    validator::{DomainValidator, FallbackPolicy, ValidatorConfig},
};
use smtp_proto::Request;
use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
};
use uuid::Uuid;

pub fn random_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("no free port available")
        .local_addr()
        .unwrap()
        .port()
}

pub fn request(line: &str) -> Result<Request<String>, smtp_proto::Error> {
    let mut data = line.to_string();
    if !data.ends_with("\r\n") {
        data.push_str("\r\n");
    }
    Request::parse(&mut data.as_bytes().iter()).map(|request| request.into_owned())
}

pub struct TestStack {
    pub store: Store,
    pub users: UserRepository,
    pub domains: DomainRepository,
    pub emails: EmailRepository,
    pub events: EventRepository,
    pub queue: QueueService,
    pub dkim: DkimManager,
    pub processor: EmailProcessor,
    pub limiter: RateLimiter,
    pub security: SecurityManager,
    pub config: Arc<SmtpConfig>,
    pub tenant: TenantId,
}

impl TestStack {
    pub async fn new() -> Self {
        Self::build(false).await
    }

    pub async fn strict_tls() -> Self {
        Self::build(true).await
    }

    async fn build(require_tls: bool) -> Self {
        let store = Store::memory();
        let broker = Broker::memory();
        let users = UserRepository::new(store.clone());
        let domains = DomainRepository::new(store.clone());
        let emails = EmailRepository::new(store.clone());
        let events = EventRepository::new(store.clone());
        let queue = QueueService::new(broker.clone(), events.clone(), QueueConfig::default());
        let limiter = RateLimiter::new(broker, RateLimitConfig::default());
        let reputation = ReputationManager::new(ReputationConfig::default());
        let security =
            SecurityManager::new(SecurityConfig::default(), reputation, events.clone());
        let dkim = DkimManager::new(
            domains.clone(),
            DkimSettings {
                primary_domain: "mail.example".into(),
                selector: "mail".into(),
                testing_mode: false,
            },
        );
        let validator = DomainValidator::new(
            domains.clone(),
            ValidatorConfig {
                local_domains: vec!["mail.example".into()],
                primary_domain: "mail.example".into(),
                policy: FallbackPolicy::Rewrite,
            },
        );
        let processor = EmailProcessor::new(
            emails.clone(),
            domains.clone(),
            events.clone(),
            security.clone(),
            validator,
            dkim.clone(),
            queue.clone(),
            None,
            ProcessorConfig {
                hostname: "mail.example".into(),
                primary_domain: "mail.example".into(),
                mail_from_email: "noreply@mail.example".into(),
                reject_inbound_on_dkim_failure: false,
            },
        );

        // primary system domain with an active key
        let system_tenant = TenantId::from(Uuid::new_v4());
        let system_user = User::new(system_tenant, "postmaster@mail.example".into(), "pw");
        users.create(&system_user).await.unwrap();
        let primary = Domain::new(system_tenant, system_user.id(), "mail.example".into())
            .verified("system");
        domains.create(&primary).await.unwrap();
        dkim.generate(&primary, "mail").await.unwrap();

        // one tenant with a verified sending domain
        let tenant = TenantId::from(Uuid::new_v4());
        let alice = User::new(tenant, "alice@verified.tld".into(), "s3cret");
        users.create(&alice).await.unwrap();
        let owned = Domain::new(tenant, alice.id(), "verified.tld".into()).verified("dns-txt");
        domains.create(&owned).await.unwrap();
        dkim.generate(&owned, "mail").await.unwrap();

        let config = Arc::new(SmtpConfig {
            hostname: "mail.example".into(),
            max_message_size: 64 * 1024,
            require_tls,
            ..Default::default()
        });

        Self {
            store,
            users,
            domains,
            emails,
            events,
            queue,
            dkim,
            processor,
            limiter,
            security,
            config,
            tenant,
        }
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            users: self.users.clone(),
            events: self.events.clone(),
            limiter: self.limiter.clone(),
            security: self.security.clone(),
            processor: self.processor.clone(),
        }
    }

    pub fn session(&self, kind: ListenerKind, tls_active: bool) -> SmtpSession {
        let peer: SocketAddr = "127.0.0.1:52525".parse().unwrap();
        SmtpSession::new(kind, self.context(), self.config.clone(), peer, tls_active, false)
    }

    pub fn session_with_tls_available(&self, kind: ListenerKind) -> SmtpSession {
        let peer: SocketAddr = "127.0.0.1:52525".parse().unwrap();
        SmtpSession::new(kind, self.context(), self.config.clone(), peer, false, true)
    }

    pub async fn all_emails(&self) -> Vec<EmailRecord> {
        match &self.store {
            Store::Memory(mem) => mem.emails.lock().unwrap().values().cloned().collect(),
            Store::Postgres(_) => unimplemented!("test helper"),
        }
    }
}
