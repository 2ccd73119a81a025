use std::{sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod broker;
pub mod config;
pub mod delivery;
pub mod dkim;
pub mod limiter;
pub mod models;
pub mod processor;
pub mod queue;
pub mod reputation;
pub mod security;
pub mod smtp;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

use broker::Broker;
use config::Config;
use delivery::{DeliveryEngine, dns::DnsResolver, pool::SmtpConnectionPool};
use dkim::DkimManager;
use limiter::RateLimiter;
use models::{
    Domain, DomainRepository, EmailRepository, EventRepository, Store, User, UserRepository,
};
use processor::EmailProcessor;
use queue::{QueueService, monitor::QueueMonitor, worker::WorkerPool};
use reputation::ReputationManager;
use security::SecurityManager;
use smtp::{server::SmtpServer, session::SessionContext};
use validator::DomainValidator;

/// Installs the process-wide rustls crypto provider. Must run once before
/// any TLS config (inbound STARTTLS or outbound delivery) is built.
pub fn init_tls() {
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug,info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// The assembled mail-plane: everything the binaries pick pieces from.
#[derive(Clone)]
pub struct MailPlane {
    pub users: UserRepository,
    pub domains: DomainRepository,
    pub emails: EmailRepository,
    pub events: EventRepository,
    pub dkim: DkimManager,
    pub processor: EmailProcessor,
    pub queue: QueueService,
    pub limiter: RateLimiter,
    pub security: SecurityManager,
    pub reputation: ReputationManager,
    pub engine: DeliveryEngine,
    pub pool: SmtpConnectionPool,
    pub config: Arc<Config>,
}

impl MailPlane {
    pub fn assemble(config: Config, store: Store, broker: Broker) -> Self {
        let users = UserRepository::new(store.clone());
        let domains = DomainRepository::new(store.clone());
        let emails = EmailRepository::new(store.clone());
        let events = EventRepository::new(store);

        let reputation = ReputationManager::new(config.reputation.clone());
        let limiter = RateLimiter::new(broker.clone(), config.limits.clone());
        let security = SecurityManager::new(
            config.security.clone(),
            reputation.clone(),
            events.clone(),
        );
        let dkim = DkimManager::new(domains.clone(), config.dkim.clone());
        let validator = DomainValidator::new(domains.clone(), config.validator.clone());
        let queue = QueueService::new(broker, events.clone(), config.queue.clone());
        #[cfg(not(test))]
        let resolver = DnsResolver::new();
        #[cfg(test)]
        let resolver = DnsResolver::mock(Default::default());
        let processor = EmailProcessor::new(
            emails.clone(),
            domains.clone(),
            events.clone(),
            security.clone(),
            validator,
            dkim.clone(),
            queue.clone(),
            Some(resolver.clone()),
            config.processor.clone(),
        );
        let pool = SmtpConnectionPool::new(config.pool.clone(), config.smtp.hostname.clone());
        let engine = DeliveryEngine::new(
            resolver,
            pool.clone(),
            reputation.clone(),
            limiter.clone(),
            events.clone(),
            config.delivery.clone(),
        );

        Self {
            users,
            domains,
            emails,
            events,
            dkim,
            processor,
            queue,
            limiter,
            security,
            reputation,
            engine,
            pool,
            config: Arc::new(config),
        }
    }

    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            users: self.users.clone(),
            events: self.events.clone(),
            limiter: self.limiter.clone(),
            security: self.security.clone(),
            processor: self.processor.clone(),
        }
    }

    /// The primary system domain must exist with an active key before the
    /// first submission; the key comes from disk when configured, otherwise
    /// it is generated.
    pub async fn bootstrap_primary_domain(&self) -> Result<(), models::Error> {
        let primary = &self.config.dkim.primary_domain;
        if let Some(domain) = self.domains.find_by_name(primary).await? {
            if self.domains.active_key(domain.id()).await?.is_some() {
                return Ok(());
            }
            self.provision_primary_key(&domain).await?;
            return Ok(());
        }

        info!(domain = primary, "provisioning primary system domain");
        let system_user = User::new(
            uuid::Uuid::new_v4().into(),
            format!("postmaster@{primary}"),
            &random_password(),
        );
        self.users.create(&system_user).await?;
        let domain = Domain::new(system_user.tenant_id(), system_user.id(), primary.clone())
            .verified("system");
        self.domains.create(&domain).await?;
        self.provision_primary_key(&domain).await?;
        Ok(())
    }

    async fn provision_primary_key(&self, domain: &Domain) -> Result<(), models::Error> {
        let selector = self.config.dkim.selector.clone();
        let record = match &self.config.dkim_private_key_path {
            Some(path) => {
                let mut reader = std::io::BufReader::new(
                    std::fs::File::open(path)
                        .map_err(|e| models::Error::Internal(format!("DKIM key file: {e}")))?,
                );
                let key = rustls_pemfile::private_key(&mut reader)
                    .map_err(|e| models::Error::Internal(format!("DKIM key file: {e}")))?
                    .ok_or_else(|| {
                        models::Error::Internal("no private key in DKIM key file".to_string())
                    })?;
                let der = match key {
                    tokio_rustls::rustls::pki_types::PrivateKeyDer::Pkcs8(der) => {
                        der.secret_pkcs8_der().to_vec()
                    }
                    _ => {
                        return Err(models::Error::Internal(
                            "DKIM private key must be PKCS#8".to_string(),
                        ));
                    }
                };
                self.dkim.import(domain, &selector, der).await?
            }
            None => self.dkim.generate(domain, &selector).await?,
        };
        info!(
            domain = domain.name,
            selector, "publish this DKIM record: {record}"
        );
        Ok(())
    }
}

/// Runs the full mail-plane in one process: SMTP front-end, queue workers,
/// monitor, and the periodic sweeps.
pub async fn run_mta(plane: MailPlane, shutdown: CancellationToken) {
    let server = SmtpServer::new(
        plane.session_context(),
        Arc::new(plane.config.smtp.clone()),
        shutdown.clone(),
    );
    server.spawn();

    run_workers(&plane, shutdown.clone());

    // periodic sweeps: expired reputation blocks and idle pool sessions
    let reputation = plane.reputation.clone();
    let pool = plane.pool.clone();
    let sweep_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = sweep_shutdown.cancelled() => return,
                _ = interval.tick() => {
                    reputation.sweep();
                    pool.reap_idle().await;
                }
            }
        }
    });
}

/// Runs only the consuming side: queue workers and the monitor.
pub fn run_workers(plane: &MailPlane, shutdown: CancellationToken) {
    let workers = WorkerPool::new(
        plane.queue.clone(),
        plane.emails.clone(),
        plane.events.clone(),
        plane.engine.clone(),
        plane.config.worker.clone(),
        shutdown.clone(),
    );
    workers.spawn();

    let system_tenant = uuid::Uuid::new_v4().into();
    let monitor = QueueMonitor::new(
        plane.queue.clone(),
        plane.emails.clone(),
        plane.config.monitor.clone(),
        system_tenant,
        shutdown,
    );
    monitor.spawn();
}

pub async fn connect_store(config: &Config) -> anyhow::Result<Store> {
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;
            Ok(Store::postgres(pool))
        }
        None => {
            warn!("no DATABASE_URL configured, using the in-process store");
            Ok(Store::memory())
        }
    }
}

pub async fn connect_broker(config: &Config) -> Broker {
    match &config.broker {
        Some(settings) => {
            match Broker::connect(&settings.host, settings.port, &settings.namespace_prefix).await
            {
                Ok(broker) => broker,
                Err(err) => {
                    error!("broker unreachable, degrading to in-process state: {err}");
                    Broker::memory()
                }
            }
        }
        None => Broker::memory(),
    }
}

fn random_password() -> String {
    use rand::distr::{Alphanumeric, SampleString};
    Alphanumeric.sample_string(&mut rand::rng(), 32)
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
