use crate::{
    delivery::{DeliveryConfig, DeliveryMode, RelayConfig, pool::PoolConfig},
    dkim::DkimSettings,
    limiter::{RateLimitConfig, ScopeLimit},
    processor::ProcessorConfig,
    queue::{QueueConfig, monitor::MonitorConfig},
    queue::worker::WorkerConfig,
    reputation::ReputationConfig,
    security::SecurityConfig,
    smtp::SmtpConfig,
    validator::{FallbackPolicy, ValidatorConfig},
};
use std::{
    env,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Fatal at startup only; nothing runs with a half-parsed configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("unrecognised configuration key {0}")]
    UnknownKey(String),
}

/// Every environment variable the process recognises.
const KNOWN_KEYS: &[&str] = &[
    "SMTP_MX_PORT",
    "SMTP_SUBMISSION_PORT",
    "SMTP_HOSTNAME",
    "SMTP_CERT_FILE",
    "SMTP_KEY_FILE",
    "SMTP_MAX_MESSAGE_SIZE",
    "SMTP_REQUIRE_TLS",
    "SMTP_ALLOW_PLAIN_DELIVERY",
    "DKIM_DOMAIN",
    "DKIM_SELECTOR",
    "DKIM_PRIVATE_KEY_PATH",
    "DKIM_TESTING_MODE",
    "DKIM_REJECT_INBOUND",
    "MAIL_FROM_NAME",
    "MAIL_FROM_EMAIL",
    "QUEUE_CONCURRENCY",
    "QUEUE_CLEANUP_INTERVAL",
    "RATE_LIMIT_CONNECTION_MAX",
    "RATE_LIMIT_CONNECTION_WINDOW_SECS",
    "RATE_LIMIT_AUTH_MAX",
    "RATE_LIMIT_AUTH_WINDOW_SECS",
    "RATE_LIMIT_SEND_USER_MAX",
    "RATE_LIMIT_SEND_USER_WINDOW_SECS",
    "RATE_LIMIT_SEND_TENANT_MAX",
    "RATE_LIMIT_SEND_TENANT_WINDOW_SECS",
    "RATE_LIMIT_SEND_DESTINATION_MAX",
    "RATE_LIMIT_SEND_DESTINATION_WINDOW_SECS",
    "BROKER_HOST",
    "BROKER_PORT",
    "BROKER_NAMESPACE_PREFIX",
    "RELAY_HOST",
    "RELAY_PORT",
];

/// Typo protection: anything under one of our variable families that is
/// not a recognised key fails startup instead of silently defaulting.
const GUARDED_PREFIXES: &[&str] = &[
    "SMTP_", "DKIM_", "MAIL_FROM_", "QUEUE_", "RATE_LIMIT_", "BROKER_", "RELAY_",
];

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub namespace_prefix: String,
}

#[derive(Clone)]
pub struct Config {
    pub smtp: SmtpConfig,
    pub dkim: DkimSettings,
    pub dkim_private_key_path: Option<PathBuf>,
    pub processor: ProcessorConfig,
    pub validator: ValidatorConfig,
    pub limits: RateLimitConfig,
    pub reputation: ReputationConfig,
    pub security: SecurityConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub monitor: MonitorConfig,
    pub delivery: DeliveryConfig,
    pub pool: PoolConfig,
    pub broker: Option<BrokerSettings>,
    pub database_url: Option<String>,
    pub mail_from_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        for (key, _) in env::vars() {
            if GUARDED_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
                && !KNOWN_KEYS.contains(&key.as_str())
            {
                return Err(ConfigError::UnknownKey(key));
            }
        }

        let hostname = require("SMTP_HOSTNAME")?;
        let primary_domain = optional("DKIM_DOMAIN").unwrap_or_else(|| hostname.clone());
        let selector = optional("DKIM_SELECTOR").unwrap_or_else(|| "mail".to_string());
        let mail_from_email =
            optional("MAIL_FROM_EMAIL").unwrap_or_else(|| format!("noreply@{primary_domain}"));

        let mx_port: u16 = parse_or("SMTP_MX_PORT", 2525)?;
        let submission_port: u16 = parse_or("SMTP_SUBMISSION_PORT", 587)?;

        let local_domains = optional("LOCAL_DOMAINS")
            .map(|raw| {
                raw.split(',')
                    .map(|domain| domain.trim().to_ascii_lowercase())
                    .filter(|domain| !domain.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec![primary_domain.clone()]);

        let policy = match optional("SENDER_FALLBACK_POLICY").as_deref() {
            None | Some("rewrite") => FallbackPolicy::Rewrite,
            Some("reject") => FallbackPolicy::Reject,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "SENDER_FALLBACK_POLICY".into(),
                    value: other.to_string(),
                });
            }
        };

        let spam_phrases = optional("SPAM_PHRASES").map(|raw| {
            let phrases: Vec<String> = raw
                .split([',', '\n'])
                .map(str::trim)
                .filter(|phrase| !phrase.is_empty())
                .map(str::to_string)
                .collect();
            // a malformed rule must fail startup, not silently fall back
            regex::RegexSet::new(&phrases).map(|_| phrases).map_err(|_| {
                ConfigError::Invalid {
                    key: "SPAM_PHRASES".into(),
                    value: raw,
                }
            })
        });
        let spam_phrases = spam_phrases.transpose()?;

        let deny_list = optional("DENY_LIST")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(|entry| {
                        entry.parse::<IpAddr>().map_err(|_| ConfigError::Invalid {
                            key: "DENY_LIST".into(),
                            value: entry.to_string(),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let mode = match optional("RELAY_HOST") {
            Some(host) => DeliveryMode::Relay(RelayConfig {
                host,
                port: parse_or("RELAY_PORT", 587)?,
                implicit_tls: false,
                credentials: None,
            }),
            None => DeliveryMode::Direct,
        };

        let broker = optional("BROKER_HOST").map(|host| {
            Ok::<_, ConfigError>(BrokerSettings {
                host,
                port: parse_or("BROKER_PORT", 6379)?,
                namespace_prefix: optional("BROKER_NAMESPACE_PREFIX")
                    .unwrap_or_else(|| "mailplane".to_string()),
            })
        });
        let broker = broker.transpose()?;

        let enforce_tenant_limits = parse_or("ENABLE_TENANT_ISOLATION", true)?;

        Ok(Self {
            smtp: SmtpConfig {
                hostname: hostname.clone(),
                mx_addr: SocketAddr::from(([0, 0, 0, 0], mx_port)),
                submission_addr: SocketAddr::from(([0, 0, 0, 0], submission_port)),
                cert_file: optional("SMTP_CERT_FILE").map(PathBuf::from),
                key_file: optional("SMTP_KEY_FILE").map(PathBuf::from),
                max_message_size: parse_or("SMTP_MAX_MESSAGE_SIZE", 20 * 1024 * 1024)?,
                idle_timeout: Duration::from_secs(60),
                require_tls: parse_or("SMTP_REQUIRE_TLS", true)?,
                max_recipients: 100,
                enforce_tenant_limits,
            },
            dkim: DkimSettings {
                primary_domain: primary_domain.clone(),
                selector,
                testing_mode: parse_or("DKIM_TESTING_MODE", false)?,
            },
            dkim_private_key_path: optional("DKIM_PRIVATE_KEY_PATH").map(PathBuf::from),
            processor: ProcessorConfig {
                hostname: hostname.clone(),
                primary_domain: primary_domain.clone(),
                mail_from_email: mail_from_email.clone(),
                reject_inbound_on_dkim_failure: parse_or("DKIM_REJECT_INBOUND", false)?,
            },
            validator: ValidatorConfig {
                local_domains,
                primary_domain,
                policy,
            },
            limits: RateLimitConfig {
                connection: scope_limit("CONNECTION", 60, 30)?,
                auth: scope_limit("AUTH", 15 * 60, 10)?,
                send_user: scope_limit("SEND_USER", 60 * 60, 1_000)?,
                send_tenant: scope_limit("SEND_TENANT", 60 * 60, 10_000)?,
                send_destination: scope_limit("SEND_DESTINATION", 60, 100)?,
                ..Default::default()
            },
            reputation: ReputationConfig::default(),
            security: {
                let mut security = SecurityConfig {
                    deny_list,
                    spam_threshold: parse_or("SPAM_THRESHOLD", 5.0)?,
                    ..Default::default()
                };
                if let Some(phrases) = spam_phrases {
                    security.spam_phrases = phrases;
                }
                security
            },
            queue: QueueConfig {
                concurrency: parse_or("QUEUE_CONCURRENCY", 5)?,
                ..Default::default()
            },
            worker: WorkerConfig {
                webhook_url: optional("WEBHOOK_URL"),
            },
            monitor: MonitorConfig {
                interval: Duration::from_secs(parse_or("QUEUE_CLEANUP_INTERVAL", 30)?),
                alert_webhook_url: optional("WEBHOOK_URL"),
                ..Default::default()
            },
            delivery: DeliveryConfig {
                mode,
                allow_plain: parse_or("SMTP_ALLOW_PLAIN_DELIVERY", false)?,
                ..Default::default()
            },
            pool: PoolConfig::default(),
            broker,
            database_url: optional("DATABASE_URL"),
            mail_from_name: optional("MAIL_FROM_NAME").unwrap_or_else(|| "Mail Delivery".to_string()),
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn scope_limit(scope: &str, window_secs: u64, max: u64) -> Result<ScopeLimit, ConfigError> {
    Ok(ScopeLimit::new(
        Duration::from_secs(parse_or(
            &format!("RATE_LIMIT_{scope}_WINDOW_SECS"),
            window_secs,
        )?),
        parse_or(&format!("RATE_LIMIT_{scope}_MAX"), max)?,
    ))
}
