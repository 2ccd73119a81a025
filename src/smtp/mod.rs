use std::{net::SocketAddr, path::PathBuf, time::Duration};

pub mod connection;
pub mod server;
pub mod session;

/// The two listener personalities: server-to-server mail on the MX port,
/// authenticated client mail on the submission port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Mx,
    Submission,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenerKind::Mx => "mx",
            ListenerKind::Submission => "submission",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Public identity used in the banner and EHLO.
    pub hostname: String,
    pub mx_addr: SocketAddr,
    pub submission_addr: SocketAddr,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Advertised SIZE cap in bytes.
    pub max_message_size: usize,
    /// Idle time between commands before the session is dropped with 421.
    pub idle_timeout: Duration,
    /// Submission normally requires STARTTLS before AUTH; development
    /// setups without certificates may relax this.
    pub require_tls: bool,
    /// Recipients accepted per message.
    pub max_recipients: usize,
    /// Strict multi-tenant mode: per-tenant sending quotas are enforced in
    /// addition to per-user ones.
    pub enforce_tenant_limits: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            mx_addr: "0.0.0.0:2525".parse().unwrap(),
            submission_addr: "0.0.0.0:587".parse().unwrap(),
            cert_file: None,
            key_file: None,
            max_message_size: 20 * 1024 * 1024,
            idle_timeout: Duration::from_secs(60),
            require_tls: true,
            max_recipients: 100,
            enforce_tenant_limits: true,
        }
    }
}
