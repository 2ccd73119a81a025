use crate::broker::{Broker, BrokerError, now_unix};
use std::time::Duration;
use tracing::debug;

const BUCKET_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Connections per remote IP.
    Connection,
    /// AUTH attempts per (remote IP, username).
    Auth,
    /// Sends per user.
    SendUser,
    /// Sends per tenant.
    SendTenant,
    /// Sends per destination domain.
    SendDestination,
}

impl Scope {
    fn tag(self) -> &'static str {
        match self {
            Scope::Connection => "connection",
            Scope::Auth => "auth",
            Scope::SendUser => "send-user",
            Scope::SendTenant => "send-tenant",
            Scope::SendDestination => "send-destination",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScopeLimit {
    pub window: Duration,
    pub max: u64,
}

impl ScopeLimit {
    pub fn new(window: Duration, max: u64) -> Self {
        Self { window, max }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub connection: ScopeLimit,
    pub auth: ScopeLimit,
    pub send_user: ScopeLimit,
    pub send_tenant: ScopeLimit,
    pub send_destination: ScopeLimit,
    /// Base lockout applied once the auth window overflows; doubles per
    /// further failure.
    pub auth_lockout_base: Duration,
    pub auth_lockout_cap: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connection: ScopeLimit::new(Duration::from_secs(60), 30),
            auth: ScopeLimit::new(Duration::from_secs(15 * 60), 10),
            send_user: ScopeLimit::new(Duration::from_secs(60 * 60), 1_000),
            send_tenant: ScopeLimit::new(Duration::from_secs(60 * 60), 10_000),
            send_destination: ScopeLimit::new(Duration::from_secs(60), 100),
            auth_lockout_base: Duration::from_secs(60),
            auth_lockout_cap: Duration::from_secs(60 * 60),
        }
    }
}

impl RateLimitConfig {
    fn limit(&self, scope: Scope) -> ScopeLimit {
        match scope {
            Scope::Connection => self.connection,
            Scope::Auth => self.auth,
            Scope::SendUser => self.send_user,
            Scope::SendTenant => self.send_tenant,
            Scope::SendDestination => self.send_destination,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Deferred { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Sliding-window rate caps. Counters live in the broker so multiple nodes
/// share them; in single-node mode they are in-process.
#[derive(Clone)]
pub struct RateLimiter {
    broker: Broker,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(broker: Broker, config: RateLimitConfig) -> Self {
        Self { broker, config }
    }

    /// Counts the event and decides. Events over the cap still count, so a
    /// client hammering the auth endpoint keeps extending its lockout.
    pub async fn check(&self, scope: Scope, subject: &str) -> Result<Decision, BrokerError> {
        let limit = self.config.limit(scope);
        let buckets = (limit.window.as_secs() / BUCKET_SECS).max(1);
        let now = now_unix();
        let current = now / BUCKET_SECS;

        // the oldest bucket has to outlive the window it slides out of
        let ttl = limit.window + Duration::from_secs(BUCKET_SECS);
        self.broker
            .incr_window(&bucket_key(scope, subject, current), ttl)
            .await?;

        let keys: Vec<String> = (0..buckets)
            .map(|i| bucket_key(scope, subject, current - i))
            .collect();
        let counts = self.broker.window_counts(&keys).await?;
        let total: u64 = counts.iter().sum();

        if total <= limit.max {
            return Ok(Decision::Allowed);
        }

        // hint from the oldest counted bucket: when does it slide out?
        let oldest = (0..buckets)
            .rev()
            .find(|i| counts[*i as usize] > 0)
            .map(|i| current - i)
            .unwrap_or(current);
        let slide_out = (oldest + buckets) * BUCKET_SECS;
        let mut retry_after = Duration::from_secs(slide_out.saturating_sub(now).max(1));

        if scope == Scope::Auth {
            let excess = (total - limit.max).min(16) as u32;
            let lockout = self
                .config
                .auth_lockout_base
                .saturating_mul(2u32.saturating_pow(excess.saturating_sub(1)))
                .min(self.config.auth_lockout_cap);
            retry_after = retry_after.max(lockout);
        }

        debug!(scope = scope.tag(), subject, total, "rate limit exceeded");
        Ok(Decision::Deferred { retry_after })
    }
}

fn bucket_key(scope: Scope, subject: &str, bucket: u64) -> String {
    format!("rl:{}:{}:{bucket}", scope.tag(), subject)
}
