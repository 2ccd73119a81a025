use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 4xx, socket error, timeout.
    Transient,
    /// 5xx from the remote.
    HardBounce,
}

#[derive(Debug, Clone)]
pub struct ReputationConfig {
    pub soft_threshold: u32,
    pub hard_threshold: u32,
    pub soft_block: Duration,
    pub hard_block: Duration,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            soft_threshold: 3,
            hard_threshold: 10,
            soft_block: Duration::minutes(5),
            hard_block: Duration::hours(1),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Record {
    successes: u64,
    failures: u64,
    consecutive_failures: u32,
    last_outcome_at: Option<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

/// Short-term quality signal per remote MX host and destination domain.
/// Blocks are always time-bounded; the sweep clears expired ones.
#[derive(Clone)]
pub struct ReputationManager {
    records: Arc<DashMap<String, Record>>,
    config: ReputationConfig,
}

impl ReputationManager {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut record = self.records.entry(key.to_string()).or_default();
        record.successes += 1;
        record.consecutive_failures = 0;
        record.blocked_until = None;
        record.last_outcome_at = Some(Utc::now());
    }

    pub fn record_failure(&self, key: &str, kind: FailureKind) {
        let mut record = self.records.entry(key.to_string()).or_default();
        record.failures += 1;
        record.consecutive_failures += 1;
        record.last_outcome_at = Some(Utc::now());

        let block = if record.consecutive_failures >= self.config.hard_threshold
            || (record.consecutive_failures >= self.config.soft_threshold
                && kind == FailureKind::HardBounce)
        {
            Some(self.config.hard_block)
        } else if record.consecutive_failures >= self.config.soft_threshold {
            Some(self.config.soft_block)
        } else {
            None
        };

        if let Some(block) = block {
            let until = Utc::now() + block;
            // never shorten an existing block
            if record.blocked_until.is_none_or(|existing| existing < until) {
                info!(key, until = %until, "temporarily blocking destination");
                record.blocked_until = Some(until);
            }
        }
    }

    pub fn delivery_allowed(&self, key: &str) -> bool {
        match self.records.get(key) {
            Some(record) => record.blocked_until.is_none_or(|until| until <= Utc::now()),
            None => true,
        }
    }

    /// Clears expired blocks. Run periodically so the map does not pin
    /// stale entries forever.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut cleared = 0usize;
        for mut entry in self.records.iter_mut() {
            if entry.blocked_until.is_some_and(|until| until <= now) {
                entry.blocked_until = None;
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!(cleared, "reputation sweep cleared expired blocks");
        }
    }

    pub fn mx_key(host: &str) -> String {
        format!("mx:{}", host.trim_end_matches('.').to_ascii_lowercase())
    }

    pub fn domain_key(domain: &str) -> String {
        format!("domain:{}", domain.trim_end_matches('.').to_ascii_lowercase())
    }
}
