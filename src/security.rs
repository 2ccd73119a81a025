use crate::{
    models::{Error, EventRepository, EventSeverity, SecurityEvent},
    reputation::{FailureKind, ReputationManager},
};
use mail_parser::{HeaderName, MessageParser};
use regex::RegexSet;
use std::net::IpAddr;
use tracing::debug;

/// Default phrase rules; the deployment overrides them via configuration
/// (`SPAM_PHRASES`).
const DEFAULT_SPAM_PHRASES: &[&str] = &[
    r"(?i)viagra",
    r"(?i)free\s+money",
    r"(?i)act\s+now",
    r"(?i)you\s+(are\s+a|have\s+been\s+selected\s+as\s+a)\s+winner",
    r"(?i)100%\s+free",
    r"(?i)no\s+obligation",
    r"(?i)wire\s+transfer\s+urgent",
    r"(?i)claim\s+your\s+prize",
];

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// IPs that are never allowed to connect.
    pub deny_list: Vec<IpAddr>,
    pub spam_threshold: f32,
    pub spam_phrases: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            deny_list: Vec::new(),
            spam_threshold: 5.0,
            spam_phrases: DEFAULT_SPAM_PHRASES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ConnectionPolicy {
    Allow,
    /// 421/550 depending on the phase; the reason lands in the audit table.
    Deny(&'static str),
}

#[derive(Debug, Default)]
pub struct MessageCheck {
    pub secure: bool,
    pub issues: Vec<String>,
}

#[derive(Debug)]
pub struct SpamAnalysis {
    pub score: f32,
    pub matched_rules: Vec<String>,
}

impl SpamAnalysis {
    pub fn is_spam(&self, threshold: f32) -> bool {
        self.score >= threshold
    }
}

/// Uniform policy evaluation of connections and messages.
#[derive(Clone)]
pub struct SecurityManager {
    config: SecurityConfig,
    phrases: RegexSet,
    reputation: ReputationManager,
    events: EventRepository,
}

impl SecurityManager {
    pub fn new(
        config: SecurityConfig,
        reputation: ReputationManager,
        events: EventRepository,
    ) -> Self {
        let phrases = RegexSet::new(&config.spam_phrases)
            .unwrap_or_else(|_| RegexSet::new(DEFAULT_SPAM_PHRASES).unwrap());
        Self {
            config,
            phrases,
            reputation,
            events,
        }
    }

    pub fn spam_threshold(&self) -> f32 {
        self.config.spam_threshold
    }

    /// Accept-time screening: deny list first, then the tarpit for IPs that
    /// keep getting rejected.
    pub async fn validate_connection(&self, ip: IpAddr) -> Result<ConnectionPolicy, Error> {
        if self.config.deny_list.contains(&ip) {
            self.events
                .record_security_event(
                    SecurityEvent::new("connection from denied address", ip.to_string(), EventSeverity::Warning)
                        .with_ip(ip.to_string()),
                )
                .await?;
            return Ok(ConnectionPolicy::Deny("address denied by policy"));
        }

        if !self.reputation.delivery_allowed(&ip_key(ip)) {
            debug!(ip = %ip, "tarpitting repeat abuser");
            return Ok(ConnectionPolicy::Deny("temporarily refused"));
        }

        Ok(ConnectionPolicy::Allow)
    }

    /// Counts a policy rejection against the remote, so repeat abusers end
    /// up tarpitted at accept time.
    pub async fn record_rejection(&self, ip: IpAddr, reason: &str) -> Result<(), Error> {
        self.reputation
            .record_failure(&ip_key(ip), FailureKind::Transient);
        self.events
            .record_security_event(
                SecurityEvent::new(reason, ip.to_string(), EventSeverity::Warning)
                    .with_ip(ip.to_string()),
            )
            .await
    }

    /// Structural checks on an accepted message body.
    pub fn check_message(&self, raw: &[u8]) -> MessageCheck {
        let mut issues = Vec::new();

        // bare LF inside the header block is a classic injection vector
        let header_end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap_or(raw.len());
        let mut previous = 0u8;
        for &byte in &raw[..header_end] {
            if byte == b'\n' && previous != b'\r' {
                issues.push("bare LF in header block".to_string());
                break;
            }
            previous = byte;
        }

        if MessageParser::default().parse(raw).is_none() {
            issues.push("message does not parse as MIME".to_string());
        }

        MessageCheck {
            secure: issues.is_empty(),
            issues,
        }
    }

    /// Bounded heuristic spam score. Rules are additive; the score is
    /// clamped so one pathological input cannot overflow the scale.
    pub fn analyse_spam(&self, raw: &[u8]) -> SpamAnalysis {
        let mut score = 0.0f32;
        let mut matched_rules = Vec::new();

        let parsed = MessageParser::default().parse(raw);
        let text: String = match &parsed {
            Some(message) => message
                .body_text(0)
                .map(|t| t.to_string())
                .unwrap_or_else(|| String::from_utf8_lossy(raw).into_owned()),
            None => String::from_utf8_lossy(raw).into_owned(),
        };

        let phrase_hits = self.phrases.matches(&text).into_iter().count();
        if phrase_hits > 0 {
            score += 2.0 * phrase_hits as f32;
            matched_rules.push(format!("suspect-phrases:{phrase_hits}"));
        }

        let link_count = text.matches("http://").count() + text.matches("https://").count();
        let words = text.split_whitespace().count().max(1);
        if link_count > 0 && link_count as f32 / words as f32 > 0.2 {
            score += 2.0;
            matched_rules.push("link-heavy".to_string());
        }

        let letters: Vec<char> = text.chars().filter(|c| c.is_ascii_alphabetic()).collect();
        if letters.len() >= 20 {
            let upper = letters.iter().filter(|c| c.is_ascii_uppercase()).count();
            if upper as f32 / letters.len() as f32 > 0.5 {
                score += 1.5;
                matched_rules.push("shouting".to_string());
            }
        }

        if let Some(message) = &parsed {
            let has_header = |name: HeaderName| {
                message
                    .parts
                    .first()
                    .is_some_and(|part| part.headers.iter().any(|h| h.name == name))
            };
            for (header, rule) in [
                (HeaderName::From, "missing-from"),
                (HeaderName::Date, "missing-date"),
                (HeaderName::Subject, "missing-subject"),
            ] {
                if !has_header(header) {
                    score += 1.0;
                    matched_rules.push(rule.to_string());
                }
            }
        }

        SpamAnalysis {
            score: score.min(10.0),
            matched_rules,
        }
    }
}

fn ip_key(ip: IpAddr) -> String {
    format!("ip:{ip}")
}
