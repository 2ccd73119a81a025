use crate::models::{Domain, DomainRepository, Error, User};
use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Rewrite the From to the tenant fallback address and keep going.
    Rewrite,
    /// Reject the submission outright.
    Reject,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Locally hosted system domains, always permitted as senders.
    pub local_domains: Vec<String>,
    pub primary_domain: String,
    pub policy: FallbackPolicy,
}

#[derive(Debug)]
pub struct SenderCheck {
    pub ok: bool,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    /// The domain row to select DKIM keys from, when the sender may use it.
    pub domain: Option<Domain>,
    /// Synthesized replacement From when the sender domain was not usable.
    pub fallback: Option<EmailAddress>,
}

/// Verifies on each authenticated submission that the declared sender
/// domain is owned and verified by the authenticated user's tenant.
#[derive(Clone)]
pub struct DomainValidator {
    domains: DomainRepository,
    config: ValidatorConfig,
}

impl DomainValidator {
    pub fn new(domains: DomainRepository, config: ValidatorConfig) -> Self {
        Self { domains, config }
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.config.policy
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.config
            .local_domains
            .iter()
            .any(|local| local.eq_ignore_ascii_case(&domain))
    }

    pub async fn check(&self, user: &User, from: &EmailAddress) -> Result<SenderCheck, Error> {
        let sender_domain = from.domain().to_ascii_lowercase();

        if self.is_local_domain(&sender_domain) {
            let domain = self
                .domains
                .find_by_name(&sender_domain)
                .await?;
            return Ok(SenderCheck {
                ok: true,
                verified: true,
                verified_at: domain.as_ref().and_then(|d| d.verified_at),
                domain,
                fallback: None,
            });
        }

        match self.domains.find_owned(user.tenant_id(), &sender_domain).await? {
            Some(domain) if domain.verified => Ok(SenderCheck {
                ok: true,
                verified: true,
                verified_at: domain.verified_at,
                domain: Some(domain),
                fallback: None,
            }),
            claimed => {
                let fallback = self.fallback_address(user)?;
                warn!(
                    user_id = %user.id(),
                    sender_domain,
                    claimed = claimed.is_some(),
                    fallback = %fallback,
                    "sender domain not usable, falling back"
                );
                Ok(SenderCheck {
                    ok: false,
                    verified: false,
                    verified_at: None,
                    domain: None,
                    fallback: Some(fallback),
                })
            }
        }
    }

    fn fallback_address(&self, user: &User) -> Result<EmailAddress, Error> {
        format!("noreply+user{}@{}", user.id(), self.config.primary_domain)
            .parse::<EmailAddress>()
            .map_err(Error::Email)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{Store, TenantId};
    use uuid::Uuid;

    fn config() -> ValidatorConfig {
        ValidatorConfig {
            local_domains: vec!["mail.example".into()],
            primary_domain: "mail.example".into(),
            policy: FallbackPolicy::Rewrite,
        }
    }

    async fn setup() -> (DomainValidator, DomainRepository, User) {
        let store = Store::memory();
        let domains = DomainRepository::new(store.clone());
        let tenant = TenantId::from(Uuid::new_v4());
        let user = User::new(tenant, "alice@verified.tld".into(), "pw");
        (
            DomainValidator::new(domains.clone(), config()),
            domains,
            user,
        )
    }

    #[tokio::test]
    async fn verified_owned_domain_passes() {
        let (validator, domains, user) = setup().await;
        domains
            .create(
                &Domain::new(user.tenant_id(), user.id(), "verified.tld".into())
                    .verified("dns-txt"),
            )
            .await
            .unwrap();

        let check = validator
            .check(&user, &"alice@verified.tld".parse().unwrap())
            .await
            .unwrap();
        assert!(check.ok && check.verified);
        assert_eq!(check.domain.unwrap().name, "verified.tld");
        assert!(check.fallback.is_none());
    }

    #[tokio::test]
    async fn unverified_domain_falls_back() {
        let (validator, domains, user) = setup().await;
        domains
            .create(&Domain::new(
                user.tenant_id(),
                user.id(),
                "unverified.tld".into(),
            ))
            .await
            .unwrap();

        let check = validator
            .check(&user, &"alice@unverified.tld".parse().unwrap())
            .await
            .unwrap();
        assert!(!check.ok);
        let fallback = check.fallback.unwrap();
        assert_eq!(fallback.domain(), "mail.example");
        assert!(fallback.local_part().starts_with("noreply+user"));
    }

    #[tokio::test]
    async fn foreign_tenant_domain_falls_back() {
        let (validator, domains, user) = setup().await;
        let other_tenant = TenantId::from(Uuid::new_v4());
        let other_user = User::new(other_tenant, "eve@other.tld".into(), "pw");
        domains
            .create(
                &Domain::new(other_tenant, other_user.id(), "coveted.tld".into())
                    .verified("dns-txt"),
            )
            .await
            .unwrap();

        let check = validator
            .check(&user, &"alice@coveted.tld".parse().unwrap())
            .await
            .unwrap();
        assert!(!check.ok);
        assert!(check.domain.is_none());
    }

    #[tokio::test]
    async fn local_system_domains_are_always_permitted() {
        let (validator, _, user) = setup().await;
        let check = validator
            .check(&user, &"postmaster@mail.example".parse().unwrap())
            .await
            .unwrap();
        assert!(check.ok && check.verified);
    }
}
