use crate::models::{DkimKeyRecord, Domain, DomainRepository, Error};
use aws_lc_rs::{encoding::AsDer, rsa::KeySize, signature::KeyPair};
use base64ct::{Base64, Encoding};
use dashmap::DashMap;
use mail_auth::{
    common::{
        crypto::{Algorithm, RsaKey, Sha256, SigningKey},
        headers::HeaderWriter,
    },
    dkim::DkimSigner,
};
use std::sync::Arc;
use tracing::{info, trace};

/// Adapts a shared, cached `RsaKey` to `SigningKey` so the cached `Arc` can
/// be signed with without needing an owned (cloned) key.
struct ArcRsaKey(Arc<RsaKey<Sha256>>);

impl SigningKey for ArcRsaKey {
    type Hasher = Sha256;

    fn sign(&self, input: impl mail_auth::common::headers::Writable) -> mail_auth::Result<Vec<u8>> {
        self.0.sign(input)
    }

    fn algorithm(&self) -> Algorithm {
        self.0.algorithm()
    }
}

/// Headers covered by the signature. From is mandatory per RFC 6376; the
/// rest pins down everything a forwarder could meaningfully alter.
const SIGNED_HEADERS: [&str; 12] = [
    "From",
    "To",
    "Cc",
    "Subject",
    "Date",
    "Message-ID",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Reply-To",
    "In-Reply-To",
    "References",
];

#[derive(Debug, Clone)]
pub struct DkimSettings {
    pub primary_domain: String,
    pub selector: String,
    /// Adds `t=s` to rendered records during initial rollout.
    pub testing_mode: bool,
}

/// Per-domain DKIM key lifecycle and canonical signing of outbound mail.
#[derive(Clone)]
pub struct DkimManager {
    domains: DomainRepository,
    settings: DkimSettings,
    /// Parsed signing keys, read-only after load.
    cache: Arc<DashMap<String, Arc<RsaKey<Sha256>>>>,
}

impl DkimManager {
    pub fn new(domains: DomainRepository, settings: DkimSettings) -> Self {
        Self {
            domains,
            settings,
            cache: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &DkimSettings {
        &self.settings
    }

    /// Generates an RSA keypair for (domain, selector), persists it as the
    /// active key, and returns the TXT record to publish.
    pub async fn generate(&self, domain: &Domain, selector: &str) -> Result<String, Error> {
        let key_pair = aws_lc_rs::rsa::KeyPair::generate(KeySize::Rsa2048)?;
        let pkcs8_der = key_pair.as_der()?.as_ref().to_vec();

        let record = DkimKeyRecord::new(domain.id(), selector, 2048, pkcs8_der);
        self.domains.insert_key(&record).await?;
        self.cache.remove(&cache_key(domain, selector));

        info!(domain = domain.name, selector, "generated DKIM key");
        self.render_record(&record)
    }

    /// Imports an existing PKCS#8 key as the active key for (domain,
    /// selector); used to carry the primary-domain key in from disk.
    pub async fn import(
        &self,
        domain: &Domain,
        selector: &str,
        pkcs8_der: Vec<u8>,
    ) -> Result<String, Error> {
        // reject unparseable material before it is persisted
        aws_lc_rs::rsa::KeyPair::from_pkcs8(&pkcs8_der)?;

        let record = DkimKeyRecord::new(domain.id(), selector, 2048, pkcs8_der);
        self.domains.insert_key(&record).await?;
        self.cache.remove(&cache_key(domain, selector));
        self.render_record(&record)
    }

    /// Rotation: a new selector goes live, the old one is deactivated.
    pub async fn rotate(
        &self,
        domain: &Domain,
        old_selector: &str,
        new_selector: &str,
    ) -> Result<String, Error> {
        let txt = self.generate(domain, new_selector).await?;
        self.domains.deactivate_keys(domain.id(), old_selector).await?;
        self.cache.remove(&cache_key(domain, old_selector));
        info!(
            domain = domain.name,
            old_selector, new_selector, "rotated DKIM key"
        );
        Ok(txt)
    }

    /// Renders the current TXT record for publication at
    /// `<selector>._domainkey.<domain>`.
    pub async fn dns_record(&self, domain: &Domain, selector: &str) -> Result<String, Error> {
        let record = self
            .domains
            .active_key_by_selector(domain.id(), selector)
            .await?
            .ok_or(Error::NotFound("no active DKIM key for selector"))?;
        self.render_record(&record)
    }

    fn render_record(&self, record: &DkimKeyRecord) -> Result<String, Error> {
        let key_pair = aws_lc_rs::rsa::KeyPair::from_pkcs8(&record.pkcs8_der)?;
        let public = key_pair.public_key().as_der()?;
        let flags = if self.settings.testing_mode { "; t=s" } else { "" };
        Ok(format!(
            "v=DKIM1; k=rsa; p={}{flags}",
            Base64::encode_string(public.as_ref())
        ))
    }

    /// Signs a raw message with the domain's active key and returns the
    /// `DKIM-Signature` header to prepend. `None` when the domain has no
    /// active key; the caller decides whether to fall back to the primary.
    pub async fn sign(
        &self,
        domain: &Domain,
        raw_message: &[u8],
    ) -> Result<Option<String>, Error> {
        let Some(record) = self.domains.active_key(domain.id()).await? else {
            return Ok(None);
        };
        let key = self.signing_key(domain, &record)?;

        let signer = DkimSigner::from_key(ArcRsaKey(key))
            .domain(&domain.name)
            .selector(&record.selector)
            .headers(SIGNED_HEADERS);

        trace!(domain = domain.name, selector = record.selector, "signing message");
        let signature = signer.sign(raw_message)?;
        Ok(Some(signature.to_header()))
    }

    fn signing_key(
        &self,
        domain: &Domain,
        record: &DkimKeyRecord,
    ) -> Result<Arc<RsaKey<Sha256>>, Error> {
        let key = cache_key(domain, &record.selector);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }
        let parsed = Arc::new(RsaKey::<Sha256>::from_pkcs8_der(&record.pkcs8_der)?);
        self.cache.insert(key, parsed.clone());
        Ok(parsed)
    }
}

/// Parses a published DKIM TXT record back into its public key bytes.
/// Used by the round-trip checks and the optional inbound audit.
pub fn parse_dns_record(txt: &str) -> Result<Vec<u8>, &'static str> {
    let mut fields = txt.split(';').filter_map(|field| field.trim().split_once('='));

    if !fields
        .clone()
        .any(|(key, value)| key == "v" && value == "DKIM1")
    {
        return Err("not a DKIM1 record");
    }

    let public = fields
        .find(|(key, _)| *key == "p")
        .ok_or("record has no public key")?
        .1;
    Base64::decode_vec(public.trim()).map_err(|_| "could not decode public key")
}

/// Extracts a tag (e.g. `d` or `s`) from a DKIM-Signature header value.
pub fn signature_tag<'a>(header_value: &'a str, tag: &str) -> Option<&'a str> {
    header_value
        .split(';')
        .filter_map(|field| field.trim().split_once('='))
        .find(|(key, _)| *key == tag)
        .map(|(_, value)| value.trim())
}

/// Pulls the first DKIM-Signature header out of a raw message, unfolded.
pub fn extract_signature_header(raw: &[u8]) -> Option<String> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(raw.len());
    let text = std::str::from_utf8(&raw[..header_end]).ok()?;
    let unfolded = text.replace("\r\n\t", " ").replace("\r\n ", " ");
    unfolded
        .lines()
        .find_map(|line| line.strip_prefix("DKIM-Signature:"))
        .map(str::to_string)
}

fn cache_key(domain: &Domain, selector: &str) -> String {
    format!("{}:{selector}", domain.id())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::Store;
    use uuid::Uuid;

    fn settings() -> DkimSettings {
        DkimSettings {
            primary_domain: "mail.example".into(),
            selector: "mail".into(),
            testing_mode: false,
        }
    }

    fn test_domain(name: &str) -> Domain {
        Domain::new(Uuid::new_v4().into(), Uuid::new_v4().into(), name.into())
            .verified("dns-txt")
    }

    async fn manager_with_domain(name: &str) -> (DkimManager, Domain) {
        let domains = DomainRepository::new(Store::memory());
        let domain = test_domain(name);
        domains.create(&domain).await.unwrap();
        (DkimManager::new(domains, settings()), domain)
    }

    #[tokio::test]
    async fn dns_record_round_trips() {
        let (dkim, domain) = manager_with_domain("verified.tld").await;

        let rendered = dkim.generate(&domain, "mail").await.unwrap();
        assert!(rendered.starts_with("v=DKIM1; k=rsa; p="));

        let public = parse_dns_record(&rendered).unwrap();
        assert!(!public.is_empty());
        assert_eq!(
            rendered,
            dkim.dns_record(&domain, "mail").await.unwrap()
        );
    }

    #[tokio::test]
    async fn testing_flag_appears_until_promoted() {
        let domains = DomainRepository::new(Store::memory());
        let domain = test_domain("verified.tld");
        domains.create(&domain).await.unwrap();

        let dkim = DkimManager::new(
            domains,
            DkimSettings {
                testing_mode: true,
                ..settings()
            },
        );
        let rendered = dkim.generate(&domain, "mail").await.unwrap();
        assert!(rendered.ends_with("; t=s"));
        assert!(parse_dns_record(&rendered).is_ok());
    }

    #[tokio::test]
    async fn signature_carries_domain_and_selector() {
        let (dkim, domain) = manager_with_domain("verified.tld").await;
        dkim.generate(&domain, "mail").await.unwrap();

        let raw = b"From: alice@verified.tld\r\nTo: bob@example.org\r\nSubject: hi\r\nDate: Mon, 1 Jan 2024 10:00:00 +0000\r\nMessage-ID: <m1@verified.tld>\r\n\r\nhello\r\n";
        let header = dkim.sign(&domain, raw).await.unwrap().unwrap();

        assert!(header.starts_with("DKIM-Signature:"));
        let value = header.trim_start_matches("DKIM-Signature:");
        let value = value.replace("\r\n", "");
        assert_eq!(signature_tag(&value, "d"), Some("verified.tld"));
        assert_eq!(signature_tag(&value, "s"), Some("mail"));
        assert!(signature_tag(&value, "bh").is_some());
        assert!(signature_tag(&value, "b").is_some());
    }

    #[tokio::test]
    async fn rotation_deactivates_the_old_selector() {
        let (dkim, domain) = manager_with_domain("verified.tld").await;
        dkim.generate(&domain, "mail").await.unwrap();
        dkim.rotate(&domain, "mail", "mail2025").await.unwrap();

        assert!(dkim.dns_record(&domain, "mail").await.is_err());
        let raw = b"From: a@verified.tld\r\nSubject: x\r\n\r\nbody\r\n";
        let header = dkim.sign(&domain, raw).await.unwrap().unwrap();
        let value = header.trim_start_matches("DKIM-Signature:").replace("\r\n", "");
        assert_eq!(signature_tag(&value, "s"), Some("mail2025"));
    }

    #[test]
    fn signature_header_extraction_unfolds() {
        let raw = b"From: a@x.example\r\nDKIM-Signature: v=1; a=rsa-sha256;\r\n\td=x.example; s=mail;\r\n\tbh=abc; b=def\r\nSubject: hi\r\n\r\nbody";
        let header = extract_signature_header(raw).unwrap();
        assert_eq!(signature_tag(&header, "d"), Some("x.example"));
        assert_eq!(signature_tag(&header, "s"), Some("mail"));
        assert!(extract_signature_header(b"Subject: hi\r\n\r\nbody").is_none());
    }

    #[tokio::test]
    async fn domains_without_keys_sign_nothing() {
        let (dkim, domain) = manager_with_domain("unverified.tld").await;
        let raw = b"From: a@unverified.tld\r\n\r\nbody\r\n";
        assert!(dkim.sign(&domain, raw).await.unwrap().is_none());
    }
}
