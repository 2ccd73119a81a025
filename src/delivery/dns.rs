#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{LookupIpStrategy::Ipv4Only, NameServerConfig, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::xfer::Protocol,
};
use rand::seq::SliceRandom;
use tracing::{debug, trace};

#[cfg(test)]
use crate::delivery::mock;

#[derive(Debug)]
pub enum ResolveError {
    /// Lookup failed; retryable.
    Dns(String),
    /// Neither MX nor address records exist; terminal for the recipient.
    NoMailServers,
}

/// One SMTP destination for a recipient domain, in try-order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxCandidate {
    pub hostname: String,
    pub port: u16,
    pub preference: u16,
}

#[derive(Clone)]
pub struct DnsResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    pub(crate) resolver: mock::Resolver,
}

impl DnsResolver {
    #[cfg(not(test))]
    pub fn new() -> Self {
        let mut resolver_options = ResolverOpts::default();
        resolver_options.ip_strategy = Ipv4Only;
        resolver_options.timeout = std::time::Duration::from_secs(10);
        resolver_options.attempts = 2;
        resolver_options.negative_max_ttl = Some(std::time::Duration::from_secs(20));

        // Malware blocking, DNSSEC validation (Quad9)
        let mut resolver_config = ResolverConfig::new();
        resolver_config.add_name_server(NameServerConfig {
            socket_addr: "9.9.9.9:853".parse().unwrap(),
            protocol: Protocol::Tls,
            tls_dns_name: Some("dns.quad9.net".to_string()),
            http_endpoint: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
        resolver_config.add_name_server(NameServerConfig {
            socket_addr: "149.112.112.112:853".parse().unwrap(),
            protocol: Protocol::Tls,
            tls_dns_name: Some("dns.quad9.net".to_string()),
            http_endpoint: None,
            trust_negative_responses: false,
            bind_addr: None,
        });

        Self {
            resolver: Resolver::builder_with_config(
                resolver_config,
                TokioConnectionProvider::default(),
            )
            .with_options(resolver_options)
            .build(),
        }
    }

    #[cfg(test)]
    pub fn mock(resolver: mock::Resolver) -> Self {
        Self { resolver }
    }

    /// Resolves the destination hosts for a recipient domain: MX records
    /// ascending by priority, shuffled within equal-priority tiers; when no
    /// MX exists, the bare domain itself if it has an address record
    /// (implicit MX, RFC 5321 §5.1).
    pub async fn resolve_candidates(&self, domain: &str) -> Result<Vec<MxCandidate>, ResolveError> {
        // fully qualified names are cheaper lookups
        let fqdn = format!("{domain}{}", if domain.ends_with('.') { "" } else { "." });

        let mut candidates = self.lookup_mx(&fqdn).await?;

        if candidates.is_empty() {
            trace!(domain, "no MX records, checking for an implicit MX");
            if self.has_address(&fqdn).await? {
                return Ok(vec![MxCandidate {
                    hostname: domain.trim_end_matches('.').to_string(),
                    port: 25,
                    preference: 0,
                }]);
            }
            return Err(ResolveError::NoMailServers);
        }

        candidates.sort_by_key(|c| c.preference);

        // load-share within a priority tier
        let mut start = 0;
        while start < candidates.len() {
            let preference = candidates[start].preference;
            let end = candidates[start..]
                .iter()
                .position(|c| c.preference != preference)
                .map(|offset| start + offset)
                .unwrap_or(candidates.len());
            candidates[start..end].shuffle(&mut rand::rng());
            start = end;
        }

        debug!(domain, candidates = candidates.len(), "resolved mail servers");
        Ok(candidates)
    }

    #[cfg(not(test))]
    async fn lookup_mx(&self, fqdn: &str) -> Result<Vec<MxCandidate>, ResolveError> {
        match self.resolver.mx_lookup(fqdn).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|mx| MxCandidate {
                    hostname: mx.exchange().to_utf8(),
                    port: 25,
                    preference: mx.preference(),
                })
                .collect()),
            Err(err) if err.is_no_records_found() => Ok(Vec::new()),
            Err(err) => Err(ResolveError::Dns(err.to_string())),
        }
    }

    #[cfg(not(test))]
    async fn has_address(&self, fqdn: &str) -> Result<bool, ResolveError> {
        match self.resolver.lookup_ip(fqdn).await {
            Ok(ips) => Ok(ips.iter().next().is_some()),
            Err(err) if err.is_no_records_found() => Ok(false),
            Err(err) => Err(ResolveError::Dns(err.to_string())),
        }
    }

    /// Fetches the single TXT record for a name that starts with the given
    /// marker. Multiple conflicting records are treated as absent.
    #[cfg(not(test))]
    pub async fn singular_txt(
        &self,
        record: &str,
        starting_with: &str,
    ) -> Result<String, &'static str> {
        trace!("requesting DNS record {record}");
        let Ok(lookup) = self.resolver.txt_lookup(record).await else {
            return Err("could not retrieve DNS record");
        };

        let mut matching = lookup.into_iter().filter(|r| {
            r.txt_data()
                .iter()
                .flatten()
                .take(starting_with.len())
                .eq(starting_with.as_bytes())
        });
        let Some(first) = matching.next() else {
            return Err("record unavailable");
        };
        if matching.next().is_some() {
            return Err("multiple conflicting DNS records available");
        }

        let data = first.txt_data().iter().flatten().copied().collect::<Vec<_>>();
        String::from_utf8(data).or(Err("could not decode record"))
    }

    #[cfg(test)]
    async fn lookup_mx(&self, _fqdn: &str) -> Result<Vec<MxCandidate>, ResolveError> {
        if self.resolver.fail {
            return Err(ResolveError::Dns("mocked DNS failure".to_string()));
        }
        Ok(self.resolver.mx.clone())
    }

    #[cfg(test)]
    async fn has_address(&self, _fqdn: &str) -> Result<bool, ResolveError> {
        Ok(self.resolver.implicit)
    }

    #[cfg(test)]
    pub async fn singular_txt(
        &self,
        _record: &str,
        starting_with: &str,
    ) -> Result<String, &'static str> {
        if self.resolver.txt.starts_with(starting_with) {
            Ok(self.resolver.txt.clone())
        } else {
            Err("record unavailable")
        }
    }

    /// Fetches the published DKIM record for (selector, domain).
    pub async fn dkim_txt(&self, selector: &str, domain: &str) -> Result<String, &'static str> {
        let domain = domain.trim_matches('.');
        let record = format!("{selector}._domainkey.{domain}.");
        self.singular_txt(&record, "v=DKIM1").await
    }
}

#[cfg(not(test))]
impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}
