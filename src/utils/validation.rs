use std::{collections::HashSet, io, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::net::lookup_host;
use tracing::{debug, instrument, warn};

use crate::{
    models::{ProxyRequest, SiteKey, TlsSource, ValidatedProxy},
    utils::errors::ProxyError,
};

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Forward DNS resolution
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolve the host to its A/AAAA addresses
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = lookup_host((host, 0)).await?;
        let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        ips.dedup();
        Ok(ips)
    }
}

/// Checks that a domain points at the allocation it should be proxied to
#[derive(Clone)]
pub struct DomainValidator {
    resolver: Arc<dyn DnsResolver>,
}

impl DomainValidator {
    pub fn new(resolver: impl DnsResolver + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Succeeds when at least one address of the domain is also an address of
    /// the allocation. Lookups are attempted once.
    #[instrument(name = "Validating Domain Ownership", skip(self))]
    pub async fn validate(&self, domain: &str, allocation: &str) -> Result<(), ProxyError> {
        ensure_lowercase(domain)?;

        let allocation_ips = match allocation.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self
                .resolve(allocation)
                .await
                .map_err(|reason| {
                    warn!("Allocation host {allocation} could not be resolved: {reason}");
                    ProxyError::ValidationFailed(format!(
                        "Failed to resolve the allocation host '{allocation}': {reason}."
                    ))
                })?,
        };

        let domain_ips = self.resolve(domain).await.map_err(|reason| {
            warn!("Domain {domain} could not be resolved: {reason}");
            ProxyError::ValidationFailed(format!(
                "Failed to resolve the domain '{domain}': {reason}."
            ))
        })?;

        let allocation_set: HashSet<&IpAddr> = allocation_ips.iter().collect();
        if domain_ips.iter().any(|ip| allocation_set.contains(ip)) {
            debug!("Domain {domain} points at allocation {allocation}");
            return Ok(());
        }

        warn!(
            ?domain_ips,
            ?allocation_ips,
            "Domain {domain} does not point at allocation {allocation}"
        );
        Err(ProxyError::ValidationFailed(format!(
            "The domain {domain} resolves to {} which contains none of the addresses {} of the allocation host {allocation}. Check your DNS records.",
            format_ips(&domain_ips),
            format_ips(&allocation_ips),
        )))
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, String> {
        match self.resolver.lookup(host).await {
            Ok(ips) if ips.is_empty() => Err("no addresses found".to_string()),
            Ok(ips) => Ok(ips),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn format_ips(ips: &[IpAddr]) -> String {
    let list = ips
        .iter()
        .map(IpAddr::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{list}]")
}

fn ensure_lowercase(domain: &str) -> Result<(), ProxyError> {
    if domain != domain.to_lowercase() {
        return Err(ProxyError::InvalidInput(
            "The domain must be lowercase.".to_string(),
        ));
    }
    Ok(())
}

/// Check that the domain is a lowercase hostname.
///
/// The domain becomes part of file names, so anything outside
/// `[a-z0-9.-]` is refused.
pub fn validate_domain(domain: &str) -> Result<(), ProxyError> {
    ensure_lowercase(domain)?;
    if !is_hostname(domain) {
        return Err(ProxyError::InvalidInput(format!(
            "'{domain}' is not a valid domain name."
        )));
    }
    Ok(())
}

fn is_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= MAX_DOMAIN_LEN
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= MAX_LABEL_LEN
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

/// Parse the backend port of a proxy
pub fn parse_port(port: &str) -> Result<u16, ProxyError> {
    match port.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ProxyError::InvalidInput(format!(
            "'{port}' is not a valid port."
        ))),
    }
}

/// Check that the pair names a virtual host this service could have created
pub fn site_key(domain: &str, port: &str) -> Result<SiteKey, ProxyError> {
    validate_domain(domain)?;
    Ok(SiteKey::new(domain, parse_port(port)?))
}

fn validate_allocation(allocation: &str) -> Result<(), ProxyError> {
    if allocation.parse::<IpAddr>().is_ok() || is_hostname(&allocation.to_ascii_lowercase()) {
        return Ok(());
    }
    Err(ProxyError::InvalidInput(format!(
        "'{allocation}' is not a valid IP address or hostname."
    )))
}

impl TryFrom<ProxyRequest> for ValidatedProxy {
    type Error = ProxyError;

    fn try_from(request: ProxyRequest) -> Result<Self, Self::Error> {
        let site = site_key(&request.domain, &request.port)?;
        validate_allocation(&request.ip)?;

        let tls = match (request.ssl, request.use_lets_encrypt) {
            (false, _) => TlsSource::Disabled,
            (true, true) => {
                let email = request.client_email.trim();
                if !email.contains('@') || email.chars().any(char::is_whitespace) {
                    return Err(ProxyError::InvalidInput(
                        "A valid client email is required to request a certificate.".to_string(),
                    ));
                }
                TlsSource::Acme {
                    email: email.to_string(),
                }
            }
            (true, false) => {
                if request.ssl_cert.trim().is_empty()
                    || request.ssl_key.expose_secret().trim().is_empty()
                {
                    return Err(ProxyError::InvalidInput(
                        "Both ssl_cert and ssl_key are required when not using Let's Encrypt."
                            .to_string(),
                    ));
                }
                TlsSource::Supplied {
                    certificate: request.ssl_cert,
                    private_key: request.ssl_key,
                }
            }
        };

        Ok(ValidatedProxy {
            site,
            allocation: request.ip,
            tls,
        })
    }
}
