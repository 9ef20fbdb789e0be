use std::fmt;

use secrecy::SecretString;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_string_from_number;

/// Body of the proxy creation endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRequest {
    pub domain: String,
    /// Allocation address, either an IP literal or a hostname
    pub ip: String,
    #[serde(deserialize_with = "deserialize_string_from_number")]
    pub port: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub use_lets_encrypt: bool,
    #[serde(default)]
    pub client_email: String,
    #[serde(default)]
    pub ssl_cert: String,
    #[serde(default = "empty_secret")]
    pub ssl_key: SecretString,
}

/// Body of the proxy removal endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteProxyRequest {
    pub domain: String,
    #[serde(deserialize_with = "deserialize_string_from_number")]
    pub port: String,
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

/// Identifies one virtual host: a domain served on behalf of one backend port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SiteKey {
    pub domain: String,
    pub port: u16,
}

impl SiteKey {
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            port,
        }
    }

    /// File name shared by the virtual-host document and its activation link
    pub fn file_name(&self) -> String {
        format!("{}_{}.conf", self.domain, self.port)
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.port)
    }
}

/// How the provisioned virtual host obtains its TLS material
#[derive(Debug, Clone)]
pub enum TlsSource {
    /// Serve plain HTTP only
    Disabled,
    /// Use the certificate and key supplied by the caller
    Supplied {
        certificate: String,
        private_key: SecretString,
    },
    /// Obtain a certificate through ACME, registering under the given email
    Acme { email: String },
}

/// A creation request whose fields have passed the syntactic checks
#[derive(Debug, Clone)]
pub struct ValidatedProxy {
    pub site: SiteKey,
    pub allocation: String,
    pub tls: TlsSource,
}
