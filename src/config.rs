use std::time::Duration;

use config::{Config as ConfigLib, ConfigError, Environment};
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_vec_from_string_or_vec;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub nginx: NginxConfig,
    pub certs: CertsConfig,
    pub acme: AcmeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NginxConfig {
    /// Directory holding the generated virtual-host documents
    pub sites_available: String,
    /// Directory holding the activation links read by nginx
    pub sites_enabled: String,
    /// Program and arguments used to ask nginx to reload its configuration
    #[serde(deserialize_with = "deserialize_vec_from_string_or_vec")]
    pub reload_command: Vec<String>,
    /// Upper bound for the reload command, in seconds
    pub reload_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertsConfig {
    pub root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeConfig {
    pub directory_url: String,
    pub challenge_host: String,
    pub challenge_port: u16,
    /// Upper bound for the whole ACME exchange, in seconds
    pub timeout: u64,
    /// Extra trust anchor for the ACME directory, e.g. a staging CA
    #[serde(default)]
    pub root_cert_path: Option<String>,
}

impl NginxConfig {
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout)
    }
}

impl AcmeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        // Build the config
        let config = ConfigLib::builder()
            // Set default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8000)?
            .set_default("nginx.sites_available", "/etc/nginx/sites-available")?
            .set_default("nginx.sites_enabled", "/etc/nginx/sites-enabled")?
            .set_default("nginx.reload_command", vec!["systemctl", "reload", "nginx"])?
            .set_default("nginx.reload_timeout", 30)?
            .set_default("certs.root", "/srv/server_certs")?
            .set_default(
                "acme.directory_url",
                "https://acme-v02.api.letsencrypt.org/directory",
            )?
            .set_default("acme.challenge_host", "0.0.0.0")?
            .set_default("acme.challenge_port", 81)?
            .set_default("acme.timeout", 180)?
            // Override config values via environment variables
            // The environment variables should be prefixed with 'APP_' and use '__' as a separator
            // Example: APP_ACME__CHALLENGE_PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        config.try_deserialize()
    }
}
