pub mod acme;
pub mod challenge;
pub mod errors;
pub mod http_client;
pub mod storage;


use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::{timeout_at, Instant};
use tracing::{info, instrument, warn};
use x509_parser::pem::parse_x509_pem;

use crate::cert_manager::{
    acme::AcmeDirectory,
    challenge::ChallengeHandler,
    errors::CertError,
    storage::{FileStorage, Storage},
};

const DEFAULT_ACME_TIMEOUT: Duration = Duration::from_secs(180);

/// Certificate chain and private key of one domain, both PEM encoded
#[derive(Debug, Clone)]
pub struct CertificateMaterial {
    pub certificate: String,
    pub private_key: SecretString,
}

/// Location of the persisted certificate material of one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

/// Struct representing the certificate manager
///
/// Obtains certificates through ACME or accepts caller-supplied ones and
/// persists them at `<root>/<domain>/cert.pem` and `<root>/<domain>/key.pem`.
#[derive(Clone)]
pub struct CertManager {
    // Certificate storage
    cert_storage: FileStorage,
    // ACME certificate authority
    acme: Arc<dyn AcmeDirectory>,
    // HTTP-01 challenge responder
    challenge_handler: Arc<dyn ChallengeHandler>,
    // Upper bound for one ACME exchange
    acme_timeout: Duration,
}

impl CertManager {
    /// Create a new instance of [CertManager] with required parameters
    pub fn new(
        cert_storage: FileStorage,
        acme: impl AcmeDirectory + 'static,
        challenge_handler: impl ChallengeHandler + 'static,
    ) -> Self {
        Self {
            cert_storage,
            acme: Arc::new(acme),
            challenge_handler: Arc::new(challenge_handler),
            acme_timeout: DEFAULT_ACME_TIMEOUT,
        }
    }

    /// Set the upper bound for one ACME exchange
    pub fn with_acme_timeout(mut self, timeout: Duration) -> Self {
        self.acme_timeout = timeout;
        self
    }

    /// Where the certificate material of the domain lives
    pub fn cert_paths(&self, domain: &str) -> Result<CertPaths, CertError> {
        Ok(CertPaths {
            certificate: self.cert_storage.path_for(&cert_key(domain))?,
            private_key: self.cert_storage.path_for(&key_key(domain))?,
        })
    }

    /// Persist a certificate and key supplied by the caller
    #[instrument(name = "Installing Supplied Certificate", skip(self, material))]
    pub async fn install_certificate(
        &self,
        domain: &str,
        material: &CertificateMaterial,
    ) -> Result<CertPaths, CertError> {
        self.persist(domain, material).await
    }

    /// Request a certificate from the certificate authority and persist it
    #[instrument(
        name = "Requesting Certificate",
        skip(self),
        fields(timeout_secs = self.acme_timeout.as_secs())
    )]
    pub async fn request_certificate(
        &self,
        domain: &str,
        email: &str,
    ) -> Result<CertPaths, CertError> {
        let material = self.obtain(domain, email).await?;
        let paths = self.persist(domain, &material).await?;
        info!("Certificate issued and stored successfully.");
        Ok(paths)
    }

    // Drive the ACME exchange: key, account, challenge responder, order
    async fn obtain(&self, domain: &str, email: &str) -> Result<CertificateMaterial, CertError> {
        let deadline = Instant::now() + self.acme_timeout;
        let timed_out = || CertError::TimedOut {
            domain: domain.to_string(),
            timeout: self.acme_timeout,
        };

        let key = KeyPair::generate().map_err(CertError::KeyGeneration)?;
        info!("Certificate key pair generated");

        let account = timeout_at(deadline, self.acme.register(email))
            .await
            .map_err(|_| timed_out())?
            .map_err(CertError::Registration)?;
        info!("ACME account registered");

        let cleanup = self.challenge_handler.bind().await.map_err(|source| {
            CertError::ChallengeBinding {
                port: self.challenge_handler.port(),
                source,
            }
        })?;
        info!(port = self.challenge_handler.port(), "HTTP-01 challenge responder bound");

        let ordered = timeout_at(
            deadline,
            account.order_certificate(domain, &key, self.challenge_handler.as_ref()),
        )
        .await;

        if let Err(e) = cleanup.run().await {
            warn!("Failed to release the HTTP-01 challenge responder: {e}");
        }

        let certificate = ordered
            .map_err(|_| timed_out())?
            .map_err(|source| CertError::Issuance {
                domain: domain.to_string(),
                source,
            })?;
        info!("Certificate obtained");

        Ok(CertificateMaterial {
            certificate,
            private_key: SecretString::from(key.serialize_pem()),
        })
    }

    async fn persist(
        &self,
        domain: &str,
        material: &CertificateMaterial,
    ) -> Result<CertPaths, CertError> {
        let paths = self.cert_paths(domain)?;

        // Material is keyed by domain only, proxies on other ports share it
        if self.cert_storage.load(&cert_key(domain)).await?.is_some() {
            warn!("Replacing existing certificate material for {domain}");
            self.cert_storage
                .update(&cert_key(domain), &material.certificate)
                .await?;
        } else {
            self.cert_storage
                .store(&cert_key(domain), &material.certificate)
                .await?;
        }
        self.cert_storage
            .store_private(&key_key(domain), material.private_key.expose_secret())
            .await?;

        log_validity(domain, &material.certificate);
        Ok(paths)
    }
}

// Log the validity window of the leaf certificate, if it can be parsed
fn log_validity(domain: &str, cert_pem: &str) {
    let parsed = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| e.to_string())
        .and_then(|(_, pem)| {
            let x509 = pem.parse_x509().map_err(|e| e.to_string())?;
            Ok((
                x509.validity().not_before.timestamp(),
                x509.validity().not_after.timestamp(),
            ))
        });

    match parsed {
        Ok((not_before, not_after)) => {
            let format = |ts: i64| {
                DateTime::<Utc>::from_timestamp(ts, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| ts.to_string())
            };
            info!(
                "Certificate for {domain} valid from {} to {}",
                format(not_before),
                format(not_after)
            );
        }
        Err(e) => warn!("Stored certificate for {domain} could not be parsed: {e}"),
    }
}

#[inline]
fn cert_key(domain: &str) -> String {
    format!("{domain}/cert.pem")
}

#[inline]
fn key_key(domain: &str) -> String {
    format!("{domain}/key.pem")
}
