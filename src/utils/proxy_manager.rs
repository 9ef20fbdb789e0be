use tracing::{info, instrument, warn};

use crate::{
    cert_manager::{CertManager, CertificateMaterial},
    models::{DeleteProxyRequest, ProxyRequest, TlsSource, ValidatedProxy},
    utils::{
        errors::ProxyError,
        site_config::{SiteConfigEmitter, SiteTemplate},
        validation::{site_key, DomainValidator},
    },
};

/// Creates and removes reverse-proxy virtual hosts.
///
/// Each call runs to completion on its own; callers must not create and
/// delete the same (domain, port) pair concurrently.
#[derive(Clone)]
pub struct ProxyManager {
    validator: DomainValidator,
    emitter: SiteConfigEmitter,
    cert_manager: CertManager,
}

impl ProxyManager {
    pub fn new(
        validator: DomainValidator,
        emitter: SiteConfigEmitter,
        cert_manager: CertManager,
    ) -> Self {
        Self {
            validator,
            emitter,
            cert_manager,
        }
    }

    /// Validate the domain, activate a plain HTTP virtual host and, when TLS
    /// is requested, install a certificate and switch to the secured variant.
    #[instrument(
        name = "Creating Proxy",
        skip(self, request),
        fields(domain = %request.domain, port = %request.port)
    )]
    pub async fn create(&self, request: ProxyRequest) -> Result<(), ProxyError> {
        let proxy = ValidatedProxy::try_from(request)?;
        let site = &proxy.site;

        self.validator
            .validate(&site.domain, &proxy.allocation)
            .await?;

        self.emitter
            .emit(site, &proxy.allocation, SiteTemplate::Plain)
            .await?;

        let paths = match proxy.tls {
            TlsSource::Disabled => {
                info!("Proxy {site} created");
                return Ok(());
            }
            TlsSource::Supplied {
                certificate,
                private_key,
            } => {
                let material = CertificateMaterial {
                    certificate,
                    private_key,
                };
                self.cert_manager
                    .install_certificate(&site.domain, &material)
                    .await
            }
            TlsSource::Acme { email } => {
                self.cert_manager
                    .request_certificate(&site.domain, &email)
                    .await
            }
        }
        .map_err(|e| {
            warn!("Certificate provisioning for {site} failed: {e}");
            ProxyError::from(e)
        })?;

        self.emitter
            .emit(site, &proxy.allocation, SiteTemplate::Secured(&paths))
            .await?;
        info!("Proxy {site} created with TLS");
        Ok(())
    }

    /// Remove the virtual host. Never fails, problems are only logged.
    #[instrument(
        name = "Deleting Proxy",
        skip(self, request),
        fields(domain = %request.domain, port = %request.port)
    )]
    pub async fn delete(&self, request: DeleteProxyRequest) {
        match site_key(&request.domain, &request.port) {
            Ok(site) => {
                self.emitter.remove(&site).await;
                info!("Proxy {site} removed");
            }
            Err(e) => {
                // Such a pair can't have been created, and its paths could
                // point outside the configuration directories
                warn!("Skipping removal of unusable proxy: {e}");
                self.emitter.reload_best_effort().await;
            }
        }
    }
}
