use std::{
    io::ErrorKind,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::fs;
use tracing::{error, info, instrument, warn};

use crate::{
    cert_manager::CertPaths,
    models::SiteKey,
    utils::{
        errors::ProxyError,
        system::{ActivationLinker, ReloadSignal},
    },
};

const SSL_PROTOCOLS: &str = "TLSv1.2 TLSv1.3";
const SSL_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:DHE-RSA-AES128-GCM-SHA256:DHE-RSA-AES256-GCM-SHA384";

/// Variant of the virtual-host document
#[derive(Debug, Clone, Copy)]
pub enum SiteTemplate<'a> {
    /// Port 80 only
    Plain,
    /// Port 80 redirects to 443, which terminates TLS with the given material
    Secured(&'a CertPaths),
}

/// Render the nginx virtual-host document of a site
pub fn render_site(
    site: &SiteKey,
    allocation: &str,
    challenge_port: u16,
    template: SiteTemplate<'_>,
) -> String {
    let locations = locations(site, allocation, challenge_port);
    let domain = &site.domain;

    match template {
        SiteTemplate::Plain => format!(
            "server {{
	listen 80;
	server_name {domain};
{locations}}}
"
        ),
        SiteTemplate::Secured(paths) => format!(
            "server {{
	listen 80;
	server_name {domain};
	return 301 https://$server_name$request_uri;
}}

server {{
	listen 443 ssl http2;
	server_name {domain};

	ssl_certificate {cert};
	ssl_certificate_key {key};
	ssl_session_cache shared:SSL:10m;
	ssl_protocols {SSL_PROTOCOLS};
	ssl_ciphers \"{SSL_CIPHERS}\";
	ssl_prefer_server_ciphers on;
{locations}}}
",
            cert = paths.certificate.display(),
            key = paths.private_key.display(),
        ),
    }
}

// Proxy and ACME challenge locations shared by both variants
fn locations(site: &SiteKey, allocation: &str, challenge_port: u16) -> String {
    let upstream = match allocation.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]"),
        _ => allocation.to_string(),
    };
    let port = site.port;

    format!(
        "
	location / {{
		proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
		proxy_set_header Host $http_host;
		proxy_pass http://{upstream}:{port};
	}}

	location /.well-known/acme-challenge/ {{
		proxy_set_header Host $host;
		proxy_pass http://127.0.0.1:{challenge_port}$request_uri;
	}}
"
    )
}

/// Writes, activates and removes virtual-host documents
#[derive(Clone)]
pub struct SiteConfigEmitter {
    sites_available: PathBuf,
    sites_enabled: PathBuf,
    challenge_port: u16,
    linker: Arc<dyn ActivationLinker>,
    reloader: Arc<dyn ReloadSignal>,
}

impl SiteConfigEmitter {
    pub fn new(
        sites_available: impl Into<PathBuf>,
        sites_enabled: impl Into<PathBuf>,
        challenge_port: u16,
        linker: impl ActivationLinker + 'static,
        reloader: impl ReloadSignal + 'static,
    ) -> Self {
        Self {
            sites_available: sites_available.into(),
            sites_enabled: sites_enabled.into(),
            challenge_port,
            linker: Arc::new(linker),
            reloader: Arc::new(reloader),
        }
    }

    /// Where the document of the site is written
    pub fn document_path(&self, site: &SiteKey) -> PathBuf {
        self.sites_available.join(site.file_name())
    }

    /// Where the activation link of the site lives
    pub fn link_path(&self, site: &SiteKey) -> PathBuf {
        self.sites_enabled.join(site.file_name())
    }

    /// Write the document, activate it and reload the web server.
    ///
    /// Any failing step aborts the call. A document written before a failed
    /// activation stays on disk, inactive.
    #[instrument(name = "Emitting Site Config", skip(self, template), fields(site = %site))]
    pub async fn emit(
        &self,
        site: &SiteKey,
        allocation: &str,
        template: SiteTemplate<'_>,
    ) -> Result<(), ProxyError> {
        let document = self.document_path(site);
        let link = self.link_path(site);
        let contents = render_site(site, allocation, self.challenge_port, template);

        fs::write(&document, contents).await.map_err(|e| {
            error!(error = %e, "Failed to write the proxy configuration to {}", document.display());
            ProxyError::Internal("Internal error while saving the proxy configuration.".to_string())
        })?;

        self.linker.activate(&document, &link).await.map_err(|e| {
            error!(error = %e, "Failed to activate {}", document.display());
            ProxyError::Internal("Internal error while activating the proxy configuration.".to_string())
        })?;

        self.reload().await?;
        info!("Proxy configuration {} active", document.display());
        Ok(())
    }

    /// Remove the activation link and then the document, then reload.
    ///
    /// Best effort: failures are logged and the reload always runs. The
    /// document is kept while its link is still in place, so no link ever
    /// dangles.
    #[instrument(name = "Removing Site Config", skip(self), fields(site = %site))]
    pub async fn remove(&self, site: &SiteKey) {
        let link = self.link_path(site);
        let document = self.document_path(site);

        match self.linker.deactivate(&link).await {
            Ok(()) => {
                if let Err(e) = remove_document(&document).await {
                    error!(error = %e, "Failed to remove the proxy configuration {}", document.display());
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    "Failed to remove the activation link {}, keeping {}",
                    link.display(),
                    document.display()
                );
            }
        }

        self.reload_best_effort().await;
    }

    /// Reload the web server, logging a failure instead of returning it
    pub async fn reload_best_effort(&self) {
        if let Err(e) = self.reloader.reload().await {
            warn!(error = %e, "Failed to reload the web server");
        }
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        self.reloader.reload().await.map_err(|e| {
            error!(error = %e, "Failed to reload the web server");
            ProxyError::Internal("Internal error while reloading the web server.".to_string())
        })
    }
}

async fn remove_document(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        result => result,
    }
}
