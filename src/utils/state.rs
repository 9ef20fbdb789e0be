use std::sync::Arc;

use color_eyre::eyre::{Context, Result};

use crate::{
    cert_manager::{
        acme::InstantAcmeDirectory, challenge::Http01Handler, http_client::DefaultHttpClient,
        storage::FileStorage, CertManager,
    },
    config::Config,
    utils::{
        proxy_manager::ProxyManager,
        site_config::SiteConfigEmitter,
        system::{CommandReload, SymlinkActivation},
        validation::{DomainValidator, SystemResolver},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub proxy_manager: Arc<ProxyManager>,
}

pub async fn setup(config: &Config) -> Result<AppState> {
    let root_cert = match &config.acme.root_cert_path {
        Some(path) => {
            tracing::info!("Loading extra ACME root certificate from {path}");
            Some(
                tokio::fs::read(path)
                    .await
                    .wrap_err_with(|| format!("Failed to read ACME root certificate {path}"))?,
            )
        }
        None => None,
    };
    let http_client = DefaultHttpClient::new(root_cert.as_deref())?;

    let reloader = CommandReload::new(&config.nginx.reload_command, config.nginx.reload_timeout())
        .wrap_err("Invalid nginx reload command")?;

    let emitter = SiteConfigEmitter::new(
        &config.nginx.sites_available,
        &config.nginx.sites_enabled,
        config.acme.challenge_port,
        SymlinkActivation,
        reloader,
    );

    let cert_manager = CertManager::new(
        FileStorage::new(&config.certs.root),
        InstantAcmeDirectory::new(&config.acme.directory_url, http_client),
        Http01Handler::new(&config.acme.challenge_host, config.acme.challenge_port),
    )
    .with_acme_timeout(config.acme.timeout());

    let proxy_manager = ProxyManager::new(
        DomainValidator::new(SystemResolver),
        emitter,
        cert_manager,
    );

    tracing::info!(
        sites_available = %config.nginx.sites_available,
        sites_enabled = %config.nginx.sites_enabled,
        cert_root = %config.certs.root,
        "Proxy manager ready"
    );

    Ok(AppState {
        proxy_manager: Arc::new(proxy_manager),
    })
}
