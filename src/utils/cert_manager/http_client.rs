use std::{future::Future, pin::Pin};

use axum::body::Bytes;
use color_eyre::eyre::{Context, Result};
use http_body_util::Full;
use hyper::Request;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use instant_acme::{BytesResponse, Error, HttpClient};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{pem::PemObject, CertificateDer};

/// HTTP client used for the ACME flow.
///
/// Trusts the webpki roots plus an optional extra root, so staging
/// directories signed by a private CA can be used.
#[derive(Clone)]
pub struct DefaultHttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl DefaultHttpClient {
    /// Build a client trusting `extra_root_pem` on top of the webpki roots
    pub fn new(extra_root_pem: Option<&[u8]>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        if let Some(pem) = extra_root_pem {
            let certs = CertificateDer::pem_slice_iter(pem)
                .collect::<Result<Vec<_>, _>>()
                .wrap_err("Failed to parse the ACME root certificate")?;
            let (added, ignored) = roots.add_parsable_certificates(certs);
            tracing::info!("Added {added} extra ACME root certificate(s), ignored {ignored}");
        }
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_only()
            .enable_all_versions()
            .build();

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

impl HttpClient for DefaultHttpClient {
    fn request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, Error>> + Send>> {
        let response = self.client.request(req);
        Box::pin(async move { Ok(BytesResponse::from(response.await?)) })
    }
}
