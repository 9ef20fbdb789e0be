use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::{eyre, Report, Result, WrapErr};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::cert_manager::{challenge::ChallengeHandler, http_client::DefaultHttpClient};

const POLL_INITIAL_DELAY: Duration = Duration::from_millis(250);
const POLL_MAX_DELAY: Duration = Duration::from_secs(5);

/// Entry point of an ACME certificate authority
#[async_trait]
pub trait AcmeDirectory: Send + Sync {
    /// Register a new account for the contact email, agreeing to the terms of service
    async fn register(&self, email: &str) -> Result<Box<dyn AcmeAccount>>;
}

/// A registered ACME account
#[async_trait]
pub trait AcmeAccount: Send + Sync {
    /// Order a certificate for exactly one domain.
    ///
    /// Challenges are answered through `challenges`, which must already be
    /// bound. Returns the bundled certificate chain in PEM format.
    async fn order_certificate(
        &self,
        domain: &str,
        key: &KeyPair,
        challenges: &dyn ChallengeHandler,
    ) -> Result<String>;
}

/// [AcmeDirectory] backed by `instant-acme`
pub struct InstantAcmeDirectory {
    directory_url: String,
    http: DefaultHttpClient,
}

impl InstantAcmeDirectory {
    pub fn new(directory_url: impl Into<String>, http: DefaultHttpClient) -> Self {
        Self {
            directory_url: directory_url.into(),
            http,
        }
    }
}

#[async_trait]
impl AcmeDirectory for InstantAcmeDirectory {
    #[instrument(
        name = "Registering ACME Account",
        skip(self),
        fields(directory_url = %self.directory_url)
    )]
    async fn register(&self, email: &str) -> Result<Box<dyn AcmeAccount>> {
        let (account, _credentials) = Account::create_with_http(
            &NewAccount {
                contact: &[&format!("mailto:{email}")],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
            Box::new(self.http.clone()),
        )
        .await
        .wrap_err_with(|| format!("could not register {email} at {}", self.directory_url))?;

        info!("Account successfully created.");
        Ok(Box::new(InstantAcmeAccount { account }))
    }
}

struct InstantAcmeAccount {
    account: Account,
}

#[async_trait]
impl AcmeAccount for InstantAcmeAccount {
    #[instrument(name = "Ordering Certificate", skip(self, key, challenges))]
    async fn order_certificate(
        &self,
        domain: &str,
        key: &KeyPair,
        challenges: &dyn ChallengeHandler,
    ) -> Result<String> {
        let identifier = Identifier::Dns(domain.to_owned());
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await
            .wrap_err("could not create the order")?;

        let mut published = Vec::new();
        let result = complete_order(&mut order, domain, key, challenges, &mut published).await;

        for token in published {
            if let Err(e) = challenges.withdraw(&token).await {
                warn!("Failed to withdraw challenge token {token}: {e}");
            }
        }
        result
    }
}

async fn complete_order(
    order: &mut Order,
    domain: &str,
    key: &KeyPair,
    challenges: &dyn ChallengeHandler,
    published: &mut Vec<String>,
) -> Result<String> {
    let authorizations = order
        .authorizations()
        .await
        .wrap_err("could not fetch the order authorizations")?;

    for authz in &authorizations {
        // Skip already valid authorizations
        if authz.status == AuthorizationStatus::Valid {
            continue;
        }
        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Http01)
            .ok_or_else(|| eyre!("the CA offered no HTTP-01 challenge"))?;

        let key_auth = order.key_authorization(challenge);
        challenges
            .publish(&challenge.token, key_auth.as_str())
            .await
            .wrap_err("could not publish the challenge response")?;
        published.push(challenge.token.clone());
        debug!(token = %challenge.token, "Published HTTP-01 challenge response");

        order
            .set_challenge_ready(&challenge.url)
            .await
            .wrap_err("could not mark the challenge as ready")?;
    }

    // Poll the ACME server until the order becomes ready or invalid
    let mut delay = POLL_INITIAL_DELAY;
    loop {
        let state = order.refresh().await.wrap_err("could not refresh the order")?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => break,
            OrderStatus::Invalid => {
                let reason = state
                    .error
                    .as_ref()
                    .map(|problem| format!("{problem:?}"))
                    .unwrap_or_else(|| "no reason given".to_string());
                return Err(eyre!(
                    "the order became invalid, the challenge most likely failed: {reason}"
                ));
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                sleep(delay).await;
                delay = (delay * 2).min(POLL_MAX_DELAY);
            }
        }
    }

    if order.state().status != OrderStatus::Valid {
        let csr = certificate_request(domain, key)?;
        order
            .finalize(&csr)
            .await
            .wrap_err("could not finalize the order")?;
    }

    let mut delay = POLL_INITIAL_DELAY;
    let chain = loop {
        match order
            .certificate()
            .await
            .wrap_err("could not download the certificate")?
        {
            Some(chain) => break chain,
            None => {
                sleep(delay).await;
                delay = (delay * 2).min(POLL_MAX_DELAY);
            }
        }
    };

    Ok(chain)
}

// DER-encoded certificate signing request for a single domain
fn certificate_request(domain: &str, key: &KeyPair) -> Result<Vec<u8>> {
    let mut params =
        CertificateParams::new(vec![domain.to_owned()]).map_err(Report::new)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    let csr = params.serialize_request(key).map_err(Report::new)?;
    Ok(csr.der().to_vec())
}
