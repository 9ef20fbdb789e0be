use std::{
    collections::HashMap,
    io,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use color_eyre::eyre::{eyre, Result};
use rcgen::{CertificateParams, KeyPair};
use tempfile::TempDir;

use crate::{
    cert_manager::{
        acme::{AcmeAccount, AcmeDirectory},
        challenge::{ChallengeError, ChallengeHandler, CleanupFuture},
        storage::FileStorage,
        CertManager,
    },
    models::ProxyRequest,
    utils::{
        proxy_manager::ProxyManager,
        site_config::SiteConfigEmitter,
        state::AppState,
        system::{ActivationLinker, ReloadSignal, SymlinkActivation, SystemError},
        validation::{DnsResolver, DomainValidator},
    },
};

pub const CHALLENGE_PORT: u16 = 81;

/// Resolver answering from a fixed table and recording every lookup
#[derive(Clone, Default)]
pub struct FakeResolver {
    hosts: Arc<Mutex<HashMap<String, Vec<IpAddr>>>>,
    lookups: Arc<Mutex<Vec<String>>>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: &str, ips: &[&str]) -> Self {
        let ips = ips.iter().map(|ip| ip.parse().unwrap()).collect();
        self.hosts.lock().unwrap().insert(host.to_string(), ips);
        self
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl DnsResolver for FakeResolver {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        self.lookups.lock().unwrap().push(host.to_string());
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host not found"))
    }
}

/// Reload signal counting its invocations
#[derive(Clone, Default)]
pub struct RecordingReload {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl RecordingReload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReloadSignal for RecordingReload {
    async fn reload(&self) -> Result<(), SystemError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SystemError::EmptyCommand);
        }
        Ok(())
    }
}

fn permission_denied(link: &Path) -> SystemError {
    SystemError::Io {
        path: link.to_path_buf(),
        source: io::Error::from(io::ErrorKind::PermissionDenied),
    }
}

/// Linker that can neither create nor remove links
#[derive(Clone, Copy, Default)]
pub struct BrokenLinker;

#[async_trait]
impl ActivationLinker for BrokenLinker {
    async fn activate(&self, _document: &Path, link: &Path) -> Result<(), SystemError> {
        Err(permission_denied(link))
    }

    async fn deactivate(&self, link: &Path) -> Result<(), SystemError> {
        Err(permission_denied(link))
    }
}

/// Linker that creates real links but fails to remove them
#[derive(Clone, Copy, Default)]
pub struct StuckLinker;

#[async_trait]
impl ActivationLinker for StuckLinker {
    async fn activate(&self, document: &Path, link: &Path) -> Result<(), SystemError> {
        SymlinkActivation.activate(document, link).await
    }

    async fn deactivate(&self, link: &Path) -> Result<(), SystemError> {
        Err(permission_denied(link))
    }
}

/// Step at which [FakeAcme] fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeFailure {
    Never,
    Registration,
    Issuance,
}

/// Simulated certificate authority issuing self-signed certificates
#[derive(Clone)]
pub struct FakeAcme {
    failure: AcmeFailure,
    registrations: Arc<Mutex<Vec<String>>>,
}

impl FakeAcme {
    pub fn new(failure: AcmeFailure) -> Self {
        Self {
            failure,
            registrations: Arc::default(),
        }
    }

    pub fn registrations(&self) -> Vec<String> {
        self.registrations.lock().unwrap().clone()
    }
}

#[async_trait]
impl AcmeDirectory for FakeAcme {
    async fn register(&self, email: &str) -> Result<Box<dyn AcmeAccount>> {
        if self.failure == AcmeFailure::Registration {
            return Err(eyre!("urn:ietf:params:acme:error:invalidContact"));
        }
        self.registrations.lock().unwrap().push(email.to_string());
        Ok(Box::new(FakeAccount {
            failure: self.failure,
        }))
    }
}

struct FakeAccount {
    failure: AcmeFailure,
}

#[async_trait]
impl AcmeAccount for FakeAccount {
    async fn order_certificate(
        &self,
        domain: &str,
        key: &KeyPair,
        challenges: &dyn ChallengeHandler,
    ) -> Result<String> {
        challenges.publish("token", "token.thumbprint").await?;
        challenges.withdraw("token").await?;
        if self.failure == AcmeFailure::Issuance {
            return Err(eyre!("urn:ietf:params:acme:error:connection"));
        }
        let cert = CertificateParams::new(vec![domain.to_string()])?.self_signed(key)?;
        Ok(cert.pem())
    }
}

/// Challenge responder that records what it is asked to do
#[derive(Clone, Default)]
pub struct FakeChallenges {
    fail_bind: bool,
    pub binds: Arc<AtomicUsize>,
    pub releases: Arc<AtomicUsize>,
    pub published: Arc<Mutex<Vec<String>>>,
}

impl FakeChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unbindable() -> Self {
        Self {
            fail_bind: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ChallengeHandler for FakeChallenges {
    async fn bind(&self) -> Result<CleanupFuture, ChallengeError> {
        if self.fail_bind {
            return Err(ChallengeError::Io(io::Error::from(
                io::ErrorKind::AddrInUse,
            )));
        }
        self.binds.fetch_add(1, Ordering::SeqCst);
        let releases = self.releases.clone();
        Ok(CleanupFuture::new(async move {
            releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    async fn publish(&self, token: &str, _key_authorization: &str) -> Result<(), ChallengeError> {
        self.published.lock().unwrap().push(token.to_string());
        Ok(())
    }

    async fn withdraw(&self, _token: &str) -> Result<(), ChallengeError> {
        Ok(())
    }

    fn port(&self) -> u16 {
        CHALLENGE_PORT
    }
}

/// Temporary stand-ins for the nginx and certificate directories
pub struct TestDirs {
    dir: TempDir,
}

impl TestDirs {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sites-available")).unwrap();
        std::fs::create_dir(dir.path().join("sites-enabled")).unwrap();
        Self { dir }
    }

    pub fn available(&self) -> PathBuf {
        self.dir.path().join("sites-available")
    }

    pub fn enabled(&self) -> PathBuf {
        self.dir.path().join("sites-enabled")
    }

    pub fn certs(&self) -> PathBuf {
        self.dir.path().join("server_certs")
    }

    pub fn emitter(
        &self,
        linker: impl ActivationLinker + 'static,
        reload: impl ReloadSignal + 'static,
    ) -> SiteConfigEmitter {
        SiteConfigEmitter::new(
            self.available(),
            self.enabled(),
            CHALLENGE_PORT,
            linker,
            reload,
        )
    }

    pub fn cert_manager(
        &self,
        acme: impl AcmeDirectory + 'static,
        challenges: impl ChallengeHandler + 'static,
    ) -> CertManager {
        CertManager::new(FileStorage::new(self.certs()), acme, challenges)
    }

    pub fn proxy_manager(
        &self,
        resolver: FakeResolver,
        linker: impl ActivationLinker + 'static,
        reload: RecordingReload,
        acme: FakeAcme,
    ) -> ProxyManager {
        ProxyManager::new(
            DomainValidator::new(resolver),
            self.emitter(linker, reload),
            self.cert_manager(acme, FakeChallenges::new()),
        )
    }
}

/// Resolver where `app.example.com` points at the allocation `10.0.0.5`
pub fn matching_resolver() -> FakeResolver {
    FakeResolver::new().with_host("app.example.com", &["10.0.0.5"])
}

/// Plain HTTP creation request on port 8080
pub fn proxy_request(domain: &str, ip: &str) -> ProxyRequest {
    serde_json::from_value(serde_json::json!({
        "domain": domain,
        "ip": ip,
        "port": "8080",
    }))
    .unwrap()
}

pub fn test_app_state(dirs: &TestDirs, reload: RecordingReload, acme: FakeAcme) -> AppState {
    test_app_state_with_linker(dirs, SymlinkActivation, reload, acme)
}

pub fn test_app_state_with_linker(
    dirs: &TestDirs,
    linker: impl ActivationLinker + 'static,
    reload: RecordingReload,
    acme: FakeAcme,
) -> AppState {
    AppState {
        proxy_manager: Arc::new(dirs.proxy_manager(matching_resolver(), linker, reload, acme)),
    }
}
