use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::HeaderValue,
    response::IntoResponse,
    routing::get,
    Router,
};
use color_eyre::eyre::eyre;
use hyper::{header, StatusCode};
use tokio::{
    net::TcpListener,
    sync::{
        oneshot::{self, Sender},
        Mutex,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::cert_manager::{
    challenge::{ChallengeError, ChallengeHandler, CleanupFuture},
    storage::{MemoryStorage, Storage},
};

struct RunningServer {
    handle: JoinHandle<()>,
    shutdown: Sender<()>,
    // Number of provisioning calls currently relying on the server
    users: usize,
}

type ServerHandle = Arc<Mutex<Option<RunningServer>>>;

/// HTTP-01 challenge responder.
///
/// Listens on a fixed internal port that the web server forwards
/// `/.well-known/acme-challenge/` to, so challenge requests never reach the
/// proxied backend. The listener is shared by concurrent orders and stops
/// when the last one releases it, dropping any token an abandoned order
/// left behind.
#[derive(Clone)]
pub struct Http01Handler {
    challenge_storage: Arc<dyn Storage>,
    // Tokens published and not withdrawn yet
    published: Arc<Mutex<HashSet<String>>>,
    host: String,
    port: u16,
    server_handle: ServerHandle,
}

impl Http01Handler {
    /// Create a new instance of the HTTP-01 challenge handler
    pub fn new(host: &str, port: u16) -> Self {
        Self::with_storage(MemoryStorage::new(), host, port)
    }

    /// Create a handler serving challenges from the given storage
    pub fn with_storage(challenge_storage: impl Storage + 'static, host: &str, port: u16) -> Self {
        Self {
            challenge_storage: Arc::new(challenge_storage),
            published: Arc::default(),
            host: host.into(),
            port,
            server_handle: Arc::new(Mutex::new(None)),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
            .with_state(self.challenge_storage.clone())
    }

    /// Start the server unless it is already running
    async fn start_server(&self) -> Result<(), ChallengeError> {
        let mut guard = self.server_handle.lock().await;

        if let Some(server) = guard.as_mut() {
            debug!("HTTP-01 challenge server already running");
            server.users += 1;
            return Ok(());
        }

        let listener = TcpListener::bind(format!("{}:{}", self.host, self.port)).await?;
        info!("Starting HTTP-01 challenge server on port {}...", self.port);

        let app = self.router();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            });
            let _ = ready_tx.send(());
            if let Err(e) = server.await {
                warn!("HTTP-01 server error: {e}");
            }
        });

        ready_rx
            .await
            .map_err(|_| ChallengeError::Other(eyre!("HTTP-01 server failed to start")))?;

        guard.replace(RunningServer {
            handle,
            shutdown: shutdown_tx,
            users: 1,
        });
        Ok(())
    }

    /// Drop one user of the server, stopping it after the last one
    async fn release_server(&self) {
        let mut guard = self.server_handle.lock().await;
        let last_user = match guard.as_mut() {
            Some(server) => {
                server.users = server.users.saturating_sub(1);
                server.users == 0
            }
            None => false,
        };
        if !last_user {
            return;
        }

        if let Some(server) = guard.take() {
            // Signal the server to shutdown
            let _ = server.shutdown.send(());
            if let Err(e) = server.handle.await {
                warn!("HTTP-01 server task ended abnormally: {e}");
            }
            info!("HTTP-01 challenge server stopped");
        }
        self.withdraw_leftovers().await;
    }

    // Orders cut short by a timeout never withdraw their tokens
    async fn withdraw_leftovers(&self) {
        let leftovers: Vec<String> = self.published.lock().await.drain().collect();
        for token in leftovers {
            debug!("Withdrawing leftover challenge token {token}");
            if let Err(e) = self.challenge_storage.delete(&token).await {
                warn!("Failed to withdraw challenge token {token}: {e}");
            }
        }
    }
}

async fn serve_challenge(
    Path(token): Path<String>,
    State(challenge_store): State<Arc<dyn Storage>>,
) -> Result<impl IntoResponse, StatusCode> {
    match challenge_store.load(&token).await {
        Ok(Some(challenge)) => {
            info!("Serving ACME challenge for token: {token}");
            Ok((
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                )],
                challenge,
            ))
        }
        Ok(None) => {
            warn!("Challenge not found for token: {token}");
            Err(StatusCode::NOT_FOUND)
        }
        Err(e) => {
            error!("Error while retrieving challenge for token {token}: {e:?}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[async_trait]
impl ChallengeHandler for Http01Handler {
    async fn bind(&self) -> Result<CleanupFuture, ChallengeError> {
        self.start_server().await?;

        let handler = self.clone();
        Ok(CleanupFuture::new(async move {
            handler.release_server().await;
            Ok(())
        }))
    }

    async fn publish(&self, token: &str, key_authorization: &str) -> Result<(), ChallengeError> {
        self.challenge_storage.store(token, key_authorization).await?;
        self.published.lock().await.insert(token.to_string());
        Ok(())
    }

    async fn withdraw(&self, token: &str) -> Result<(), ChallengeError> {
        self.challenge_storage.delete(token).await?;
        self.published.lock().await.remove(token);
        Ok(())
    }

    fn port(&self) -> u16 {
        self.port
    }
}
