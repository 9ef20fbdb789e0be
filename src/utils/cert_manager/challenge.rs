mod http01;

pub use http01::Http01Handler;

use std::{future::Future, io, pin::Pin};

use async_trait::async_trait;
use color_eyre::eyre::Error as Report;
use thiserror::Error;

use crate::cert_manager::storage::StorageError;

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Another error occurred: {0}")]
    Other(#[source] Report),
}

/// Abstract interface for answering ACME HTTP-01 challenges
#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    /// Start answering challenge requests.
    ///
    /// Returns a cleanup future that releases the responder once the order is done
    async fn bind(&self) -> Result<CleanupFuture, ChallengeError>;

    /// Serve the given key authorization for the token
    async fn publish(&self, token: &str, key_authorization: &str) -> Result<(), ChallengeError>;

    /// Stop serving the given token
    async fn withdraw(&self, token: &str) -> Result<(), ChallengeError>;

    /// Local port the responder listens on
    fn port(&self) -> u16;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A future that performs cleanup of resources allocated during ACME challenge validation
pub struct CleanupFuture {
    inner: BoxFuture<'static, Result<(), ChallengeError>>,
}

impl CleanupFuture {
    /// Create a cleanup future with the given future
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = Result<(), ChallengeError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(fut) as BoxFuture<'static, Result<(), ChallengeError>>,
        }
    }

    /// Run the cleanup process
    pub async fn run(self) -> Result<(), ChallengeError> {
        self.inner.await
    }
}
