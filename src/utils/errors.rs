use thiserror::Error;

use crate::cert_manager::errors::CertError;

/// Outcome classes of the proxy workflow
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// The request itself is unusable (malformed body, non-canonical domain, ...)
    #[error("{0}")]
    InvalidInput(String),
    /// The domain does not point at the allocation
    #[error("{0}")]
    ValidationFailed(String),
    /// A step of the ACME exchange failed
    #[error("{0}")]
    ProvisioningFailed(String),
    /// A local side effect failed (file system, link, reload)
    #[error("{0}")]
    Internal(String),
}

impl From<CertError> for ProxyError {
    fn from(err: CertError) -> Self {
        if err.is_local() {
            ProxyError::Internal(err.to_string())
        } else {
            ProxyError::ProvisioningFailed(err.to_string())
        }
    }
}
