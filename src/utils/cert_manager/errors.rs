use std::time::Duration;

use color_eyre::eyre::Error as EyreError;
use rcgen::Error as KeyGenError;
use thiserror::Error;

use crate::cert_manager::{challenge::ChallengeError, storage::StorageError};

/// Failures of the provisioning state machine, one variant per step
#[derive(Error, Debug)]
pub enum CertError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(#[source] KeyGenError),

    #[error("ACME account registration failed. Check the contact email and that the terms of service can be accepted: {0:#}")]
    Registration(#[source] EyreError),

    #[error("Could not bind the HTTP-01 challenge responder on port {port}. Make sure the port is free: {source}")]
    ChallengeBinding {
        port: u16,
        #[source]
        source: ChallengeError,
    },

    #[error("Certificate issuance failed for {domain}. Make sure the domain points at this host and the challenge port is reachable: {source:#}")]
    Issuance {
        domain: String,
        #[source]
        source: EyreError,
    },

    #[error("ACME exchange for {domain} did not complete within {timeout:?}")]
    TimedOut { domain: String, timeout: Duration },

    #[error("Certificate material could not be saved: {0}")]
    Storage(#[from] StorageError),
}

impl CertError {
    /// Whether the failure happened on this host rather than in the ACME exchange
    pub fn is_local(&self) -> bool {
        matches!(self, CertError::Storage(_))
    }
}
