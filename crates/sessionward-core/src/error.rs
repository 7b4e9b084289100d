//! Error types shared across the session subsystem.
//!
//! `ApiError` (the HTTP boundary) lives in [`crate::api::error`]; everything
//! that concerns the session itself is defined here.

use thiserror::Error;

use crate::api::ApiError;
use crate::auth::{SessionPhase, Slot};

/// Why a credential's expiry could not be read.
///
/// Never fatal: an undecodable credential is still used, it just cannot be
/// renewed ahead of time.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("credential has {segments} segments, expected 3")]
    NotCompact { segments: usize },

    #[error("credential payload is not valid base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("credential payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("credential expiry claim is out of range: {0}")]
    ExpiryOutOfRange(i64),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {slot} slot: {source}")]
    Io {
        slot: Slot,
        #[source]
        source: std::io::Error,
    },

    #[error("keychain error on {slot} slot: {source}")]
    Keyring {
        slot: Slot,
        #[source]
        source: keyring::Error,
    },

    #[error("no storage directory available: {0}")]
    NoDirectory(String),
}

/// Outcome shared by every waiter of one renewal.
///
/// Cloneable because all callers joined to the same in-flight renewal receive
/// their own copy of the failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("renewal rejected: {0}")]
    Rejected(String),

    #[error("network error during renewal: {0}")]
    Network(String),

    #[error("session was cleared while the renewal was in flight")]
    Superseded,

    #[error("renewal task aborted: {0}")]
    Aborted(String),
}

impl From<ApiError> for RenewalError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NetworkError(_) | ApiError::Timeout | ApiError::ServerError(_) => {
                RenewalError::Network(err.to_string())
            }
            other => RenewalError::Rejected(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("login rejected: {0}")]
    LoginRejected(#[source] ApiError),

    #[error("cannot move session from {from} to {to}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },

    #[error("no authenticated session")]
    NotAuthenticated,

    #[error("login succeeded but the response carried no credential")]
    MissingCredential,
}
