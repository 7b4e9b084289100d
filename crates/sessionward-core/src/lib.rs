//! sessionward-core - client-side session and credential lifecycle.
//!
//! This crate owns a short-lived bearer credential on behalf of a client
//! application:
//!
//! - `auth`: credential decoding, renewal scheduling, single-flight renewal,
//!   the session store and the `SessionManager` that wires them together
//! - `api`: the authentication collaborator contract, its HTTP implementation
//!   and the `RequestGate` that retries unauthorized calls once after renewal
//! - `config`: on-disk configuration
//!
//! Everything else in a client (screens, forms, routing) talks to this crate
//! through `SessionManager` and `ApiClient` only.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;

pub use api::{ApiClient, ApiError, AuthApi, HttpAuthApi, RequestGate};
pub use auth::{
    Credential, CredentialClock, Expiry, SessionManager, SessionOptions, SessionPhase,
    SessionSnapshot, SessionState, SessionStore,
};
pub use config::Config;
pub use error::{DecodeError, RenewalError, SessionError, StorageError};

#[cfg(test)]
pub(crate) mod testing;
