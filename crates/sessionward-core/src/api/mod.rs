//! HTTP boundary for the session subsystem.
//!
//! - `AuthApi`: the login / renew / end-session collaborator contract
//! - `HttpAuthApi`: its reqwest implementation; the renewal artifact is an
//!   HTTP-only cookie kept in the client's cookie store
//! - `RequestGate`: attaches the current credential and retries once after a
//!   renewal when a call comes back unauthorized
//! - `ApiClient`: JSON get/post through the gate

pub mod auth;
pub mod client;
pub mod error;
pub mod gate;

pub use auth::{AuthApi, HttpAuthApi, LoginOutcome, RenewOutcome};
pub use client::ApiClient;
pub use error::ApiError;
pub use gate::RequestGate;
