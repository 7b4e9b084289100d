//! Reactive renewal at the HTTP boundary.
//!
//! The gate runs a call with the current credential. If the server answers
//! unauthorized, it renews through the session's single-flight refresher and
//! retries once. Concurrent calls that fail together share one renewal.

use std::future::Future;

use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{Credential, SessionManager};
use crate::error::RenewalError;

#[derive(Clone)]
pub struct RequestGate {
    session: SessionManager,
}

impl RequestGate {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Run `call` with the current credential (or none), renewing and
    /// retrying once on an unauthorized response.
    ///
    /// Calls that went out without a credential are not retried: the server
    /// is simply asking for a login. If the credential was replaced while the
    /// call was in flight, the call is retried with the new one and no renewal
    /// starts. A call still unauthorized after the retry clears the session.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> Result<T, ApiError>
    where
        F: FnMut(Option<Credential>) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let sent = self.session.credential();
        let had_credential = sent.is_some();

        match call(sent.clone()).await {
            Err(e) if e.is_unauthorized() && had_credential => {}
            other => return other,
        }

        let replaced = self
            .session
            .credential()
            .is_some_and(|current| Some(&current) != sent.as_ref());
        if replaced {
            debug!("Credential replaced while the call was in flight, retrying without renewal");
        } else {
            debug!("Call unauthorized, renewing credential");
            match self.session.refresh().await {
                Ok(_) => {}
                Err(RenewalError::Superseded) => {
                    debug!("Renewal overtaken by a newer session, retrying with its credential")
                }
                Err(err) => {
                    warn!(error = %err, "Renewal after unauthorized response failed");
                    return Err(ApiError::SessionExpired(err));
                }
            }
        }

        // Read back rather than using the renewal result: a clear that
        // happened after the renewal resolved must win.
        let Some(credential) = self.session.credential() else {
            return Err(ApiError::Unauthorized);
        };

        match call(Some(credential)).await {
            Err(e) if e.is_unauthorized() => {
                warn!("Call still unauthorized after renewal, clearing session");
                self.session.clear_local();
                Err(e)
            }
            other => other,
        }
    }
}
