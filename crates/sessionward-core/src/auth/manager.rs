//! Entry points that move the session between phases.
//!
//! `SessionManager` is a cheap-clone handle. Every renewal, whether triggered
//! by the proactive timer, by the request gate after an unauthorized response,
//! or by an OAuth callback, goes through the one `SingleFlightRefresher` owned
//! here.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::clock::{CredentialClock, DEFAULT_SAFETY_MARGIN};
use super::refresher::{RenewalFuture, RenewalOutcome, SingleFlightRefresher};
use super::scheduler::{RefreshScheduler, RenewalHook};
use super::storage::SessionStorage;
use super::store::{Identity, SessionPhase, SessionSnapshot, SessionState, SessionStore};
use super::Credential;
use crate::api::AuthApi;
use crate::error::{RenewalError, SessionError};

/// Default time allowed for the best-effort server logout.
const DEFAULT_END_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub safety_margin: Duration,
    pub end_session_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            end_session_timeout: DEFAULT_END_SESSION_TIMEOUT,
        }
    }
}

struct Inner {
    store: SessionStore,
    refresher: SingleFlightRefresher,
    api: Arc<dyn AuthApi>,
    end_session_timeout: Duration,
}

impl Inner {
    fn refresh(self: &Arc<Self>) -> RenewalFuture {
        let inner = Arc::clone(self);
        self.refresher.run(move || {
            let epoch = inner.store.epoch();
            inner.renew_and_settle(epoch)
        })
    }

    /// One renewal round trip. Installs or clears before any waiter sees the
    /// outcome, and does neither if another install or clear happened meanwhile.
    async fn renew_and_settle(self: Arc<Self>, epoch: u64) -> RenewalOutcome {
        let result = self.api.renew().await.map_err(RenewalError::from).and_then(|outcome| {
            if outcome.credential.is_empty() {
                Err(RenewalError::Rejected("renewal returned an empty credential".into()))
            } else {
                Ok(outcome)
            }
        });

        match result {
            Ok(outcome) => {
                // Absent flag means revoked
                let elevated = outcome.elevated.unwrap_or_else(|| {
                    debug!("Renewal response omitted elevated flag, treating as not elevated");
                    false
                });
                let credential = Credential::from(outcome.credential);

                if self.store.install_if_current(epoch, credential.clone(), elevated) {
                    info!(elevated, "Credential renewed");
                    Ok(credential)
                } else {
                    warn!("Session changed while renewing, discarding renewed credential");
                    Err(RenewalError::Superseded)
                }
            }
            Err(err) => {
                if self.store.clear_if_current(epoch) {
                    warn!(error = %err, "Credential renewal failed, session cleared");
                } else {
                    warn!(error = %err, "Stale renewal failed, keeping the newer session");
                }
                Err(err)
            }
        }
    }
}

/// Timer callback holding only a weak reference, so a pending timer never
/// keeps a dropped session alive.
fn renewal_hook(inner: Weak<Inner>) -> RenewalHook {
    Arc::new(move || {
        let inner = inner.clone();
        async move {
            match inner.upgrade() {
                Some(inner) => inner.refresh().await.map(|_| ()),
                None => Ok(()),
            }
        }
        .boxed()
    })
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Rebuild the session from `storage` and arm renewal for a restored
    /// credential. Call from inside a Tokio runtime.
    pub fn restore(
        api: Arc<dyn AuthApi>,
        storage: Arc<dyn SessionStorage>,
        options: SessionOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let scheduler = RefreshScheduler::new(CredentialClock::new(options.safety_margin));
            Inner {
                store: SessionStore::restore(storage, scheduler, renewal_hook(weak.clone())),
                refresher: SingleFlightRefresher::new(),
                api,
                end_session_timeout: options.end_session_timeout,
            }
        });

        if let Some(due_at) = inner.store.resume() {
            debug!(%due_at, "Restored session renewal armed");
        }
        Self { inner }
    }

    /// Log in. Surfaces collaborator errors verbatim and leaves the session
    /// untouched on failure.
    ///
    /// A successful login replaces any current session. When the server
    /// withholds the credential pending verification the session enters
    /// [`SessionPhase::PendingVerification`] and no timer is armed.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<SessionPhase, SessionError> {
        let outcome = self
            .inner
            .api
            .login(identifier, secret)
            .await
            .map_err(SessionError::LoginRejected)?;

        let credential = match (outcome.pending_verification, outcome.credential) {
            (true, credential) => {
                if credential.is_some() {
                    warn!("Login carried a credential while pending verification, withholding it");
                }
                None
            }
            (false, Some(raw)) if !raw.is_empty() => Some(Credential::from(raw)),
            (false, _) => return Err(SessionError::MissingCredential),
        };

        let store = &self.inner.store;
        if store.state().phase() != SessionPhase::Anonymous {
            info!("New login replaces the current session");
            store.clear();
        }
        store.set_identity(Some(Identity::new(outcome.identity_key)));

        match credential {
            Some(credential) => {
                store.install(credential, outcome.elevated);
                Ok(SessionPhase::Authenticated)
            }
            None => {
                store.set_pending_verification(true)?;
                info!("Login pending verification");
                Ok(SessionPhase::PendingVerification)
            }
        }
    }

    /// Log out locally right away, then tell the server on a best-effort basis.
    pub async fn logout(&self) {
        let credential = self.inner.store.credential();
        self.inner.store.clear();

        let end_session = self.inner.api.end_session(credential.as_ref());
        match tokio::time::timeout(self.inner.end_session_timeout, end_session).await {
            Ok(Ok(())) => debug!("Server session ended"),
            Ok(Err(e)) => warn!(error = %e, "Failed to end server session"),
            Err(_) => warn!("Timed out ending server session"),
        }
    }

    /// Drop the local session without contacting the server.
    pub fn clear_local(&self) {
        self.inner.store.clear();
    }

    /// Renew the credential, joining a renewal already in flight.
    pub async fn refresh(&self) -> Result<Credential, RenewalError> {
        self.inner.refresh().await
    }

    /// An identity provider redirected back to us. The server has set the
    /// renewal cookie; exchange it for a credential.
    pub async fn oauth_callback_observed(&self, provider: &str) -> Result<Credential, RenewalError> {
        info!(provider, "OAuth callback observed, materializing credential");
        self.inner.refresh().await
    }

    /// Finish a pending login once the verification step handed us a credential.
    pub fn complete_verification(&self, credential: Credential, elevated: bool) -> Result<(), SessionError> {
        let phase = self.inner.store.state().phase();
        if phase != SessionPhase::PendingVerification {
            return Err(SessionError::InvalidTransition {
                from: phase,
                to: SessionPhase::Authenticated,
            });
        }
        self.inner.store.install(credential, elevated);
        Ok(())
    }

    /// Give up on a pending verification and return to anonymous.
    pub fn abandon_verification(&self) -> Result<(), SessionError> {
        self.inner.store.set_pending_verification(false)
    }

    pub fn set_elevated(&self, elevated: bool) -> Result<(), SessionError> {
        self.inner.store.set_elevated(elevated)
    }

    pub fn set_identity(&self, identity: Option<Identity>) {
        self.inner.store.set_identity(identity);
    }

    pub fn state(&self) -> SessionState {
        self.inner.store.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.store.state().snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.store.subscribe()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner.store.credential()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.store.is_authenticated()
    }

    /// When the proactive renewal will fire, if one is armed.
    pub fn renewal_due_at(&self) -> Option<DateTime<Utc>> {
        self.inner.store.scheduler().due_at()
    }

    pub fn is_renewing(&self) -> bool {
        self.inner.refresher.is_in_flight()
    }

    pub fn renewals_started(&self) -> u64 {
        self.inner.refresher.started()
    }
}
