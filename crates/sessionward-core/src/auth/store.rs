//! The session store: single owner of the credential and everything derived
//! from it.
//!
//! All mutations go through here. Each one writes the persisted slots first,
//! then publishes the new [`SessionState`] on a watch channel, so a reload
//! and a subscriber both observe the same last-known state. Entering the
//! authenticated phase arms the renewal timer; leaving it disarms the timer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::scheduler::{RefreshScheduler, RenewalHook};
use super::storage::{SessionStorage, Slot};
use super::Credential;
use crate::error::{SessionError, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub display_key: String,
}

impl Identity {
    pub fn new(display_key: impl Into<String>) -> Self {
        Self {
            display_key: display_key.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Anonymous,
    PendingVerification,
    Authenticated,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionPhase::Anonymous => "anonymous",
            SessionPhase::PendingVerification => "pending verification",
            SessionPhase::Authenticated => "authenticated",
        })
    }
}

/// Current session. Fields are private so the invariants hold:
/// authenticated exactly when a credential is present, elevated only while
/// authenticated, pending verification never alongside a credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    credential: Option<Credential>,
    elevated: bool,
    identity: Option<Identity>,
    pending_verification: bool,
}

impl SessionState {
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }

    pub fn is_elevated(&self) -> bool {
        self.is_authenticated() && self.elevated
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_pending_verification(&self) -> bool {
        self.pending_verification
    }

    pub fn phase(&self) -> SessionPhase {
        if self.is_authenticated() {
            SessionPhase::Authenticated
        } else if self.pending_verification {
            SessionPhase::PendingVerification
        } else {
            SessionPhase::Anonymous
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase(),
            authenticated: self.is_authenticated(),
            elevated: self.is_elevated(),
            identity: self.identity.clone(),
            pending_verification: self.pending_verification,
        }
    }
}

/// What the UI gets to see: the session without credential material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub authenticated: bool,
    pub elevated: bool,
    pub identity: Option<Identity>,
    pub pending_verification: bool,
}

pub struct SessionStore {
    state: watch::Sender<SessionState>,
    storage: Arc<dyn SessionStorage>,
    scheduler: RefreshScheduler,
    on_due: RenewalHook,
    /// Serialises install/clear so the last writer also owns the timer.
    transition: Mutex<()>,
    /// Bumped on every install and clear; lets a late renewal detect it was overtaken.
    epoch: AtomicU64,
}

impl SessionStore {
    /// Rebuild the session from persisted slots.
    ///
    /// Unreadable storage starts the session anonymous. The timer is not armed
    /// until [`SessionStore::resume`] is called from inside a runtime.
    pub fn restore(
        storage: Arc<dyn SessionStorage>,
        scheduler: RefreshScheduler,
        on_due: RenewalHook,
    ) -> Self {
        let state = match Self::read_slots(storage.as_ref()) {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session, starting anonymous");
                SessionState::default()
            }
        };
        debug!(phase = %state.phase(), "Session restored");

        let (state, _) = watch::channel(state);
        Self {
            state,
            storage,
            scheduler,
            on_due,
            transition: Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    fn read_slots(storage: &dyn SessionStorage) -> Result<SessionState, StorageError> {
        let Some(raw) = storage.read(Slot::Credential)?.filter(|raw| !raw.is_empty()) else {
            return Ok(SessionState::default());
        };
        let elevated = storage
            .read(Slot::Elevated)?
            .map(|flag| flag.trim() == "true")
            .unwrap_or(false);

        Ok(SessionState {
            credential: Some(Credential::from(raw)),
            elevated,
            ..SessionState::default()
        })
    }

    /// Arm the renewal timer for a restored credential.
    pub fn resume(&self) -> Option<DateTime<Utc>> {
        let _transition = self.lock_transition();
        let credential = self.state.borrow().credential.clone()?;
        self.scheduler.arm(&credential, Arc::clone(&self.on_due))
    }

    /// Enter (or stay in) the authenticated phase with `credential`.
    pub fn install(&self, credential: Credential, elevated: bool) {
        let _transition = self.lock_transition();
        self.install_locked(credential, elevated);
    }

    /// Install only if nothing has been installed or cleared since `epoch`.
    pub(crate) fn install_if_current(&self, epoch: u64, credential: Credential, elevated: bool) -> bool {
        let _transition = self.lock_transition();
        if self.epoch() != epoch {
            return false;
        }
        self.install_locked(credential, elevated);
        true
    }

    fn install_locked(&self, credential: Credential, elevated: bool) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.persist(Slot::Credential, Some(credential.expose()));
        self.persist(Slot::Elevated, Some(if elevated { "true" } else { "false" }));

        self.state.send_modify(|state| {
            state.credential = Some(credential.clone());
            state.elevated = elevated;
            state.pending_verification = false;
        });

        let due_at = self.scheduler.arm(&credential, Arc::clone(&self.on_due));
        info!(elevated, armed = due_at.is_some(), "Session credential installed");
    }

    /// Return to the anonymous phase: disarm, empty both slots, drop identity.
    pub fn clear(&self) {
        let _transition = self.lock_transition();
        self.clear_locked();
    }

    /// Clear only if nothing has been installed or cleared since `epoch`.
    pub(crate) fn clear_if_current(&self, epoch: u64) -> bool {
        let _transition = self.lock_transition();
        if self.epoch() != epoch {
            return false;
        }
        self.clear_locked();
        true
    }

    fn clear_locked(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.scheduler.disarm();
        for slot in Slot::ALL {
            self.persist(slot, None);
        }

        let was = self.state.borrow().phase();
        self.state.send_replace(SessionState::default());
        info!(from = %was, "Session cleared");
    }

    pub fn set_elevated(&self, elevated: bool) -> Result<(), SessionError> {
        let _transition = self.lock_transition();
        if !self.state.borrow().is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }
        self.persist(Slot::Elevated, Some(if elevated { "true" } else { "false" }));
        self.state.send_if_modified(|state| {
            let changed = state.elevated != elevated;
            state.elevated = elevated;
            changed
        });
        Ok(())
    }

    pub fn set_identity(&self, identity: Option<Identity>) {
        self.state.send_if_modified(|state| {
            let changed = state.identity != identity;
            state.identity = identity;
            changed
        });
    }

    /// Mark (or unmark) a login that is waiting on secondary confirmation.
    ///
    /// Refused while a credential is live.
    pub fn set_pending_verification(&self, pending: bool) -> Result<(), SessionError> {
        let _transition = self.lock_transition();
        let phase = self.state.borrow().phase();
        if pending && phase == SessionPhase::Authenticated {
            return Err(SessionError::InvalidTransition {
                from: phase,
                to: SessionPhase::PendingVerification,
            });
        }
        self.state.send_if_modified(|state| {
            let changed = state.pending_verification != pending;
            state.pending_verification = pending;
            if !pending && state.credential.is_none() {
                state.identity = None;
            }
            changed
        });
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.state.borrow().credential.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write-through to storage. A failed write is logged, never fatal: the
    /// in-memory state stays authoritative for this process.
    fn persist(&self, slot: Slot, value: Option<&str>) {
        let result = match value {
            Some(value) => self.storage.write(slot, value),
            None => self.storage.remove(slot),
        };
        if let Err(e) = result {
            error!(error = %e, %slot, "Failed to persist session slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::FutureExt;

    use crate::auth::storage::MemoryStorage;
    use crate::auth::CredentialClock;
    use crate::error::RenewalError;
    use crate::testing::{jwt_expiring_in, opaque_credential};

    fn store_with(storage: MemoryStorage) -> (SessionStore, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let hook: RenewalHook = Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), RenewalError>(())
            }
            .boxed()
        });
        let scheduler = RefreshScheduler::new(CredentialClock::new(Duration::from_secs(60)));
        (SessionStore::restore(Arc::new(storage), scheduler, hook), fired)
    }

    #[test]
    fn test_restore_empty_storage_is_anonymous() {
        let (store, _) = store_with(MemoryStorage::new());
        let state = store.state();
        assert_eq!(state.phase(), SessionPhase::Anonymous);
        assert!(!state.is_authenticated());
        assert!(!state.is_elevated());
        assert!(state.credential().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_persists_and_arms() {
        let storage = MemoryStorage::new();
        let (store, _) = store_with(storage.clone());
        let credential = jwt_expiring_in(3600);

        store.install(credential.clone(), true);

        let state = store.state();
        assert_eq!(state.phase(), SessionPhase::Authenticated);
        assert!(state.is_elevated());
        assert_eq!(state.credential(), Some(&credential));
        assert_eq!(
            storage.read(Slot::Credential).unwrap().as_deref(),
            Some(credential.expose())
        );
        assert_eq!(storage.read(Slot::Elevated).unwrap().as_deref(), Some("true"));
        assert!(store.scheduler().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_then_resume_from_persisted_slots() {
        let storage = MemoryStorage::new();
        let credential = jwt_expiring_in(3600);
        storage.write(Slot::Credential, credential.expose()).unwrap();
        storage.write(Slot::Elevated, "true").unwrap();

        let (store, _) = store_with(storage);
        assert!(store.is_authenticated());
        assert!(store.state().is_elevated());
        assert!(!store.scheduler().is_armed());

        assert!(store.resume().is_some());
        assert!(store.scheduler().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_empties_slots_and_disarms() {
        let storage = MemoryStorage::new();
        let (store, fired) = store_with(storage.clone());
        store.install(jwt_expiring_in(61), true);
        store.set_identity(Some(Identity::new("ada@example.com")));

        store.clear();
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(store.state(), SessionState::default());
        assert_eq!(storage.read(Slot::Credential).unwrap(), None);
        assert_eq!(storage.read(Slot::Elevated).unwrap(), None);
        assert!(!store.scheduler().is_armed());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_installing_undecodable_credential_is_reactive_only() {
        let (store, _) = store_with(MemoryStorage::new());
        store.install(opaque_credential(), false);
        assert!(store.is_authenticated());
        assert!(!store.scheduler().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_verification_rules() {
        let (store, _) = store_with(MemoryStorage::new());

        store.set_identity(Some(Identity::new("ada")));
        store.set_pending_verification(true).unwrap();
        assert_eq!(store.state().phase(), SessionPhase::PendingVerification);

        // Verification completing installs a credential and ends the pending phase
        store.install(jwt_expiring_in(3600), false);
        let state = store.state();
        assert_eq!(state.phase(), SessionPhase::Authenticated);
        assert!(!state.is_pending_verification());
        assert_eq!(state.identity(), Some(&Identity::new("ada")));

        let err = store.set_pending_verification(true).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                from: SessionPhase::Authenticated,
                to: SessionPhase::PendingVerification
            }
        ));
    }

    #[test]
    fn test_abandoning_verification_returns_to_anonymous() {
        let (store, _) = store_with(MemoryStorage::new());
        store.set_identity(Some(Identity::new("ada")));
        store.set_pending_verification(true).unwrap();

        store.set_pending_verification(false).unwrap();

        assert_eq!(store.state(), SessionState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_elevated_requires_authentication() {
        let storage = MemoryStorage::new();
        let (store, _) = store_with(storage.clone());
        assert!(matches!(store.set_elevated(true), Err(SessionError::NotAuthenticated)));

        store.install(jwt_expiring_in(3600), false);
        store.set_elevated(true).unwrap();
        assert!(store.state().is_elevated());
        assert_eq!(storage.read(Slot::Elevated).unwrap().as_deref(), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_observe_transitions() {
        let (store, _) = store_with(MemoryStorage::new());
        let mut rx = store.subscribe();

        store.install(jwt_expiring_in(3600), false);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_authenticated());

        store.clear();
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_epoch_guards_stale_writes() {
        let (store, _) = store_with(MemoryStorage::new());
        let epoch = store.epoch();

        store.clear();

        assert!(!store.install_if_current(epoch, jwt_expiring_in(3600), false));
        assert!(!store.is_authenticated());
        assert!(!store.clear_if_current(epoch));
        assert!(store.install_if_current(store.epoch(), jwt_expiring_in(3600), false));
        assert!(store.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_overtakes_older_epoch() {
        let (store, _) = store_with(MemoryStorage::new());
        let epoch = store.epoch();
        let newer = jwt_expiring_in(3600);

        store.install(newer.clone(), true);

        assert!(!store.clear_if_current(epoch));
        assert!(!store.install_if_current(epoch, jwt_expiring_in(7200), false));
        assert_eq!(store.credential(), Some(newer));
        assert!(store.state().is_elevated());
    }

    #[test]
    fn test_snapshot_hides_credential() {
        let state = SessionState {
            credential: Some(Credential::from("a.b.c")),
            elevated: true,
            identity: Some(Identity::new("ada")),
            pending_verification: false,
        };
        let json = serde_json::to_string(&state.snapshot()).unwrap();
        assert!(!json.contains("a.b.c"));
        assert!(json.contains("\"phase\":\"authenticated\""));
        assert!(json.contains("\"displayKey\":\"ada\""));
        assert!(json.contains("\"pendingVerification\":false"));
    }
}
