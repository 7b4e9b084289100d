//! Session and credential lifecycle.
//!
//! This module provides:
//! - `CredentialClock`: reads a credential's embedded expiry
//! - `RefreshScheduler`: one proactive renewal timer per session
//! - `SingleFlightRefresher`: at most one renewal in flight
//! - `SessionStore`: the single source of truth, persisted through a `SessionStorage`
//! - `SessionManager`: login, logout and renewal entry points over all of the above

pub mod clock;
pub mod credential;
pub mod manager;
pub mod refresher;
pub mod scheduler;
pub mod storage;
pub mod store;

pub use clock::{CredentialClock, Expiry, DEFAULT_SAFETY_MARGIN};
pub use credential::Credential;
pub use manager::{SessionManager, SessionOptions};
pub use refresher::{RenewalFuture, RenewalOutcome, SingleFlightRefresher};
pub use scheduler::{RefreshScheduler, RenewalHook};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, SessionStorage, Slot, StorageBackend};
pub use store::{Identity, SessionPhase, SessionSnapshot, SessionState, SessionStore};
