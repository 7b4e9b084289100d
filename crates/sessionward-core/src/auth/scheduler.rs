//! Proactive renewal timer.
//!
//! At most one timer is live per scheduler. Arming replaces whatever was
//! pending; a fired timer removes itself before invoking its callback, so the
//! callback is free to arm the next timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Credential, CredentialClock, Expiry};
use crate::error::RenewalError;

/// Callback invoked when a renewal falls due.
pub type RenewalHook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), RenewalError>> + Send + Sync>;

struct ScheduledRenewal {
    generation: u64,
    due_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

type TimerSlot = Arc<Mutex<Option<ScheduledRenewal>>>;

fn lock(slot: &TimerSlot) -> MutexGuard<'_, Option<ScheduledRenewal>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RefreshScheduler {
    clock: CredentialClock,
    slot: TimerSlot,
    generation: AtomicU64,
}

impl RefreshScheduler {
    pub fn new(clock: CredentialClock) -> Self {
        Self {
            clock,
            slot: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn clock(&self) -> &CredentialClock {
        &self.clock
    }

    /// Schedule `on_due` to run `safety_margin` before `credential` expires.
    ///
    /// Any previously armed timer is cancelled, even when the new credential
    /// has no readable expiry. Returns the due time if a timer was armed.
    /// Must be called from within a Tokio runtime for a timer to be armed.
    pub fn arm(&self, credential: &Credential, on_due: RenewalHook) -> Option<DateTime<Utc>> {
        let expiry = match self.clock.expiry_of(credential) {
            Expiry::Decoded(at) => at,
            Expiry::NoExpiry => {
                debug!("Credential has no expiry claim, relying on reactive renewal");
                self.disarm();
                return None;
            }
            Expiry::Undecodable(err) => {
                debug!(error = %err, "Credential expiry undecodable, relying on reactive renewal");
                self.disarm();
                return None;
            }
        };

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available, proactive renewal not armed");
                self.disarm();
                return None;
            }
        };

        let now = Utc::now();
        let due_in = self.clock.renew_in(expiry, now);
        let due_at = now + chrono::Duration::from_std(due_in).unwrap_or(chrono::Duration::zero());

        let mut slot = lock(&self.slot);
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timer_slot = Arc::clone(&self.slot);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(due_in).await;

            {
                let mut slot = lock(&timer_slot);
                if !slot.as_ref().is_some_and(|pending| pending.generation == generation) {
                    return;
                }
                slot.take();
            }

            debug!("Proactive renewal due");
            if let Err(err) = on_due().await {
                error!(error = %err, "Proactive renewal failed");
            }
        });

        debug!(%due_at, %expiry, due_in_secs = due_in.as_secs(), "Renewal timer armed");
        *slot = Some(ScheduledRenewal {
            generation,
            due_at,
            handle,
        });

        Some(due_at)
    }

    /// Cancel the pending timer, if any. Idempotent.
    pub fn disarm(&self) {
        if let Some(pending) = lock(&self.slot).take() {
            pending.handle.abort();
            debug!(due_at = %pending.due_at, "Renewal timer disarmed");
        }
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.slot).as_ref().map(|pending| pending.due_at)
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.slot).is_some()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}
