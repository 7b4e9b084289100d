//! Single-flight renewal.
//!
//! The renewal artifact is single-use: two overlapping renewals would
//! invalidate each other. Every caller that asks for a renewal while one is
//! outstanding is handed the same shared future instead of starting another.
//!
//! The renewal itself runs on its own task, so callers that give up waiting
//! never cancel it, and the in-flight marker is released by a drop guard on
//! that task whichever way it ends.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::Credential;
use crate::error::RenewalError;

pub type RenewalOutcome = Result<Credential, RenewalError>;

/// Handle on a renewal; clone it freely, every clone resolves to the same outcome.
pub type RenewalFuture = Shared<BoxFuture<'static, RenewalOutcome>>;

struct InFlight {
    generation: u64,
    future: RenewalFuture,
}

type FlightSlot = Arc<Mutex<Option<InFlight>>>;

fn lock(slot: &FlightSlot) -> MutexGuard<'_, Option<InFlight>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-flight marker when the renewal task ends, even by panic or abort.
struct FlightGuard {
    slot: FlightSlot,
    generation: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if slot.as_ref().is_some_and(|f| f.generation == self.generation) {
            slot.take();
        }
    }
}

#[derive(Default)]
pub struct SingleFlightRefresher {
    slot: FlightSlot,
    started: AtomicU64,
}

impl SingleFlightRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the renewal in flight, or start one with `start`.
    ///
    /// `start` is only called when nothing is in flight. Whatever it settles
    /// (installing or clearing the session) happens before any waiter is
    /// resolved.
    pub fn run<F, Fut>(&self, start: F) -> RenewalFuture
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RenewalOutcome> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if let Some(in_flight) = slot.as_ref() {
            debug!(generation = in_flight.generation, "Joining in-flight renewal");
            return in_flight.future.clone();
        }

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available, renewal not started");
                return future::ready(Err(RenewalError::Aborted("no async runtime".into())))
                    .boxed()
                    .shared();
            }
        };

        // No guard may exist yet: if `start` panics, its drop would re-lock `slot`.
        let renewal = start();
        let generation = self.started.fetch_add(1, Ordering::Relaxed) + 1;
        let guard = FlightGuard {
            slot: Arc::clone(&self.slot),
            generation,
        };
        let task = runtime.spawn(async move {
            let _guard = guard;
            renewal.await
        });

        let shared = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(RenewalError::Aborted(join_err.to_string())),
            }
        }
        .boxed()
        .shared();

        debug!(generation, "Renewal started");
        *slot = Some(InFlight {
            generation,
            future: shared.clone(),
        });
        shared
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Number of renewals started over this refresher's lifetime.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}
