//! Lifecycle guard serializing configuration changes against call admission.
//!
//! The guard wraps a single [`Phase`] in a Tokio [`RwLock`]:
//!
//! - **Configuration transactions** ([`LifecycleGuard::begin`]) take the lock
//!   exclusively. No call is admitted while one is open.
//! - **Request permits** ([`LifecycleGuard::admit`]) take it shared. Any number
//!   of calls may hold a permit at once; a transaction waits for all of them.
//!
//! Tokio's `RwLock` queues waiters in FIFO order, so a transaction that is
//! waiting on in-flight calls blocks every permit requested after it. Calls
//! cannot starve configuration changes.
//!
//! Each committed transaction bumps [`Phase::generation`]. A call that records
//! the generation at admission therefore knows exactly which configuration it
//! ran against.

use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle state of the guarded server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PhaseState {
    /// Constructed, never started.
    #[default]
    Idle,
    /// A start transaction committed.
    Running,
    /// A stop transaction committed.
    Stopped,
}

/// Version token published by the guard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Phase {
    /// Number of committed configuration transactions.
    pub generation: u64,
    pub state: PhaseState,
}

/// Shared handle to the guard. Clones refer to the same lock.
#[derive(Clone, Debug, Default)]
pub struct LifecycleGuard {
    phase: Arc<RwLock<Phase>>,
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a configuration transaction, waiting for every outstanding
    /// [`RequestPermit`] to be released.
    pub async fn begin(&self) -> ConfigTransaction<'_> {
        let phase = self.phase.write().await;
        tracing::trace!(generation = phase.generation, "configuration transaction opened");
        ConfigTransaction { phase }
    }

    /// Admits one call, waiting for any open or queued configuration
    /// transaction to finish first.
    pub async fn admit(&self) -> RequestPermit<'_> {
        RequestPermit {
            phase: self.phase.read().await,
        }
    }

    /// Returns the current phase without waiting, or `None` while a
    /// transaction holds the lock.
    pub fn try_phase(&self) -> Option<Phase> {
        self.phase.try_read().ok().map(|phase| *phase)
    }
}

/// Exclusive hold on the guard.
///
/// Dropping the transaction without calling [`commit`](Self::commit) leaves
/// the phase untouched, so a failed start publishes nothing.
#[derive(Debug)]
pub struct ConfigTransaction<'a> {
    phase: RwLockWriteGuard<'a, Phase>,
}

impl ConfigTransaction<'_> {
    /// Phase as it was when the transaction opened.
    pub fn phase(&self) -> Phase {
        *self.phase
    }

    /// Publishes `state` under a new generation and releases the lock.
    pub fn commit(mut self, state: PhaseState) -> Phase {
        self.phase.generation += 1;
        self.phase.state = state;
        tracing::debug!(
            generation = self.phase.generation,
            state = ?state,
            "configuration transaction committed"
        );
        *self.phase
    }
}

/// Shared hold on the guard for the duration of one call.
#[derive(Debug)]
pub struct RequestPermit<'a> {
    phase: RwLockReadGuard<'a, Phase>,
}

impl RequestPermit<'_> {
    pub fn phase(&self) -> Phase {
        *self.phase
    }

    pub fn generation(&self) -> u64 {
        self.phase.generation
    }
}
