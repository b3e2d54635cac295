//! Refresh coordination gate
//!
//! One primitive combining exclusive acquisition, a level-triggered
//! "not refreshing" signal, and priority-based queue jumping. Ordinary
//! requests `wait()` until no refresh is in flight; the request that
//! discovers a stale credential checks `may_drive()` and, if it clears
//! the bar, acquires the gate and drives the refresh itself instead of
//! waiting for someone else to.
//!
//! The release rule is load-bearing: the idle signal is only set when no
//! other acquirer is queued, so a waiter can never slip through a false
//! idle window between back-to-back refreshes.
//!
//! `fail()` is terminal. Every queued and future `wait()`/`acquire()`
//! resolves immediately with [`GateFailed`]; the gate never un-fails.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard, watch};

/// The owning session is unusable; the blocked operation must cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session gate failed, operation cancelled")]
pub struct GateFailed;

#[derive(Debug, Clone, Copy)]
struct GateState {
    refreshing: bool,
    failed: bool,
}

/// See the module docs.
pub struct PriorityGate {
    lock: Mutex<()>,
    /// Acquirers currently queued on `lock`.
    pending: AtomicUsize,
    priority: AtomicI32,
    state: watch::Sender<GateState>,
}

impl Default for PriorityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState {
            refreshing: false,
            failed: false,
        });
        Self {
            lock: Mutex::new(()),
            pending: AtomicUsize::new(0),
            priority: AtomicI32::new(0),
            state,
        }
    }

    /// Acquire exclusively, clearing the idle signal and raising the
    /// gate priority past the holder's so same-priority followers wait
    /// instead of piling onto the refresh.
    pub async fn acquire(&self, priority: i32) -> Result<GateGuard<'_>, GateFailed> {
        if self.failed() {
            return Err(GateFailed);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        let acquired = tokio::select! {
            permit = self.lock.lock() => Ok(permit),
            _ = self.failed_signal() => Err(GateFailed),
        };
        self.pending.fetch_sub(1, Ordering::SeqCst);

        let permit = acquired?;
        if self.failed() {
            return Err(GateFailed);
        }

        self.priority.fetch_max(priority + 2, Ordering::SeqCst);
        self.state.send_modify(|s| s.refreshing = true);
        Ok(GateGuard {
            gate: self,
            _permit: permit,
        })
    }

    /// Block until no refresh is in flight, without acquiring.
    /// Level-triggered: returns immediately when the gate is idle.
    pub async fn wait(&self) -> Result<(), GateFailed> {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| s.failed || !s.refreshing).await {
            Ok(state) if state.failed => Err(GateFailed),
            Ok(_) => Ok(()),
            Err(_) => Err(GateFailed),
        }
    }

    /// Whether a request at `priority` may skip waiting and drive the
    /// refresh itself.
    pub fn may_drive(&self, priority: i32) -> bool {
        !self.failed() && priority >= self.priority.load(Ordering::SeqCst) - 1
    }

    /// Mark the gate permanently failed and wake everyone.
    pub fn fail(&self) {
        self.state.send_modify(|s| s.failed = true);
    }

    pub fn failed(&self) -> bool {
        self.state.borrow().failed
    }

    /// Whether a refresh currently holds the gate.
    pub fn is_refreshing(&self) -> bool {
        self.state.borrow().refreshing
    }

    async fn failed_signal(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.failed).await;
    }
}

/// Exclusive hold on the gate. Releasing (dropping) sets the idle
/// signal only when no other acquirer is queued.
pub struct GateGuard<'a> {
    gate: &'a PriorityGate,
    _permit: MutexGuard<'a, ()>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        // Signal idle before the mutex is released: a queued acquirer
        // would otherwise win the lock first and have its fresh
        // `refreshing` flag clobbered by this release.
        if self.gate.pending.load(Ordering::SeqCst) == 0 {
            self.gate.priority.store(0, Ordering::SeqCst);
            self.gate.state.send_modify(|s| s.refreshing = false);
        }
    }
}
