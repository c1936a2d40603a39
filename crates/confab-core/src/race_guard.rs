//! Cancellable optimistic setup
//!
//! A user action (dismissing an overlay, cancelling) can land while an async
//! setup it implicitly depends on is still running. [`RaceGuard`] hands each
//! setup a [`PendingTicket`]; the cancelling action calls
//! [`RaceGuard::cancel`], which either arms the ticket's sentinel (setup still
//! running, so the setup undoes itself when it settles) or tells the caller to
//! act directly (nothing running).
//!
//! ```text
//!   begin ──▶ [pending] ──settle──▶ Keep
//!                 │
//!               cancel ──▶ [armed] ──settle──▶ Undo
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::coordinator::ChannelActivator;
use crate::error::Result;

/// What `cancel` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A setup is in flight; it will undo itself when it settles
    Deferred,
    /// Nothing in flight; the caller undoes any effect itself
    Immediate,
}

/// What a settling setup must do with its effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Keep,
    Undo,
}

#[derive(Default)]
struct GuardState {
    generation: u64,
    pending: Option<u64>,
    /// Generation whose setup was cancelled while pending
    armed: Option<u64>,
    token: Option<CancellationToken>,
}

/// Sentinel for one kind of async operation. Cheap to clone.
#[derive(Clone, Default)]
pub struct RaceGuard {
    state: Arc<Mutex<GuardState>>,
}

impl RaceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a setup. A newer ticket supersedes any older pending one.
    pub fn begin(&self) -> PendingTicket {
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        state.pending = Some(generation);
        let token = CancellationToken::new();
        state.token = Some(token.clone());
        PendingTicket {
            state: Arc::clone(&self.state),
            generation,
            token,
            settled: false,
        }
    }

    /// The cancelling action. Synchronous.
    pub fn cancel(&self) -> CancelOutcome {
        let mut state = self.state.lock();
        match state.pending.take() {
            Some(generation) => {
                state.armed = Some(generation);
                if let Some(token) = state.token.take() {
                    token.cancel();
                }
                debug!(generation, "Cancelled pending setup");
                CancelOutcome::Deferred
            }
            None => CancelOutcome::Immediate,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }
}

/// Handle carried by one async setup
#[must_use = "a ticket must be settled once the setup resolves"]
pub struct PendingTicket {
    state: Arc<Mutex<GuardState>>,
    generation: u64,
    token: CancellationToken,
    settled: bool,
}

impl PendingTicket {
    /// Token cancelled when the guard is cancelled, for setups that can bail early
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve the setup. Checked synchronously at the resumption point.
    ///
    /// `Undo` only when this setup was cancelled and no newer setup has
    /// started since; a newer setup carries the user's latest intent.
    pub fn settle(mut self) -> Settlement {
        self.settled = true;
        let mut state = self.state.lock();
        if state.armed == Some(self.generation) {
            state.armed = None;
            if state.pending.is_some() {
                return Settlement::Keep;
            }
            return Settlement::Undo;
        }
        if state.pending == Some(self.generation) {
            state.pending = None;
            state.token = None;
        }
        Settlement::Keep
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Setup abandoned (error or dropped future): nothing to undo
        let mut state = self.state.lock();
        if state.pending == Some(self.generation) {
            state.pending = None;
            state.token = None;
        }
        if state.armed == Some(self.generation) {
            state.armed = None;
        }
    }
}

/// Pre-activation of a default agent's channel behind a dismissable overlay
pub struct OverlayPreactivation {
    activator: Arc<dyn ChannelActivator>,
    guard: RaceGuard,
    /// Channel this overlay created and still owns
    owned: Mutex<Option<String>>,
}

impl OverlayPreactivation {
    pub fn new(activator: Arc<dyn ChannelActivator>) -> Self {
        Self {
            activator,
            guard: RaceGuard::new(),
            owned: Mutex::new(None),
        }
    }

    /// Open the overlay and pre-activate the channel.
    ///
    /// Returns `false` if the overlay was dismissed before activation
    /// resolved, in which case any channel it created is gone again and a
    /// channel that already existed is left as it was.
    pub async fn open(&self, session_id: &str, topic_id: &str, agent_id: &str) -> Result<bool> {
        let ticket = self.guard.begin();
        let created = self
            .activator
            .preactivate_channel(session_id, topic_id, agent_id, ticket.token())
            .await?;

        match ticket.settle() {
            Settlement::Keep => {
                if created {
                    *self.owned.lock() = Some(topic_id.to_string());
                }
                Ok(true)
            }
            Settlement::Undo => {
                debug!(topic_id, "Overlay dismissed during pre-activation, releasing channel");
                if created {
                    self.activator.release_channel(topic_id);
                }
                Ok(false)
            }
        }
    }

    /// Dismiss the overlay
    pub fn dismiss(&self) -> CancelOutcome {
        let outcome = self.guard.cancel();
        if outcome == CancelOutcome::Immediate {
            if let Some(topic_id) = self.owned.lock().take() {
                self.activator.release_channel(&topic_id);
            }
        }
        outcome
    }

    /// Hand the channel over to the UI so dismissing no longer releases it
    pub fn commit(&self) -> Option<String> {
        self.owned.lock().take()
    }

    pub fn is_pending(&self) -> bool {
        self.guard.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_without_setup_is_immediate() {
        let guard = RaceGuard::new();
        assert_eq!(guard.cancel(), CancelOutcome::Immediate);
    }

    #[test]
    fn test_cancel_during_setup_defers_and_undoes() {
        let guard = RaceGuard::new();
        let ticket = guard.begin();
        assert!(guard.is_pending());

        assert_eq!(guard.cancel(), CancelOutcome::Deferred);
        assert!(ticket.is_cancelled());
        assert!(!guard.is_pending());
        assert_eq!(ticket.settle(), Settlement::Undo);

        // Sentinel cleared
        let next = guard.begin();
        assert_eq!(next.settle(), Settlement::Keep);
    }

    #[test]
    fn test_cancel_after_settle_is_immediate() {
        let guard = RaceGuard::new();
        let ticket = guard.begin();
        assert_eq!(ticket.settle(), Settlement::Keep);
        assert_eq!(guard.cancel(), CancelOutcome::Immediate);
    }

    #[test]
    fn test_newer_setup_wins_over_cancelled_one() {
        let guard = RaceGuard::new();
        let first = guard.begin();
        assert_eq!(guard.cancel(), CancelOutcome::Deferred);
        let second = guard.begin();

        assert_eq!(first.settle(), Settlement::Keep);
        assert_eq!(second.settle(), Settlement::Keep);
        assert!(!guard.is_pending());
    }

    #[test]
    fn test_dropped_ticket_clears_pending() {
        let guard = RaceGuard::new();
        let ticket = guard.begin();
        drop(ticket);
        assert!(!guard.is_pending());
        assert_eq!(guard.cancel(), CancelOutcome::Immediate);
    }
}
