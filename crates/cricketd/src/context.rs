//! Cancellation and deadline propagation.
//!
//! A [`RunContext`] pairs a [`CancellationToken`] with an optional
//! deadline. Effects run under a deadline context; every request they
//! enqueue carries a clone, so work that outlives its effect is dropped
//! at dispatch time instead of hitting the wire.
//!
//! Time comes from `tokio::time::Instant` everywhere in this crate, so
//! timing-sensitive tests can run under tokio's paused clock.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A cancellable scope with an optional deadline.
///
/// Clones share the same token: cancelling any clone cancels them all.
/// The deadline is checked lazily — nothing fires at the deadline, but
/// `is_cancelled` turns true and `cancelled()` resolves once it passes.
#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunContext {
    /// A context that never expires on its own.
    pub fn background() -> Self {
        RunContext {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        RunContext {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Explicitly cancel this context (and every clone of it).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Time left until the deadline, if there is one. Zero once passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}
