//! # Completion Signal
//!
//! One-shot primitive that bridges an observer's reply back to the task that
//! issued the request. The producer side (`signal` / `cancel`) is synchronous
//! and never blocks, so it can be called from the reply listener loop. The
//! consumer side (`wait`) suspends with a bound.
//!
//! The first settlement wins. Every later attempt, including a reply arriving
//! after the waiter timed out, is a no-op that returns `false`.

use std::{sync::OnceLock, time::Duration};

use tokio::sync::Notify;
use tracing::trace;

use crate::event::event_bus::ReplyOutcome;

/// Why a request was settled without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CancelReason {
    /// The caller cancelled the in-flight request.
    Caller,
    /// A newer request for the same key replaced this one.
    Superseded,
    /// The broker is shutting down.
    Shutdown,
}

/// Result of [`CompletionSignal::wait`].
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed(ReplyOutcome),
    Cancelled(CancelReason),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
enum Settlement {
    Replied(ReplyOutcome),
    Cancelled(CancelReason),
    Expired,
}

impl From<&Settlement> for WaitOutcome {
    fn from(settlement: &Settlement) -> Self {
        match settlement {
            Settlement::Replied(outcome) => WaitOutcome::Completed(outcome.clone()),
            Settlement::Cancelled(reason) => WaitOutcome::Cancelled(*reason),
            Settlement::Expired => WaitOutcome::TimedOut,
        }
    }
}

#[derive(Debug, Default)]
pub struct CompletionSignal {
    slot: OnceLock<Settlement>,
    notify: Notify,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the outcome and wakes the waiter. Returns `true` only for the
    /// call that settled the signal.
    pub fn signal(&self, outcome: ReplyOutcome) -> bool {
        self.settle(Settlement::Replied(outcome))
    }

    /// Settles the signal without a reply.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.settle(Settlement::Cancelled(reason))
    }

    pub fn is_settled(&self) -> bool {
        self.slot.get().is_some()
    }

    /// The settled outcome, if any.
    pub fn outcome(&self) -> Option<WaitOutcome> {
        self.slot.get().map(WaitOutcome::from)
    }

    /// Waits until the signal is settled or `timeout` elapses.
    ///
    /// On expiry the signal is closed, so a reply racing the deadline is
    /// either observed here (it settled first) or dropped by `signal`.
    pub async fn wait(&self, timeout: Duration) -> WaitOutcome {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }

        // notify_one leaves a permit when nobody is waiting yet, so a settle
        // between the check above and this await is not lost.
        if tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_err()
        {
            trace!(?timeout, "completion wait expired");
            let _ = self.slot.set(Settlement::Expired);
        }

        self.outcome().unwrap_or(WaitOutcome::TimedOut)
    }

    fn settle(&self, settlement: Settlement) -> bool {
        match self.slot.set(settlement) {
            Ok(()) => {
                self.notify.notify_one();
                true
            }
            Err(rejected) => {
                trace!(?rejected, "completion already settled, ignoring");
                false
            }
        }
    }
}
