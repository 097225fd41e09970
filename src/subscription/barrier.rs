//! Counting completion barrier for one update cycle.
//!
//! Every dispatched check carries a [`CompletionToken`]. A token reports
//! exactly once: explicitly through [`CompletionToken::complete`], or as
//! [`CheckOutcome::Abandoned`] when it is dropped unreported (worker gone,
//! command never delivered, panic). The barrier therefore drains even when
//! units fail or disappear mid-cycle.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::ExecutionError;

use super::types::{Notification, SubscriptionId};

/// Result of one unit check.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// Result set unchanged; nothing sent.
    NoChange,
    /// Non-empty delta produced and pushed to the subscription stream.
    Notified {
        /// The delivered notification.
        notification: Notification,
    },
    /// The delta could not be delivered. The unit closed its stream and
    /// must be removed from the registry.
    Evicted {
        /// Why the unit gave up.
        reason: String,
    },
    /// Unit terminated before or during the check; result discarded.
    Discarded,
    /// Query execution failed; prior result set kept.
    Failed(ExecutionError),
    /// The check never reported.
    Abandoned,
}

/// Completion report for one check.
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Checked subscription.
    pub subscription_id: SubscriptionId,
    /// What happened.
    pub outcome: CheckOutcome,
}

/// One-shot completion handle for a dispatched check.
#[derive(Debug)]
pub struct CompletionToken {
    subscription_id: SubscriptionId,
    tx: Option<Sender<CheckReport>>,
}

impl CompletionToken {
    /// Reports the check result.
    pub fn complete(mut self, outcome: CheckOutcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(CheckReport {
                subscription_id: self.subscription_id,
                outcome,
            });
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(CheckReport {
                subscription_id: self.subscription_id,
                outcome: CheckOutcome::Abandoned,
            });
        }
    }
}

/// Barrier counting outstanding tokens.
#[derive(Debug)]
pub(crate) struct CompletionBarrier {
    tx: Sender<CheckReport>,
    rx: Receiver<CheckReport>,
    expected: usize,
}

impl CompletionBarrier {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx, expected: 0 }
    }

    /// Issues a token; the barrier now waits for one more report.
    pub(crate) fn token(&mut self, subscription_id: SubscriptionId) -> CompletionToken {
        self.expected += 1;
        CompletionToken {
            subscription_id,
            tx: Some(self.tx.clone()),
        }
    }

    pub(crate) fn expected(&self) -> usize {
        self.expected
    }

    /// Blocks until every issued token has reported.
    pub(crate) fn wait(self) -> Vec<CheckReport> {
        let Self { tx, rx, expected } = self;
        // Only tokens keep the channel open from here on.
        drop(tx);

        let mut reports = Vec::with_capacity(expected);
        while reports.len() < expected {
            match rx.recv() {
                Ok(report) => reports.push(report),
                // Unreachable while tokens report on drop; never hang regardless.
                Err(_) => break,
            }
        }
        reports
    }
}
