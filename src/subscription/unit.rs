//! Subscription processing unit.
//!
//! One unit per active subscription. It owns the subscription query, the last
//! evaluated result set and the sequence counter, and turns each update cycle
//! into at most one delta notification.
//!
//! ```text
//! CREATED --init()--> INITIALIZED --check()--> CHECKING --> WAITING --check()--> ...
//!    \                     \                       \            \
//!     +------------------- terminate() (any time, idempotent) ---+--> TERMINATED
//! ```
//!
//! After [`SubscriptionUnit::init`] the unit is moved onto its own worker
//! thread, so `last` and `sequence` are only ever touched by that thread. The
//! registry keeps a [`UnitHandle`] that shares nothing but the lifecycle flag
//! and the outlet.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::bindings::{diff, ResultSet};
use crate::endpoint::{GraphScope, SparqlEndpoint};
use crate::error::{lock_poisoned, BrokerResult, ExecutionError};

use super::barrier::{CheckOutcome, CompletionToken};
use super::types::{GateId, Notification, StreamEvent, SubscriptionId, Termination, UpdateContext};

/// Lifecycle state of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitState {
    /// Built, query not yet run.
    Created = 0,
    /// Snapshot taken, no check yet.
    Initialized = 1,
    /// Idle between checks.
    Waiting = 2,
    /// Re-evaluating for an update.
    Checking = 3,
    /// Closed; delivers nothing more.
    Terminated = 4,
}

impl UnitState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Initialized,
            2 => Self::Waiting,
            3 => Self::Checking,
            _ => Self::Terminated,
        }
    }
}

/// What a subscription evaluates and who owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    /// SPARQL SELECT text.
    pub query: String,
    /// Dataset the query runs against.
    pub scope: GraphScope,
    /// Owning transport connection.
    pub gate: GateId,
}

/// Outcome of pushing an event into the outlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Full,
    Closed,
}

/// State shared between a unit and its registry handle.
#[derive(Debug)]
pub(crate) struct UnitShared {
    state: AtomicU8,
    outlet: Mutex<Option<Sender<StreamEvent>>>,
}

impl UnitShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(UnitState::Created as u8),
            outlet: Mutex::new(None),
        }
    }

    fn state(&self) -> UnitState {
        UnitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from -> to` unless the unit was terminated meanwhile.
    fn transition(&self, from: UnitState, to: UnitState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_terminated(&self) -> bool {
        self.state() == UnitState::Terminated
    }

    /// Pushes under the outlet lock so nothing slips past a concurrent terminate.
    ///
    /// The last slot of a bounded stream is reserved for the close marker.
    fn deliver(&self, notification: Notification) -> BrokerResult<Delivery> {
        let guard = self.outlet.lock().map_err(|_| lock_poisoned("unit.outlet"))?;
        if self.is_terminated() {
            return Ok(Delivery::Closed);
        }
        let Some(tx) = guard.as_ref() else {
            return Ok(Delivery::Closed);
        };
        let limit = tx.capacity().map_or(usize::MAX, |c| c.saturating_sub(1));
        if tx.len() >= limit {
            return Ok(Delivery::Full);
        }
        Ok(match tx.try_send(StreamEvent::Notification(notification)) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Disconnected(_)) => Delivery::Closed,
        })
    }

    /// Returns true only for the call that actually terminated the unit.
    fn terminate(&self, reason: Termination) -> bool {
        let previous = self.state.swap(UnitState::Terminated as u8, Ordering::AcqRel);
        if previous == UnitState::Terminated as u8 {
            return false;
        }
        // A poisoned outlet still has to be closed.
        let mut guard = match self.outlet.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = guard.take() {
            let _ = tx.try_send(StreamEvent::Closed(reason));
        }
        true
    }
}

/// Per-subscription incremental evaluator.
#[derive(Debug)]
pub struct SubscriptionUnit {
    id: SubscriptionId,
    spec: SubscriptionSpec,
    last: ResultSet,
    last_fingerprint: blake3::Hash,
    sequence: u64,
    shared: Arc<UnitShared>,
}

impl SubscriptionUnit {
    /// A unit in the `Created` state.
    #[must_use]
    pub fn new(id: SubscriptionId, spec: SubscriptionSpec) -> Self {
        let last = ResultSet::default();
        let last_fingerprint = last.fingerprint();
        Self {
            id,
            spec,
            last,
            last_fingerprint,
            sequence: 0,
            shared: Arc::new(UnitShared::new()),
        }
    }

    /// Subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Query, scope and owning gate.
    #[must_use]
    pub fn spec(&self) -> &SubscriptionSpec {
        &self.spec
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> UnitState {
        self.shared.state()
    }

    /// Sequence number of the last delivered notification.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Result set from the last successful evaluation.
    #[must_use]
    pub fn last_results(&self) -> &ResultSet {
        &self.last
    }

    /// Connects the unit to its outward stream.
    pub(crate) fn attach(&self, tx: Sender<StreamEvent>) -> BrokerResult<()> {
        let mut guard = self.shared.outlet.lock().map_err(|_| lock_poisoned("unit.outlet"))?;
        *guard = Some(tx);
        Ok(())
    }

    pub(crate) fn shared(&self) -> Arc<UnitShared> {
        Arc::clone(&self.shared)
    }

    fn evaluate(&self, endpoint: &dyn SparqlEndpoint, timeout: Duration) -> Result<ResultSet, ExecutionError> {
        let started = Instant::now();
        let results = endpoint
            .execute_query(&self.spec.query, &self.spec.scope, timeout)
            .map_err(crate::endpoint::EndpointError::into_query_error)?;
        if started.elapsed() > timeout {
            return Err(ExecutionError::timeout(timeout));
        }
        Ok(results)
    }

    /// Runs the query once and returns the sequence-0 snapshot.
    ///
    /// On failure the unit stays `Created` and must not be registered.
    pub fn init(&mut self, endpoint: &dyn SparqlEndpoint, timeout: Duration) -> BrokerResult<Notification> {
        if self.state() != UnitState::Created {
            return Err(crate::error::BrokerError::internal(format!(
                "unit {} initialized twice",
                self.id
            )));
        }

        let results = self.evaluate(endpoint, timeout).map_err(|e| {
            tracing::debug!(subscription_id = %self.id, error = %e, "unit init failed");
            e
        })?;

        self.last_fingerprint = results.fingerprint();
        self.last = results;
        self.sequence = 0;
        // A terminate racing with init wins; the caller sees Terminated on register.
        let _ = self.shared.transition(UnitState::Created, UnitState::Initialized);

        tracing::debug!(subscription_id = %self.id, tuples = self.last.len(), "unit initialized");
        Ok(Notification::snapshot(self.id, self.last.clone()))
    }

    /// Re-evaluates the query for one update cycle.
    ///
    /// Never panics on endpoint failure: errors become [`CheckOutcome::Failed`]
    /// and the previous result set is kept.
    pub fn check(&mut self, endpoint: &dyn SparqlEndpoint, ctx: &UpdateContext, timeout: Duration) -> CheckOutcome {
        let entered = self.shared.transition(UnitState::Waiting, UnitState::Checking)
            || self.shared.transition(UnitState::Initialized, UnitState::Checking);
        if !entered {
            // Terminated (or never initialized): nothing may be delivered.
            return CheckOutcome::Discarded;
        }

        let outcome = self.check_inner(endpoint, ctx, timeout);

        if !self.shared.transition(UnitState::Checking, UnitState::Waiting) {
            // Terminated while the query was in flight.
            return match outcome {
                CheckOutcome::Failed(e) => CheckOutcome::Failed(e),
                CheckOutcome::Evicted { reason } => CheckOutcome::Evicted { reason },
                _ => CheckOutcome::Discarded,
            };
        }
        outcome
    }

    fn check_inner(&mut self, endpoint: &dyn SparqlEndpoint, ctx: &UpdateContext, timeout: Duration) -> CheckOutcome {
        let current = match self.evaluate(endpoint, timeout) {
            Ok(rs) => rs,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %self.id,
                    update = ctx.update_id,
                    error = %e,
                    "subscription check failed"
                );
                return CheckOutcome::Failed(e);
            }
        };

        let fingerprint = current.fingerprint();
        if fingerprint == self.last_fingerprint {
            self.last = current;
            return CheckOutcome::NoChange;
        }

        let delta = diff(&self.last, &current);
        self.last = current;
        self.last_fingerprint = fingerprint;

        if delta.is_empty() {
            return CheckOutcome::NoChange;
        }

        let sequence = self.sequence + 1;
        let notification = Notification::delta(self.id, sequence, delta);
        let undeliverable = match self.shared.deliver(notification.clone()) {
            Ok(Delivery::Sent) => None,
            Ok(Delivery::Closed) => return CheckOutcome::Discarded,
            Ok(Delivery::Full) => Some("slow consumer".to_string()),
            Err(e) => Some(format!("notification delivery failed: {e}")),
        };
        // A gap in the sequence would desync the subscriber; close instead.
        if let Some(reason) = undeliverable {
            tracing::warn!(subscription_id = %self.id, sequence, %reason, "delta undeliverable, closing subscription");
            self.shared.terminate(Termination::Forced { reason: reason.clone() });
            return CheckOutcome::Evicted { reason };
        }
        self.sequence = sequence;

        tracing::debug!(
            subscription_id = %self.id,
            update = ctx.update_id,
            sequence,
            added = notification.added().len(),
            removed = notification.removed().map_or(0, ResultSet::len),
            "delta produced"
        );
        CheckOutcome::Notified { notification }
    }

    /// Stops delivery. Safe to call concurrently with `check` and repeatedly.
    pub fn terminate(&self) -> bool {
        self.shared.terminate(Termination::Unsubscribed)
    }
}

/// Message to a unit worker.
pub(crate) enum UnitCommand {
    Check {
        ctx: Arc<UpdateContext>,
        timeout: Duration,
        token: CompletionToken,
    },
}

/// Registry-side handle to a unit running on its worker thread.
#[derive(Debug)]
pub(crate) struct UnitHandle {
    pub(crate) id: SubscriptionId,
    pub(crate) gate: GateId,
    shared: Arc<UnitShared>,
    tx: Sender<UnitCommand>,
    exited: Receiver<()>,
}

impl std::fmt::Debug for UnitCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Check { ctx, timeout, .. } => f
                .debug_struct("Check")
                .field("update_id", &ctx.update_id)
                .field("timeout", timeout)
                .finish_non_exhaustive(),
        }
    }
}

impl UnitHandle {
    /// Moves an initialized unit onto its own worker thread.
    pub(crate) fn spawn(unit: SubscriptionUnit, endpoint: Arc<dyn SparqlEndpoint>) -> BrokerResult<Self> {
        let id = unit.id;
        let gate = unit.spec.gate.clone();
        let shared = unit.shared();
        let (tx, rx) = crossbeam_channel::unbounded::<UnitCommand>();
        let (exit_tx, exited) = bounded::<()>(1);

        let simple = id.to_string();
        let short = simple.get(4..12).unwrap_or(&simple);
        let _join: JoinHandle<()> = thread::Builder::new()
            .name(format!("pubsub-unit-{short}"))
            .spawn(move || worker_loop(unit, endpoint, rx, exit_tx))
            .map_err(|e| ExecutionError::WorkerSpawn { message: e.to_string() })?;

        Ok(Self {
            id,
            gate,
            shared,
            tx,
            exited,
        })
    }

    /// Queues a check. A dead worker makes the token report `Abandoned`.
    pub(crate) fn dispatch(&self, ctx: Arc<UpdateContext>, timeout: Duration, token: CompletionToken) {
        if let Err(err) = self.tx.send(UnitCommand::Check { ctx, timeout, token }) {
            tracing::debug!(subscription_id = %self.id, "unit worker gone; check abandoned");
            drop(err.into_inner());
        }
    }

    pub(crate) fn terminate(&self, reason: Termination) -> bool {
        self.shared.terminate(reason)
    }

    /// Closes the command queue and returns a waiter for worker exit.
    pub(crate) fn close(self) -> WorkerExit {
        let Self { exited, .. } = self;
        WorkerExit { exited }
    }
}

/// Waits for a closed unit's worker to finish its in-flight check.
#[derive(Debug)]
pub struct WorkerExit {
    exited: Receiver<()>,
}

impl WorkerExit {
    /// Returns true if the worker exited within `timeout`.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.exited.recv_timeout(timeout),
            Ok(()) | Err(RecvTimeoutError::Disconnected)
        )
    }
}

fn worker_loop(
    mut unit: SubscriptionUnit,
    endpoint: Arc<dyn SparqlEndpoint>,
    rx: Receiver<UnitCommand>,
    exit_tx: Sender<()>,
) {
    // Drains queued checks after the handle is dropped so every token reports.
    while let Ok(cmd) = rx.recv() {
        match cmd {
            UnitCommand::Check { ctx, timeout, token } => {
                let outcome = unit.check(endpoint.as_ref(), &ctx, timeout);
                token.complete(outcome);
            }
        }
    }
    unit.shared.terminate(Termination::Forced {
        reason: "unit worker stopped".to_string(),
    });
    tracing::debug!(subscription_id = %unit.id, sequence = unit.sequence, "unit worker exited");
    drop(exit_tx);
}
