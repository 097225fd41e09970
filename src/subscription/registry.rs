//! Subscription registry.
//!
//! Owns every live unit, fans each update out to all of them and blocks on a
//! [`CompletionBarrier`] until every check has reported.
//!
//! Locking:
//! - `cycle` serializes propagation. `propagate_update` holds it for writing
//!   for the whole cycle; `subscribe` holds it for reading across `init` and
//!   registration, so a new unit either sees an update fully (snapshot taken
//!   after the store change) or is checked for it, never half of each.
//! - `units` guards the active set. Fan-out only holds the read lock while
//!   queueing checks; the barrier is awaited with no registry lock held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};

use crate::endpoint::{GraphScope, SparqlEndpoint, UpdateOutcome};
use crate::error::{lock_poisoned, BrokerResult, ExecutionError, ValidationError};

use super::barrier::{CheckOutcome, CompletionBarrier};
use super::stream::NotificationStream;
use super::types::{GateId, Notification, StreamEvent, SubscriptionId, Termination, UpdateContext};
use super::unit::{SubscriptionSpec, SubscriptionUnit, UnitHandle, WorkerExit};

/// Registry tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Notifications a stream holds before its subscription is closed as a
    /// slow consumer. One more slot is kept for the close marker.
    pub stream_capacity: usize,
    /// Query timeout applied to each unit check.
    pub default_check_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 1024,
            default_check_timeout_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.default_check_timeout_ms.max(1))
    }
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Registered subscriptions.
    pub active: usize,
    /// Completed propagation cycles.
    pub updates_processed: u64,
    /// Unit checks dispatched across all cycles.
    pub checks_run: u64,
    /// Checks that reported a query failure.
    pub check_failures: u64,
    /// Snapshots and deltas delivered.
    pub notifications: u64,
    /// Deltas that found a full stream and closed their subscription.
    pub dropped_notifications: u64,
    /// Duration of the latest cycle.
    pub last_update_ms: u64,
    /// Longest cycle so far.
    pub max_update_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    updates_processed: AtomicU64,
    checks_run: AtomicU64,
    check_failures: AtomicU64,
    notifications: AtomicU64,
    dropped_notifications: AtomicU64,
    last_update_ms: AtomicU64,
    max_update_ms: AtomicU64,
}

/// Result of a successful subscribe.
#[derive(Debug)]
pub struct Subscribed {
    /// Fresh subscription id.
    pub subscription_id: SubscriptionId,
    /// Sequence-0 snapshot, also queued as the first stream event.
    pub snapshot: Notification,
    /// Snapshot followed by deltas, ending with a close marker.
    pub stream: NotificationStream,
}

/// Acknowledgement of an unsubscribe.
#[derive(Debug)]
pub struct Unsubscribed {
    /// Removed subscription.
    pub subscription_id: SubscriptionId,
    /// Gate that owned it.
    pub gate: GateId,
    /// Waits for the unit's worker to finish any in-flight check.
    pub exit: WorkerExit,
}

/// Outcome of one propagation cycle.
#[derive(Debug, Clone, Default)]
pub struct PropagationReport {
    /// Cycle number.
    pub update_id: u64,
    /// Units checked (the barrier size).
    pub checked: usize,
    /// Non-empty deltas, in no particular inter-subscription order.
    pub notifications: Vec<Notification>,
    /// Isolated per-unit failures.
    pub failures: Vec<(SubscriptionId, ExecutionError)>,
    /// Checks whose unit was terminated mid-cycle.
    pub discarded: usize,
    /// Subscriptions closed because their delta could not be delivered,
    /// with the owning gate.
    pub evicted: Vec<(SubscriptionId, GateId)>,
    /// Wall time from fan-out to barrier drained.
    pub elapsed: Duration,
}

/// Owner of all live subscription units.
pub struct SubscriptionRegistry {
    cfg: RegistryConfig,
    endpoint: Arc<dyn SparqlEndpoint>,
    units: RwLock<HashMap<SubscriptionId, UnitHandle>>,
    cycle: RwLock<u64>,
    counters: Counters,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("cfg", &self.cfg)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Creates an empty registry evaluating against `endpoint`.
    #[must_use]
    pub fn new(cfg: RegistryConfig, endpoint: Arc<dyn SparqlEndpoint>) -> Self {
        Self {
            cfg,
            endpoint,
            units: RwLock::new(HashMap::new()),
            cycle: RwLock::new(0),
            counters: Counters::default(),
        }
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.cfg
    }

    /// Runs the query once and registers a unit for it.
    ///
    /// Nothing is registered when validation or the initial query fails.
    pub fn subscribe(
        &self,
        query: &str,
        scope: GraphScope,
        gate: GateId,
        timeout: Duration,
    ) -> BrokerResult<Subscribed> {
        if query.trim().is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        if gate.as_str().trim().is_empty() {
            return Err(ValidationError::InvalidGateId.into());
        }
        scope.validate()?;

        let subscription_id = SubscriptionId::new();
        let mut unit = SubscriptionUnit::new(
            subscription_id,
            SubscriptionSpec {
                query: query.to_string(),
                scope,
                gate: gate.clone(),
            },
        );

        // One extra slot so the close marker always fits.
        let capacity = self.cfg.stream_capacity.max(1) + 1;
        let (tx, rx) = bounded::<StreamEvent>(capacity);
        let stream = NotificationStream::new(subscription_id, rx);

        // Excludes propagation between the snapshot query and registration.
        let _cycle = self.cycle.read().map_err(|_| lock_poisoned("registry.cycle"))?;

        let snapshot = unit.init(self.endpoint.as_ref(), timeout)?;
        if tx.try_send(StreamEvent::Notification(snapshot.clone())).is_err() {
            self.counters.dropped_notifications.fetch_add(1, Ordering::Relaxed);
        }
        unit.attach(tx)?;

        let handle = UnitHandle::spawn(unit, Arc::clone(&self.endpoint))?;
        {
            let mut units = self.units.write().map_err(|_| lock_poisoned("registry.units"))?;
            units.insert(subscription_id, handle);
        }
        self.counters.notifications.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            subscription_id = %subscription_id,
            gate_id = %gate,
            tuples = snapshot.added().len(),
            "subscription registered"
        );

        Ok(Subscribed {
            subscription_id,
            snapshot,
            stream,
        })
    }

    /// Terminates and removes a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> BrokerResult<Unsubscribed> {
        self.remove(id, Termination::Unsubscribed)
    }

    /// Removes a subscription on behalf of the engine (dead gate, shutdown).
    pub fn force_unsubscribe(&self, id: SubscriptionId, reason: impl Into<String>) -> BrokerResult<Unsubscribed> {
        self.remove(id, Termination::Forced { reason: reason.into() })
    }

    fn remove(&self, id: SubscriptionId, reason: Termination) -> BrokerResult<Unsubscribed> {
        let handle = {
            let mut units = self.units.write().map_err(|_| lock_poisoned("registry.units"))?;
            let handle = units
                .remove(&id)
                .ok_or(ExecutionError::SubscriptionNotFound { id })?;
            // Under the write lock: a concurrent fan-out either queued its check
            // already (it will be discarded) or will not see this unit.
            handle.terminate(reason.clone());
            handle
        };

        tracing::debug!(subscription_id = %id, gate_id = %handle.gate, ?reason, "subscription removed");

        let gate = handle.gate.clone();
        Ok(Unsubscribed {
            subscription_id: id,
            gate,
            exit: handle.close(),
        })
    }

    /// Re-checks every active unit against an applied update.
    ///
    /// Returns once all checks have reported. Calls are serialized.
    pub fn propagate_update(&self, outcome: UpdateOutcome) -> BrokerResult<PropagationReport> {
        let mut cycle = self.cycle.write().map_err(|_| lock_poisoned("registry.cycle"))?;
        *cycle += 1;
        let update_id = *cycle;
        let started = Instant::now();

        let ctx = Arc::new(UpdateContext {
            update_id,
            outcome: Arc::new(outcome),
            started_at: Utc::now(),
        });
        let timeout = self.cfg.check_timeout();

        let mut barrier = CompletionBarrier::new();
        {
            let units = self.units.read().map_err(|_| lock_poisoned("registry.units"))?;
            for handle in units.values() {
                let token = barrier.token(handle.id);
                handle.dispatch(Arc::clone(&ctx), timeout, token);
            }
        }
        let checked = barrier.expected();
        tracing::debug!(update = update_id, checked, "update fanned out");

        let reports = barrier.wait();

        let mut report = PropagationReport {
            update_id,
            checked,
            ..PropagationReport::default()
        };
        let mut dropped = 0_u64;
        for r in reports {
            match r.outcome {
                CheckOutcome::NoChange => {}
                CheckOutcome::Notified { notification } => report.notifications.push(notification),
                CheckOutcome::Evicted { reason } => {
                    dropped += 1;
                    // The unit already closed its stream; this only unregisters it.
                    match self.remove(r.subscription_id, Termination::Forced { reason }) {
                        Ok(ack) => report.evicted.push((ack.subscription_id, ack.gate)),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            tracing::warn!(subscription_id = %r.subscription_id, error = %e, "evicted unit not unregistered");
                        }
                    }
                }
                CheckOutcome::Discarded | CheckOutcome::Abandoned => report.discarded += 1,
                CheckOutcome::Failed(e) => report.failures.push((r.subscription_id, e)),
            }
        }
        report.elapsed = started.elapsed();
        drop(cycle);

        let elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX);
        let c = &self.counters;
        c.updates_processed.fetch_add(1, Ordering::Relaxed);
        c.checks_run.fetch_add(checked as u64, Ordering::Relaxed);
        c.check_failures
            .fetch_add(report.failures.len() as u64, Ordering::Relaxed);
        c.notifications
            .fetch_add(report.notifications.len() as u64, Ordering::Relaxed);
        c.dropped_notifications.fetch_add(dropped, Ordering::Relaxed);
        c.last_update_ms.store(elapsed_ms, Ordering::Relaxed);
        c.max_update_ms.fetch_max(elapsed_ms, Ordering::Relaxed);

        if !report.failures.is_empty() {
            tracing::warn!(
                update = update_id,
                failures = report.failures.len(),
                "subscription checks failed during update"
            );
        }
        tracing::debug!(
            update = update_id,
            checked,
            notifications = report.notifications.len(),
            discarded = report.discarded,
            evicted = report.evicted.len(),
            elapsed_ms,
            "barrier drained"
        );

        Ok(report)
    }

    /// Number of registered units.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.units.read().map(|u| u.len()).unwrap_or(0)
    }

    /// Returns true if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.units.read().map(|u| u.contains_key(&id)).unwrap_or(false)
    }

    /// Ids of the subscriptions owned by `gate`.
    #[must_use]
    pub fn subscriptions_of(&self, gate: &GateId) -> Vec<SubscriptionId> {
        self.units
            .read()
            .map(|u| u.values().filter(|h| &h.gate == gate).map(|h| h.id).collect())
            .unwrap_or_default()
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let c = &self.counters;
        RegistryStats {
            active: self.active_count(),
            updates_processed: c.updates_processed.load(Ordering::Relaxed),
            checks_run: c.checks_run.load(Ordering::Relaxed),
            check_failures: c.check_failures.load(Ordering::Relaxed),
            notifications: c.notifications.load(Ordering::Relaxed),
            dropped_notifications: c.dropped_notifications.load(Ordering::Relaxed),
            last_update_ms: c.last_update_ms.load(Ordering::Relaxed),
            max_update_ms: c.max_update_ms.load(Ordering::Relaxed),
        }
    }

    /// Force-removes every subscription. Returns how many were removed.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<UnitHandle> = match self.units.write() {
            Ok(mut units) => units.drain().map(|(_, h)| h).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, h)| h).collect(),
        };
        let n = drained.len();
        for handle in drained {
            handle.terminate(Termination::Forced {
                reason: "registry shut down".to_string(),
            });
        }
        if n > 0 {
            tracing::debug!(removed = n, "registry shut down");
        }
        n
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        // Workers exit once their command queues close; do not join here.
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bindings::{ResultSet, ResultTuple};
    use crate::endpoint::{MemoryEndpoint, Quad, UpdatePatch};
    use crate::term::RdfTerm;

    const Q: &str = "SELECT ?x WHERE { ?s <http://ex/p> ?x }";
    const TIMEOUT: Duration = Duration::from_secs(1);

    fn p() -> RdfTerm {
        RdfTerm::iri("http://ex/p")
    }

    fn quad(v: i64) -> Quad {
        Quad::triple(RdfTerm::iri("http://ex/s"), p(), RdfTerm::from(v))
    }

    fn setup() -> (Arc<MemoryEndpoint>, SubscriptionRegistry) {
        setup_with(RegistryConfig::default())
    }

    fn setup_with(cfg: RegistryConfig) -> (Arc<MemoryEndpoint>, SubscriptionRegistry) {
        let ep = Arc::new(MemoryEndpoint::new());
        ep.register_query(Q, |ds, scope| ds.select_objects(scope, &p(), "x")).unwrap();
        let registry = SubscriptionRegistry::new(cfg, ep.clone());
        (ep, registry)
    }

    fn small_streams() -> RegistryConfig {
        RegistryConfig {
            stream_capacity: 2,
            ..RegistryConfig::default()
        }
    }

    fn sequences(stream: &NotificationStream) -> (Vec<u64>, Option<Termination>) {
        let mut seqs = Vec::new();
        while let Some(event) = stream.try_recv().unwrap() {
            match event {
                StreamEvent::Notification(n) => seqs.push(n.sequence),
                StreamEvent::Closed(reason) => return (seqs, Some(reason)),
            }
        }
        (seqs, None)
    }

    fn apply(ep: &MemoryEndpoint, patch: UpdatePatch) -> UpdateOutcome {
        ep.apply(patch).unwrap()
    }

    #[test]
    fn subscribe_returns_snapshot_and_streams_it_first() {
        let (ep, registry) = setup();
        apply(&ep, UpdatePatch::insert(vec![quad(1)]));

        let sub = registry
            .subscribe(Q, GraphScope::all(), GateId::from("g"), TIMEOUT)
            .unwrap();
        assert_eq!(sub.snapshot.sequence, 0);
        assert!(sub.snapshot.added().contains(&ResultTuple::new().with("x", 1)));

        match sub.stream.try_recv().unwrap() {
            Some(StreamEvent::Notification(n)) => assert_eq!(n, sub.snapshot),
            other => panic!("unexpected first event: {other:?}"),
        }
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn subscribe_validates_before_touching_the_store() {
        let (ep, registry) = setup();

        let err = registry
            .subscribe("   ", GraphScope::all(), GateId::from("g"), TIMEOUT)
            .unwrap_err();
        assert!(err.is_validation());

        let err = registry
            .subscribe(Q, GraphScope::all(), GateId::from(""), TIMEOUT)
            .unwrap_err();
        assert!(err.is_validation());

        let err = registry
            .subscribe(Q, GraphScope::default_graphs(["not an iri"]), GateId::from("g"), TIMEOUT)
            .unwrap_err();
        assert!(err.is_validation());

        assert_eq!(ep.query_count(Q), 0);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn failed_init_registers_nothing() {
        let (ep, registry) = setup();
        ep.fail_query(Q, "boom").unwrap();

        let err = registry
            .subscribe(Q, GraphScope::all(), GateId::from("g"), TIMEOUT)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::BrokerError::Execution(ExecutionError::QueryExecution { .. })
        ));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn propagate_reports_deltas_and_counts() {
        let (ep, registry) = setup();
        let sub = registry
            .subscribe(Q, GraphScope::all(), GateId::from("g"), TIMEOUT)
            .unwrap();

        let outcome = apply(&ep, UpdatePatch::insert(vec![quad(4)]));
        let report = registry.propagate_update(outcome).unwrap();
        assert_eq!(report.update_id, 1);
        assert_eq!(report.checked, 1);
        assert_eq!(report.notifications.len(), 1);
        assert_eq!(report.notifications[0].subscription_id, sub.subscription_id);
        assert_eq!(
            report.notifications[0].added(),
            &ResultSet::from_tuples(["x"], [ResultTuple::new().with("x", 4)])
        );

        let report = registry.propagate_update(UpdateOutcome::default()).unwrap();
        assert_eq!(report.update_id, 2);
        assert!(report.notifications.is_empty());

        let stats = registry.stats();
        assert_eq!(stats.updates_processed, 2);
        assert_eq!(stats.checks_run, 2);
        assert_eq!(stats.notifications, 2);
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn unsubscribe_closes_stream_and_second_call_is_not_found() {
        let (_ep, registry) = setup();
        let sub = registry
            .subscribe(Q, GraphScope::all(), GateId::from("g"), TIMEOUT)
            .unwrap();

        let ack = registry.unsubscribe(sub.subscription_id).unwrap();
        assert_eq!(ack.gate, GateId::from("g"));
        assert!(ack.exit.wait(TIMEOUT));

        let _snapshot = sub.stream.recv().unwrap();
        assert_eq!(
            sub.stream.recv().unwrap(),
            StreamEvent::Closed(Termination::Unsubscribed)
        );

        let err = registry.unsubscribe(sub.subscription_id).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn empty_registry_propagates_trivially() {
        let (_ep, registry) = setup();
        let report = registry.propagate_update(UpdateOutcome::default()).unwrap();
        assert_eq!(report.checked, 0);
        assert!(report.notifications.is_empty());
    }

    #[test]
    fn subscriptions_of_filters_by_gate() {
        let (_ep, registry) = setup();
        let a = registry
            .subscribe(Q, GraphScope::all(), GateId::from("a"), TIMEOUT)
            .unwrap();
        let _b = registry
            .subscribe(Q, GraphScope::all(), GateId::from("b"), TIMEOUT)
            .unwrap();
        assert_eq!(registry.subscriptions_of(&GateId::from("a")), vec![a.subscription_id]);
    }

    #[test]
    fn shutdown_forces_every_stream_closed() {
        let (_ep, registry) = setup();
        let sub = registry
            .subscribe(Q, GraphScope::all(), GateId::from("g"), TIMEOUT)
            .unwrap();
        assert_eq!(registry.shutdown(), 1);

        let _snapshot = sub.stream.recv().unwrap();
        assert!(matches!(
            sub.stream.recv().unwrap(),
            StreamEvent::Closed(Termination::Forced { .. })
        ));
    }

    #[test]
    fn slow_consumer_is_closed_instead_of_skipping_sequences() {
        let (ep, registry) = setup_with(small_streams());
        let gate = GateId::from("g");
        let sub = registry.subscribe(Q, GraphScope::all(), gate.clone(), TIMEOUT).unwrap();

        // Snapshot plus one delta fill both notification slots.
        let report = registry
            .propagate_update(apply(&ep, UpdatePatch::insert(vec![quad(1)])))
            .unwrap();
        assert_eq!(report.notifications.len(), 1);

        let report = registry
            .propagate_update(apply(&ep, UpdatePatch::insert(vec![quad(2)])))
            .unwrap();
        assert!(report.notifications.is_empty());
        assert_eq!(report.evicted, vec![(sub.subscription_id, gate)]);
        assert!(!registry.contains(sub.subscription_id));

        for v in 3..=4 {
            let report = registry
                .propagate_update(apply(&ep, UpdatePatch::insert(vec![quad(v)])))
                .unwrap();
            assert_eq!(report.checked, 0);
        }

        let (seqs, closed) = sequences(&sub.stream);
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(
            closed,
            Some(Termination::Forced {
                reason: "slow consumer".to_string()
            })
        );

        let stats = registry.stats();
        assert_eq!(stats.dropped_notifications, 1);
        assert_eq!(stats.active, 0);
        assert!(registry.unsubscribe(sub.subscription_id).unwrap_err().is_not_found());
    }

    #[test]
    fn unsubscribe_behind_a_full_stream_still_ends_with_the_ack() {
        let (ep, registry) = setup_with(small_streams());
        let sub = registry
            .subscribe(Q, GraphScope::all(), GateId::from("g"), TIMEOUT)
            .unwrap();
        registry
            .propagate_update(apply(&ep, UpdatePatch::insert(vec![quad(1)])))
            .unwrap();

        registry.unsubscribe(sub.subscription_id).unwrap();
        let (seqs, closed) = sequences(&sub.stream);
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(closed, Some(Termination::Unsubscribed));
    }
}
