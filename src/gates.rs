//! Gate liveness monitoring.
//!
//! A gate is one client transport connection. The monitor keeps the
//! gate → subscriptions mapping, probes gates on an interval and reaps every
//! subscription of a gate that stops answering. Reaping goes through
//! [`SubscriptionRegistry::force_unsubscribe`], the same path as an explicit
//! unsubscribe, and is idempotent: unknown gates and already-removed
//! subscriptions are silently skipped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};
use serde::{Deserialize, Serialize};

use crate::error::{lock_poisoned, BrokerResult, ExecutionError, TransportError, ValidationError};
use crate::subscription::{GateId, SubscriptionId, SubscriptionRegistry};

/// Liveness probe exposed by each transport connection.
pub trait Gate: Send + Sync {
    /// Connection id.
    fn id(&self) -> &GateId;

    /// Returns false if the connection did not answer within `timeout`.
    fn ping(&self, timeout: Duration) -> bool;
}

/// Probe loop tuning.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateMonitorConfig {
    /// Interval between probe rounds.
    pub ping_interval_ms: u64,
    /// Deadline for a single probe.
    pub ping_timeout_ms: u64,
}

impl Default for GateMonitorConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5_000,
            ping_timeout_ms: 1_000,
        }
    }
}

#[derive(Default)]
struct GateEntry {
    /// `None` until a probe is registered with `add_gate`.
    probe: Option<Arc<dyn Gate>>,
    subscriptions: HashSet<SubscriptionId>,
}

#[derive(Default)]
struct GateTable {
    entries: HashMap<GateId, GateEntry>,
    /// Reaped gate ids. A subscribe that lands after its gate was reaped is
    /// refused instead of recreating an unprobed entry.
    reaped: HashSet<GateId>,
}

struct Pinger {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

/// Detects dead gates and reaps their subscriptions.
pub struct GateLivenessMonitor {
    cfg: GateMonitorConfig,
    registry: Arc<SubscriptionRegistry>,
    gates: Mutex<GateTable>,
    pinger: Mutex<Option<Pinger>>,
    reaped: AtomicU64,
}

impl std::fmt::Debug for GateLivenessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateLivenessMonitor")
            .field("cfg", &self.cfg)
            .field("gates", &self.gate_count())
            .field("reaped", &self.reaped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl GateLivenessMonitor {
    /// Creates a monitor reaping through `registry`. Probing starts with [`Self::start`].
    #[must_use]
    pub fn new(cfg: GateMonitorConfig, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            cfg,
            registry,
            gates: Mutex::new(GateTable::default()),
            pinger: Mutex::new(None),
            reaped: AtomicU64::new(0),
        }
    }

    /// Registers a probe-able gate. Re-adding replaces the probe and keeps the
    /// subscriptions already recorded for it. Adding a reaped id registers it
    /// afresh.
    pub fn add_gate(&self, gate: Arc<dyn Gate>) -> BrokerResult<()> {
        let id = gate.id().clone();
        if id.as_str().trim().is_empty() {
            return Err(ValidationError::InvalidGateId.into());
        }
        let mut gates = self.gates.lock().map_err(|_| lock_poisoned("gates"))?;
        gates.reaped.remove(&id);
        gates.entries.entry(id.clone()).or_default().probe = Some(gate);
        tracing::debug!(gate_id = %id, "gate added");
        Ok(())
    }

    /// Records a successful subscribe.
    ///
    /// Fails with [`TransportError::GateUnreachable`] if the gate was reaped;
    /// the caller must then drop the subscription.
    pub fn on_subscribe(&self, gate: &GateId, id: SubscriptionId) -> BrokerResult<()> {
        let mut gates = self.gates.lock().map_err(|_| lock_poisoned("gates"))?;
        if gates.reaped.contains(gate) {
            return Err(TransportError::GateUnreachable { gate: gate.clone() }.into());
        }
        gates.entries.entry(gate.clone()).or_default().subscriptions.insert(id);
        Ok(())
    }

    /// Records an explicit unsubscribe. Unknown ids are ignored.
    pub fn on_unsubscribe(&self, gate: &GateId, id: SubscriptionId) -> BrokerResult<()> {
        let mut gates = self.gates.lock().map_err(|_| lock_poisoned("gates"))?;
        if let Some(entry) = gates.entries.get_mut(gate) {
            entry.subscriptions.remove(&id);
        }
        Ok(())
    }

    /// Drops a gate and force-unsubscribes everything it owned.
    ///
    /// Returns how many subscriptions were actually removed; a gate that is
    /// already gone yields 0.
    pub fn remove_gate(&self, gate: &GateId) -> usize {
        self.reap(gate, "gate removed")
    }

    /// Transport-observed close; same cleanup as a failed probe.
    pub fn on_close(&self, gate: &GateId) -> usize {
        self.reap(gate, "gate closed")
    }

    fn reap(&self, gate: &GateId, reason: &str) -> usize {
        let entry = {
            let mut gates = match self.gates.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            gates.reaped.insert(gate.clone());
            gates.entries.remove(gate)
        };
        let Some(entry) = entry else {
            return 0;
        };

        let mut removed = 0;
        for id in entry.subscriptions {
            match self.registry.force_unsubscribe(id, reason) {
                Ok(_) => removed += 1,
                // Explicit unsubscribe won the race.
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(gate_id = %gate, subscription_id = %id, error = %e, "forced unsubscribe failed");
                }
            }
        }
        self.reaped.fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(gate_id = %gate, removed, reason, "gate reaped");
        removed
    }

    /// Probes every gate once and reaps the ones that fail.
    ///
    /// Probes run without holding the gate table lock. Returns the dead gates.
    pub fn ping_gates(&self) -> Vec<GateId> {
        let probes: Vec<(GateId, Arc<dyn Gate>)> = match self.gates.lock() {
            Ok(gates) => gates
                .entries
                .iter()
                .filter_map(|(id, e)| e.probe.as_ref().map(|p| (id.clone(), Arc::clone(p))))
                .collect(),
            Err(_) => return Vec::new(),
        };

        let timeout = Duration::from_millis(self.cfg.ping_timeout_ms.max(1));
        let mut dead = Vec::new();
        for (id, probe) in probes {
            if probe.ping(timeout) {
                continue;
            }
            let err = TransportError::GateUnreachable { gate: id.clone() };
            tracing::warn!(gate_id = %id, error = %err, "gate failed liveness probe");
            self.reap(&id, "gate unreachable");
            dead.push(id);
        }
        dead
    }

    /// Starts the background probe loop. A second call is a no-op.
    pub fn start(self: &Arc<Self>) -> BrokerResult<()> {
        let mut pinger = self.pinger.lock().map_err(|_| lock_poisoned("gates.pinger"))?;
        if pinger.is_some() {
            return Ok(());
        }

        let interval = Duration::from_millis(self.cfg.ping_interval_ms.max(1));
        let (stop, stop_rx) = bounded::<()>(1);
        let weak: Weak<Self> = Arc::downgrade(self);

        let join = thread::Builder::new()
            .name("pubsub-gates-ping".to_string())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    default(interval) => {
                        let Some(monitor) = weak.upgrade() else { break };
                        let dead = monitor.ping_gates();
                        if !dead.is_empty() {
                            tracing::debug!(dead = dead.len(), "probe round reaped gates");
                        }
                    }
                }
            })
            .map_err(|e| ExecutionError::WorkerSpawn { message: e.to_string() })?;

        *pinger = Some(Pinger { stop, join });
        Ok(())
    }

    /// Stops the probe loop and waits for an in-flight round to finish.
    pub fn stop(&self) {
        let pinger = match self.pinger.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(Pinger { stop, join }) = pinger {
            let _ = stop.try_send(());
            drop(stop);
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }

    /// Live gates, probe-able or not. Reaped ids are not counted.
    #[must_use]
    pub fn gate_count(&self) -> usize {
        self.gates.lock().map(|g| g.entries.len()).unwrap_or(0)
    }

    /// Subscriptions recorded for `gate`.
    #[must_use]
    pub fn subscriptions_of(&self, gate: &GateId) -> Vec<SubscriptionId> {
        self.gates
            .lock()
            .ok()
            .and_then(|g| g.entries.get(gate).map(|e| e.subscriptions.iter().copied().collect()))
            .unwrap_or_default()
    }

    /// Subscriptions removed by reaping so far.
    #[must_use]
    pub fn reaped_count(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }
}

impl Drop for GateLivenessMonitor {
    fn drop(&mut self) {
        // Signal only. The last Arc may be released on the probe thread itself.
        let pinger = match self.pinger.get_mut() {
            Ok(p) => p.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(Pinger { stop, join }) = pinger {
            let _ = stop.try_send(());
            drop(join);
        }
    }
}
