//! Broker facade.
//!
//! Wires a [`SparqlEndpoint`] to the [`SubscriptionRegistry`] and the
//! [`GateLivenessMonitor`]. [`Broker::update`] is the write path: it executes
//! the update and propagates it while holding the update lock, so the store
//! never applies update N+1 while the deltas of update N are being computed.

mod config;

pub use config::BrokerConfig;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bindings::ResultSet;
use crate::endpoint::{EndpointError, GraphScope, SparqlEndpoint};
use crate::error::{lock_poisoned, BrokerResult, ValidationError};
use crate::gates::{Gate, GateLivenessMonitor};
use crate::subscription::{
    GateId, PropagationReport, RegistryStats, Subscribed, SubscriptionId, SubscriptionRegistry,
};

/// Subscription broker over one SPARQL endpoint.
pub struct Broker {
    cfg: BrokerConfig,
    endpoint: Arc<dyn SparqlEndpoint>,
    registry: Arc<SubscriptionRegistry>,
    gates: Arc<GateLivenessMonitor>,
    update_lock: Mutex<()>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("cfg", &self.cfg)
            .field("registry", &self.registry)
            .field("gates", &self.gates)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Creates a broker. The gate probe loop is not started; see [`Broker::start`].
    pub fn new(cfg: BrokerConfig, endpoint: Arc<dyn SparqlEndpoint>) -> BrokerResult<Self> {
        cfg.validate()?;
        let registry = Arc::new(SubscriptionRegistry::new(cfg.registry.clone(), Arc::clone(&endpoint)));
        let gates = Arc::new(GateLivenessMonitor::new(cfg.gates.clone(), Arc::clone(&registry)));
        Ok(Self {
            cfg,
            endpoint,
            registry,
            gates,
            update_lock: Mutex::new(()),
        })
    }

    /// Starts periodic gate probing.
    pub fn start(&self) -> BrokerResult<()> {
        self.gates.start()
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.cfg
    }

    /// Subscription registry driven by this broker.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Gate liveness monitor.
    #[must_use]
    pub fn gates(&self) -> &Arc<GateLivenessMonitor> {
        &self.gates
    }

    /// Registers a subscription owned by `gate`.
    ///
    /// `timeout` bounds the initial query. Fails with
    /// [`TransportError::GateUnreachable`](crate::error::TransportError::GateUnreachable)
    /// if the gate was reaped while the subscription was being set up; nothing
    /// stays registered in that case.
    pub fn subscribe(
        &self,
        query: &str,
        scope: GraphScope,
        gate: GateId,
        timeout: Duration,
    ) -> BrokerResult<Subscribed> {
        let subscribed = self.registry.subscribe(query, scope, gate.clone(), timeout)?;
        if let Err(e) = self.gates.on_subscribe(&gate, subscribed.subscription_id) {
            let id = subscribed.subscription_id;
            if let Err(cleanup) = self.registry.force_unsubscribe(id, "gate reaped during subscribe") {
                tracing::debug!(subscription_id = %id, error = %cleanup, "orphan already removed");
            }
            tracing::debug!(subscription_id = %id, gate_id = %gate, error = %e, "subscribe refused");
            return Err(e);
        }
        Ok(subscribed)
    }

    /// Removes a subscription and waits up to `timeout` for its in-flight check.
    ///
    /// The subscription is gone once this returns `Ok`, even if its worker is
    /// still finishing a query.
    pub fn unsubscribe(&self, id: SubscriptionId, timeout: Duration) -> BrokerResult<()> {
        let ack = self.registry.unsubscribe(id)?;
        self.gates.on_unsubscribe(&ack.gate, id)?;
        if !ack.exit.wait(timeout) {
            tracing::debug!(subscription_id = %id, "unit still finishing an in-flight check");
        }
        Ok(())
    }

    /// Executes an update and propagates it to every subscription.
    pub fn update(&self, sparql: &str, scope: GraphScope) -> BrokerResult<PropagationReport> {
        if sparql.trim().is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        scope.validate()?;

        let _serial = self.update_lock.lock().map_err(|_| lock_poisoned("broker.update_lock"))?;
        let outcome = self
            .endpoint
            .execute_update(sparql, &scope, self.cfg.update_timeout())
            .map_err(EndpointError::into_update_error)?;
        tracing::debug!(
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "update applied"
        );
        let report = self.registry.propagate_update(outcome)?;
        for (id, gate) in &report.evicted {
            self.gates.on_unsubscribe(gate, *id)?;
        }
        Ok(report)
    }

    /// One-off query; no subscription is created.
    pub fn query(&self, sparql: &str, scope: &GraphScope) -> BrokerResult<ResultSet> {
        if sparql.trim().is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        scope.validate()?;
        let results = self
            .endpoint
            .execute_query(sparql, scope, self.cfg.query_timeout())
            .map_err(EndpointError::into_query_error)?;
        Ok(results)
    }

    /// Registers a probe-able gate.
    pub fn add_gate(&self, gate: Arc<dyn Gate>) -> BrokerResult<()> {
        self.gates.add_gate(gate)
    }

    /// Drops a gate and its subscriptions. Returns how many were removed.
    pub fn remove_gate(&self, gate: &GateId) -> usize {
        self.gates.remove_gate(gate)
    }

    /// Transport saw the connection close.
    pub fn close_gate(&self, gate: &GateId) -> usize {
        self.gates.on_close(gate)
    }

    /// Registry counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Stops probing and force-closes every subscription.
    pub fn shutdown(&self) -> usize {
        self.gates.stop();
        self.registry.shutdown()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
