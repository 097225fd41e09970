//! In-memory endpoint.
//!
//! A thread-safe quad dataset whose query and update texts are bound to Rust
//! handlers instead of a SPARQL parser. It is intended for embedded usage,
//! tests, and as a reference implementation of [`SparqlEndpoint`].
//!
//! Failures and latency can be injected per query text to exercise the
//! engine's isolation and timeout paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use crate::bindings::{ResultSet, ResultTuple};
use crate::endpoint::traits::{EndpointError, GraphScope, Quad, SparqlEndpoint, UpdateOutcome};
use crate::term::RdfTerm;

fn lock_err(context: &'static str) -> EndpointError {
    EndpointError::Unavailable(format!("poisoned lock: {context}"))
}

/// Quads held by a [`MemoryEndpoint`].
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    quads: BTreeSet<Quad>,
}

impl Dataset {
    /// Number of stored quads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.quads.len()
    }

    /// True if no quad is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quads.is_empty()
    }

    /// True if `quad` is stored.
    #[must_use]
    pub fn contains(&self, quad: &Quad) -> bool {
        self.quads.contains(quad)
    }

    /// Quads visible in `scope` matching the given pattern (`None` = wildcard).
    pub fn matching<'a>(
        &'a self,
        scope: &'a GraphScope,
        subject: Option<&'a RdfTerm>,
        predicate: Option<&'a RdfTerm>,
        object: Option<&'a RdfTerm>,
    ) -> impl Iterator<Item = &'a Quad> + 'a {
        self.quads.iter().filter(move |q| {
            scope.includes(q.graph.as_ref())
                && subject.map_or(true, |s| *s == q.subject)
                && predicate.map_or(true, |p| *p == q.predicate)
                && object.map_or(true, |o| *o == q.object)
        })
    }

    /// `SELECT ?subject_var ?object_var WHERE { ?s <predicate> ?o }` over `scope`.
    #[must_use]
    pub fn select_pairs(&self, scope: &GraphScope, predicate: &RdfTerm, subject_var: &str, object_var: &str) -> ResultSet {
        ResultSet::from_tuples(
            [subject_var, object_var],
            self.matching(scope, None, Some(predicate), None).map(|q| {
                ResultTuple::new()
                    .with(subject_var, q.subject.clone())
                    .with(object_var, q.object.clone())
            }),
        )
    }

    /// `SELECT ?object_var WHERE { ?s <predicate> ?o }` over `scope`.
    #[must_use]
    pub fn select_objects(&self, scope: &GraphScope, predicate: &RdfTerm, object_var: &str) -> ResultSet {
        ResultSet::from_tuples(
            [object_var],
            self.matching(scope, None, Some(predicate), None)
                .map(|q| ResultTuple::new().with(object_var, q.object.clone())),
        )
    }
}

/// Changes an update handler asks for. Deletions apply before insertions.
#[derive(Debug, Clone, Default)]
pub struct UpdatePatch {
    /// Quads to delete.
    pub delete: Vec<Quad>,
    /// Quads to insert.
    pub insert: Vec<Quad>,
}

impl UpdatePatch {
    /// `INSERT DATA` equivalent.
    #[must_use]
    pub fn insert(quads: Vec<Quad>) -> Self {
        Self {
            delete: Vec::new(),
            insert: quads,
        }
    }

    /// `DELETE DATA` equivalent.
    #[must_use]
    pub fn delete(quads: Vec<Quad>) -> Self {
        Self {
            delete: quads,
            insert: Vec::new(),
        }
    }
}

type QueryHandler = dyn Fn(&Dataset, &GraphScope) -> ResultSet + Send + Sync;
type UpdateHandler = dyn Fn(&Dataset, &GraphScope) -> UpdatePatch + Send + Sync;

#[derive(Default)]
struct Handlers {
    queries: HashMap<String, Arc<QueryHandler>>,
    updates: HashMap<String, Arc<UpdateHandler>>,
}

#[derive(Debug, Default)]
struct Faults {
    failing: HashMap<String, String>,
    latency: HashMap<String, Duration>,
}

/// Programmable in-memory SPARQL endpoint.
#[derive(Default)]
pub struct MemoryEndpoint {
    dataset: RwLock<Dataset>,
    handlers: RwLock<Handlers>,
    faults: RwLock<Faults>,
    query_calls: RwLock<HashMap<String, Arc<AtomicU64>>>,
    updates_applied: AtomicU64,
}

impl std::fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEndpoint")
            .field("updates_applied", &self.updates_applied.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemoryEndpoint {
    /// An empty endpoint with no registered texts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a query text to a handler evaluated against the dataset.
    pub fn register_query<F>(&self, sparql: impl Into<String>, handler: F) -> Result<(), EndpointError>
    where
        F: Fn(&Dataset, &GraphScope) -> ResultSet + Send + Sync + 'static,
    {
        let mut guard = self.handlers.write().map_err(|_| lock_err("handlers.write"))?;
        guard.queries.insert(sparql.into(), Arc::new(handler));
        Ok(())
    }

    /// Binds an update text to a handler producing the patch to apply.
    pub fn register_update<F>(&self, sparql: impl Into<String>, handler: F) -> Result<(), EndpointError>
    where
        F: Fn(&Dataset, &GraphScope) -> UpdatePatch + Send + Sync + 'static,
    {
        let mut guard = self.handlers.write().map_err(|_| lock_err("handlers.write"))?;
        guard.updates.insert(sparql.into(), Arc::new(handler));
        Ok(())
    }

    /// Makes every execution of `sparql` fail with `message` until cleared.
    pub fn fail_query(&self, sparql: impl Into<String>, message: impl Into<String>) -> Result<(), EndpointError> {
        let mut guard = self.faults.write().map_err(|_| lock_err("faults.write"))?;
        guard.failing.insert(sparql.into(), message.into());
        Ok(())
    }

    /// Removes an injected failure.
    pub fn clear_failure(&self, sparql: &str) -> Result<(), EndpointError> {
        let mut guard = self.faults.write().map_err(|_| lock_err("faults.write"))?;
        guard.failing.remove(sparql);
        Ok(())
    }

    /// Delays every execution of `sparql` by `latency`.
    pub fn set_latency(&self, sparql: impl Into<String>, latency: Duration) -> Result<(), EndpointError> {
        let mut guard = self.faults.write().map_err(|_| lock_err("faults.write"))?;
        guard.latency.insert(sparql.into(), latency);
        Ok(())
    }

    /// Applies a patch directly, bypassing update handlers.
    pub fn apply(&self, patch: UpdatePatch) -> Result<UpdateOutcome, EndpointError> {
        let mut guard = self.dataset.write().map_err(|_| lock_err("dataset.write"))?;
        let outcome = apply_patch(&mut *guard, patch);
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }

    /// Snapshot of the current dataset.
    pub fn dataset(&self) -> Result<Dataset, EndpointError> {
        Ok(self.dataset.read().map_err(|_| lock_err("dataset.read"))?.clone())
    }

    /// How many times `sparql` has been evaluated (including failed attempts).
    #[must_use]
    pub fn query_count(&self, sparql: &str) -> u64 {
        self.query_calls
            .read()
            .ok()
            .and_then(|m| m.get(sparql).map(|c| c.load(Ordering::Acquire)))
            .unwrap_or(0)
    }

    /// Updates applied so far, including `apply`.
    #[must_use]
    pub fn updates_applied(&self) -> u64 {
        self.updates_applied.load(Ordering::Relaxed)
    }

    fn count_query(&self, sparql: &str) -> Result<(), EndpointError> {
        if let Some(counter) = self.query_calls.read().map_err(|_| lock_err("query_calls.read"))?.get(sparql) {
            counter.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }
        let mut guard = self.query_calls.write().map_err(|_| lock_err("query_calls.write"))?;
        guard
            .entry(sparql.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn simulate_faults(&self, sparql: &str, timeout: Duration) -> Result<(), EndpointError> {
        let (failure, latency) = {
            let guard = self.faults.read().map_err(|_| lock_err("faults.read"))?;
            (guard.failing.get(sparql).cloned(), guard.latency.get(sparql).copied())
        };

        if let Some(latency) = latency {
            if latency > timeout {
                thread::sleep(timeout);
                return Err(EndpointError::Timeout(timeout));
            }
            thread::sleep(latency);
        }

        match failure {
            Some(message) => Err(EndpointError::Rejected(message)),
            None => Ok(()),
        }
    }
}

fn apply_patch(dataset: &mut Dataset, patch: UpdatePatch) -> UpdateOutcome {
    let mut outcome = UpdateOutcome::default();
    for quad in patch.delete {
        if dataset.quads.remove(&quad) {
            outcome.removed.push(quad);
        }
    }
    for quad in patch.insert {
        if dataset.quads.insert(quad.clone()) {
            // Re-inserting a quad deleted by the same patch is not a change.
            if let Some(pos) = outcome.removed.iter().position(|q| *q == quad) {
                outcome.removed.swap_remove(pos);
            } else {
                outcome.added.push(quad);
            }
        }
    }
    outcome
}

impl SparqlEndpoint for MemoryEndpoint {
    fn execute_query(&self, sparql: &str, scope: &GraphScope, timeout: Duration) -> Result<ResultSet, EndpointError> {
        self.count_query(sparql)?;
        self.simulate_faults(sparql, timeout)?;

        let handler = {
            let guard = self.handlers.read().map_err(|_| lock_err("handlers.read"))?;
            guard.queries.get(sparql).cloned()
        };
        let Some(handler) = handler else {
            return Err(EndpointError::Rejected(format!("unknown query: {sparql}")));
        };

        let dataset = self.dataset.read().map_err(|_| lock_err("dataset.read"))?;
        Ok(handler(&*dataset, scope))
    }

    fn execute_update(&self, sparql: &str, scope: &GraphScope, timeout: Duration) -> Result<UpdateOutcome, EndpointError> {
        self.simulate_faults(sparql, timeout)?;

        let handler = {
            let guard = self.handlers.read().map_err(|_| lock_err("handlers.read"))?;
            guard.updates.get(sparql).cloned()
        };
        let Some(handler) = handler else {
            return Err(EndpointError::Rejected(format!("unknown update: {sparql}")));
        };

        let mut dataset = self.dataset.write().map_err(|_| lock_err("dataset.write"))?;
        let patch = handler(&*dataset, scope);
        let outcome = apply_patch(&mut *dataset, patch);
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn p() -> RdfTerm {
        RdfTerm::iri("http://ex/p")
    }

    fn triple(o: i64) -> Quad {
        Quad::triple(RdfTerm::iri("http://ex/s"), p(), RdfTerm::from(o))
    }

    #[test]
    fn registered_query_reads_dataset() {
        let ep = MemoryEndpoint::new();
        ep.register_query("Q", |ds, scope| ds.select_objects(scope, &p(), "o")).unwrap();
        ep.apply(UpdatePatch::insert(vec![triple(1), triple(2)])).unwrap();

        let rs = ep.execute_query("Q", &GraphScope::all(), TIMEOUT).unwrap();
        assert_eq!(rs.len(), 2);
        assert_eq!(ep.query_count("Q"), 1);
    }

    #[test]
    fn unknown_query_is_rejected() {
        let ep = MemoryEndpoint::new();
        let err = ep.execute_query("nope", &GraphScope::all(), TIMEOUT).unwrap_err();
        assert!(matches!(err, EndpointError::Rejected(_)));
    }

    #[test]
    fn update_reports_effective_changes_only() {
        let ep = MemoryEndpoint::new();
        ep.apply(UpdatePatch::insert(vec![triple(1)])).unwrap();
        ep.register_update("U", |_, _| UpdatePatch {
            delete: vec![triple(1), triple(9)],
            insert: vec![triple(1), triple(2)],
        })
        .unwrap();

        let outcome = ep.execute_update("U", &GraphScope::all(), TIMEOUT).unwrap();
        assert_eq!(outcome.added, vec![triple(2)]);
        assert!(outcome.removed.is_empty());
        assert_eq!(ep.dataset().unwrap().len(), 2);
    }

    #[test]
    fn injected_failure_and_latency() {
        let ep = MemoryEndpoint::new();
        ep.register_query("Q", |_, _| ResultSet::new(["x"])).unwrap();

        ep.fail_query("Q", "boom").unwrap();
        assert!(matches!(
            ep.execute_query("Q", &GraphScope::all(), TIMEOUT),
            Err(EndpointError::Rejected(m)) if m == "boom"
        ));
        ep.clear_failure("Q").unwrap();

        ep.set_latency("Q", Duration::from_millis(200)).unwrap();
        let started = std::time::Instant::now();
        let err = ep
            .execute_query("Q", &GraphScope::all(), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, EndpointError::Timeout(_)));
        // Gives up at the deadline, not after the full latency.
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(ep.query_count("Q"), 2);
    }

    #[test]
    fn scope_restricts_visible_graphs() {
        let ep = MemoryEndpoint::new();
        ep.register_query("Q", |ds, scope| ds.select_objects(scope, &p(), "o")).unwrap();
        ep.apply(UpdatePatch::insert(vec![
            triple(1).in_graph("http://ex/g1"),
            triple(2).in_graph("http://ex/g2"),
        ]))
        .unwrap();

        let scoped = GraphScope::default_graphs(["http://ex/g1"]);
        let rs = ep.execute_query("Q", &scoped, TIMEOUT).unwrap();
        assert_eq!(rs.len(), 1);
    }
}
