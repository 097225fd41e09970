//! Contract the engine consumes from the SPARQL store.
//!
//! The engine never looks inside the store: it needs a query call returning a
//! [`ResultSet`] and an update call reporting success or failure. Any backend
//! (HTTP SPARQL 1.1 endpoint, embedded store, test double) fits behind
//! [`SparqlEndpoint`].

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bindings::ResultSet;
use crate::error::{ExecutionError, ValidationError};
use crate::term::RdfTerm;

/// Errors reported by an endpoint implementation.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The store rejected the request (syntax, unknown graph, ...).
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The request did not complete within its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The store could not be reached.
    #[error("Endpoint unavailable: {0}")]
    Unavailable(String),
}

impl EndpointError {
    pub(crate) fn into_query_error(self) -> ExecutionError {
        match self {
            Self::Timeout(d) => ExecutionError::timeout(d),
            other => ExecutionError::QueryExecution {
                message: other.to_string(),
            },
        }
    }

    pub(crate) fn into_update_error(self) -> ExecutionError {
        match self {
            Self::Timeout(d) => ExecutionError::timeout(d),
            other => ExecutionError::UpdateExecution {
                message: other.to_string(),
            },
        }
    }
}

/// RDF dataset a request is evaluated against.
///
/// Empty lists mean "the store's default dataset".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphScope {
    /// `default-graph-uri` / `using-graph-uri` values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_graphs: Vec<String>,
    /// `named-graph-uri` / `using-named-graph-uri` values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub named_graphs: Vec<String>,
}

static IRI_RE: OnceLock<Regex> = OnceLock::new();

fn iri_regex() -> &'static Regex {
    // Absolute IRI: scheme ":" followed by no whitespace or forbidden characters.
    IRI_RE.get_or_init(|| {
        Regex::new(r#"^[A-Za-z][A-Za-z0-9+.\-]*:[^\s<>"{}|\\^`]*$"#).expect("static IRI pattern is valid")
    })
}

impl GraphScope {
    /// The store's default dataset.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Scope restricted to the given default graphs.
    pub fn default_graphs<I, S>(graphs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default_graphs: graphs.into_iter().map(Into::into).collect(),
            named_graphs: Vec::new(),
        }
    }

    /// True if the query sees every graph.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.default_graphs.is_empty() && self.named_graphs.is_empty()
    }

    /// Returns true if `graph` (None = default graph) is visible in this scope.
    #[must_use]
    pub fn includes(&self, graph: Option<&RdfTerm>) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        let Some(graph) = graph else {
            return false;
        };
        let iri = graph.lexical();
        self.default_graphs.iter().chain(&self.named_graphs).any(|g| g == iri)
    }

    /// Checks that every graph is an absolute IRI.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let re = iri_regex();
        for iri in self.default_graphs.iter().chain(&self.named_graphs) {
            if !re.is_match(iri) {
                return Err(ValidationError::InvalidGraphIri { iri: iri.clone() });
            }
        }
        Ok(())
    }
}

/// A triple in a (possibly default) graph.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Quad {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<RdfTerm>,
    pub subject: RdfTerm,
    pub predicate: RdfTerm,
    pub object: RdfTerm,
}

impl Quad {
    /// A triple in the default graph.
    #[must_use]
    pub fn triple(subject: RdfTerm, predicate: RdfTerm, object: RdfTerm) -> Self {
        Self {
            graph: None,
            subject,
            predicate,
            object,
        }
    }

    /// Moves the triple into a named graph.
    #[must_use]
    pub fn in_graph(mut self, graph: impl Into<String>) -> Self {
        self.graph = Some(RdfTerm::iri(graph));
        self
    }
}

/// Effective changes of an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    /// Quads that were not present before the update.
    pub added: Vec<Quad>,
    /// Quads that were present before the update.
    pub removed: Vec<Quad>,
}

impl UpdateOutcome {
    /// True if the update did not change the dataset.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// SPARQL 1.1 query/update service.
///
/// Implementations must be thread-safe: subscription units evaluate their
/// queries concurrently within one update cycle. `timeout` bounds each call;
/// exceeding it must yield [`EndpointError::Timeout`] rather than block. The
/// engine only checks the deadline after a call returns and every update
/// cycle waits for all subscription checks, so an endpoint that overruns its
/// timeout stalls every update.
pub trait SparqlEndpoint: Send + Sync {
    /// Evaluate a SELECT query, giving up with [`EndpointError::Timeout`]
    /// after `timeout`.
    fn execute_query(&self, sparql: &str, scope: &GraphScope, timeout: Duration) -> Result<ResultSet, EndpointError>;

    /// Apply an update and report its effective changes. Same deadline
    /// contract as [`Self::execute_query`].
    fn execute_update(&self, sparql: &str, scope: &GraphScope, timeout: Duration) -> Result<UpdateOutcome, EndpointError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_validation_accepts_absolute_iris() {
        let scope = GraphScope {
            default_graphs: vec!["http://example.org/g1".to_string()],
            named_graphs: vec!["urn:uuid:1234".to_string()],
        };
        assert!(scope.validate().is_ok());
    }

    #[test]
    fn scope_validation_rejects_relative_or_spaced() {
        let scope = GraphScope::default_graphs(["graph one"]);
        let err = scope.validate().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidGraphIri { .. }));

        assert!(GraphScope::default_graphs(["relative/path"]).validate().is_err());
    }

    #[test]
    fn scope_inclusion() {
        let g = RdfTerm::iri("http://ex/g");
        assert!(GraphScope::all().includes(None));
        assert!(GraphScope::all().includes(Some(&g)));

        let scoped = GraphScope::default_graphs(["http://ex/g"]);
        assert!(scoped.includes(Some(&g)));
        assert!(!scoped.includes(None));
        assert!(!scoped.includes(Some(&RdfTerm::iri("http://ex/other"))));
    }

    #[test]
    fn endpoint_errors_map_to_execution_errors() {
        let err = EndpointError::Timeout(Duration::from_millis(10)).into_query_error();
        assert!(matches!(err, ExecutionError::Timeout { duration_ms: 10 }));

        let err = EndpointError::Rejected("bad syntax".to_string()).into_update_error();
        assert!(matches!(err, ExecutionError::UpdateExecution { .. }));
    }
}
