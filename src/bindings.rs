//! Query result tuples, result sets and the delta between two evaluations.
//!
//! A [`ResultSet`] is a *set*: inserting a tuple twice keeps one copy, and
//! membership is structural over the bound variable values. [`diff`] is the
//! core of incremental re-evaluation:
//!
//! - `added   = current \ previous`
//! - `removed = previous \ current`
//!
//! Empty tuples (no bound variables) never appear in either side of a delta.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::term::RdfTerm;

/// One solution: an ordered mapping from variable name to bound term.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultTuple(BTreeMap<String, RdfTerm>);

impl ResultTuple {
    /// An empty tuple.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style binding.
    #[must_use]
    pub fn with(mut self, variable: impl Into<String>, term: impl Into<RdfTerm>) -> Self {
        self.0.insert(variable.into(), term.into());
        self
    }

    /// Bind `variable`, replacing any previous binding.
    pub fn bind(&mut self, variable: impl Into<String>, term: RdfTerm) {
        self.0.insert(variable.into(), term);
    }

    /// Term bound to `variable`, if any.
    #[must_use]
    pub fn get(&self, variable: &str) -> Option<&RdfTerm> {
        self.0.get(variable)
    }

    /// True if no variable is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of bound variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate `(variable, term)` pairs in variable order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RdfTerm)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every field is length-prefixed, so term text cannot forge a boundary.
    fn feed(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&(self.0.len() as u64).to_le_bytes());
        for (var, term) in &self.0 {
            put(hasher, var.as_bytes());
            put(hasher, term.kind_name().as_bytes());
            put(hasher, term.lexical().as_bytes());
            if let RdfTerm::Literal { datatype, lang, .. } = term {
                put_opt(hasher, datatype.as_deref());
                put_opt(hasher, lang.as_deref());
            }
        }
    }
}

fn put(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn put_opt(hasher: &mut blake3::Hasher, value: Option<&str>) {
    match value {
        Some(v) => {
            hasher.update(&[1]);
            put(hasher, v.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

impl<K: Into<String>, V: Into<RdfTerm>> FromIterator<(K, V)> for ResultTuple {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl std::fmt::Display for ResultTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (var, term)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "?{var}={term}")?;
        }
        write!(f, "}}")
    }
}

/// A set of result tuples sharing one variable schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SparqlResultsDoc", into = "SparqlResultsDoc")]
pub struct ResultSet {
    variables: Vec<String>,
    tuples: BTreeSet<ResultTuple>,
}

impl ResultSet {
    /// An empty result set over `variables`.
    pub fn new<I, S>(variables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            variables: variables.into_iter().map(Into::into).collect(),
            tuples: BTreeSet::new(),
        }
    }

    /// Builds a set from tuples; duplicates collapse.
    pub fn from_tuples<I, S>(variables: I, tuples: impl IntoIterator<Item = ResultTuple>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Self::new(variables);
        out.tuples.extend(tuples);
        out
    }

    /// Inserts a tuple. Returns false if an equal tuple was already present.
    pub fn insert(&mut self, tuple: ResultTuple) -> bool {
        self.tuples.insert(tuple)
    }

    /// Structural membership test.
    #[must_use]
    pub fn contains(&self, tuple: &ResultTuple) -> bool {
        self.tuples.contains(tuple)
    }

    /// Variable schema in projection order.
    #[must_use]
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Number of distinct tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    /// True if the set holds no tuples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    /// Tuples in a deterministic (structural) order.
    pub fn iter(&self) -> impl Iterator<Item = &ResultTuple> {
        self.tuples.iter()
    }

    /// Tuples of `self` not present in `other`, skipping empty tuples.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self {
            variables: self.variables.clone(),
            tuples: self
                .tuples
                .difference(&other.tuples)
                .filter(|t| !t.is_empty())
                .cloned()
                .collect(),
        }
    }

    /// Order-independent blake3 digest of the tuple set.
    ///
    /// Two sets holding the same tuples produce the same fingerprint whatever
    /// order the tuples were inserted in.
    #[must_use]
    pub fn fingerprint(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(self.tuples.len() as u64).to_le_bytes());
        for tuple in &self.tuples {
            tuple.feed(&mut hasher);
        }
        hasher.finalize()
    }

    /// Encodes the set as SPARQL 1.1 Query Results JSON.
    pub fn to_sparql_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decodes SPARQL 1.1 Query Results JSON.
    pub fn from_sparql_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl std::fmt::Display for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, tuple) in self.tuples.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tuple}")?;
        }
        write!(f, "]")
    }
}

#[derive(Serialize, Deserialize)]
struct SparqlResultsDoc {
    head: SparqlHead,
    results: SparqlBindings,
}

#[derive(Serialize, Deserialize)]
struct SparqlHead {
    #[serde(default)]
    vars: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct SparqlBindings {
    #[serde(default)]
    bindings: Vec<ResultTuple>,
}

impl From<SparqlResultsDoc> for ResultSet {
    fn from(doc: SparqlResultsDoc) -> Self {
        Self::from_tuples(doc.head.vars, doc.results.bindings)
    }
}

impl From<ResultSet> for SparqlResultsDoc {
    fn from(set: ResultSet) -> Self {
        Self {
            head: SparqlHead { vars: set.variables },
            results: SparqlBindings {
                bindings: set.tuples.into_iter().collect(),
            },
        }
    }
}

/// Added/removed tuples between two evaluations of the same query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Tuples present now but not before.
    pub added: ResultSet,
    /// Tuples present before but not now.
    pub removed: ResultSet,
}

impl Delta {
    /// True if nothing was added or removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Computes the delta from `previous` to `current`.
#[must_use]
pub fn diff(previous: &ResultSet, current: &ResultSet) -> Delta {
    let mut removed = previous.difference(current);
    // Keep the current schema on both sides so consumers see one head.
    if !current.variables.is_empty() {
        removed.variables.clone_from(&current.variables);
    }
    Delta {
        added: current.difference(previous),
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(v: i64) -> ResultTuple {
        ResultTuple::new().with("x", v)
    }

    fn set(values: &[i64]) -> ResultSet {
        ResultSet::from_tuples(["x"], values.iter().copied().map(x))
    }

    #[test]
    fn duplicates_collapse() {
        let mut rs = ResultSet::new(["x"]);
        assert!(rs.insert(x(1)));
        assert!(!rs.insert(x(1)));
        assert_eq!(rs.len(), 1);
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let delta = diff(&set(&[1, 2, 3]), &set(&[2, 3, 4]));
        assert_eq!(delta.added, set(&[4]));
        assert_eq!(delta.removed, set(&[1]));
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let a = set(&[1, 2]);
        assert!(diff(&a, &a).is_empty());
    }

    #[test]
    fn diff_sides_are_disjoint() {
        let delta = diff(&set(&[1, 2, 5]), &set(&[2, 3, 5, 6]));
        for t in delta.added.iter() {
            assert!(!delta.removed.contains(t));
        }
    }

    #[test]
    fn diff_ignores_empty_tuples() {
        let prev = ResultSet::from_tuples(["x"], [ResultTuple::new(), x(1)]);
        let cur = ResultSet::from_tuples(["x"], [x(2)]);
        let delta = diff(&prev, &cur);
        assert_eq!(delta.removed, set(&[1]));

        let delta = diff(&cur, &prev);
        assert_eq!(delta.added, set(&[1]));
    }

    #[test]
    fn membership_is_structural_not_positional() {
        let a = ResultTuple::new().with("x", 1i64).with("y", "a");
        let b = ResultTuple::new().with("y", "a").with("x", 1i64);
        assert_eq!(a, b);

        let rs = ResultSet::from_tuples(["x", "y"], [a]);
        assert!(rs.contains(&b));
    }

    #[test]
    fn fingerprint_ignores_insertion_order() {
        let a = ResultSet::from_tuples(["x"], [x(1), x(2), x(3)]);
        let b = ResultSet::from_tuples(["x"], [x(3), x(1), x(2)]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), set(&[1, 2]).fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_term_kinds() {
        let iri = ResultSet::from_tuples(["x"], [ResultTuple::new().with("x", RdfTerm::iri("a"))]);
        let lit = ResultSet::from_tuples(["x"], [ResultTuple::new().with("x", RdfTerm::literal("a"))]);
        assert_ne!(iri.fingerprint(), lit.fingerprint());
    }

    #[test]
    fn fingerprint_is_not_fooled_by_control_characters_in_literals() {
        let lit = |s: &str| ResultTuple::new().with("x", RdfTerm::literal(s));
        let two = ResultSet::from_tuples(["x"], [lit("a"), lit("b")]);
        let one = ResultSet::from_tuples(["x"], [lit("a\x1f\x1f\x1e\x1dx\x1fliteral\x1fb")]);
        assert_ne!(two, one);
        assert_ne!(two.fingerprint(), one.fingerprint());

        // A value spilling into the next binding must not match the split form.
        let split = ResultSet::from_tuples(["x", "y"], [lit("a").with("y", RdfTerm::literal("b"))]);
        let joined = ResultSet::from_tuples(["x"], [lit("a\x1fy\x1fliteral\x1fb")]);
        assert_ne!(split.fingerprint(), joined.fingerprint());
    }

    #[test]
    fn sparql_json_decodes_endpoint_response() {
        let json = r#"{
            "head": {"vars": ["s", "o"]},
            "results": {"bindings": [
                {"s": {"type": "uri", "value": "http://ex/a"}, "o": {"type": "literal", "value": "1"}},
                {"s": {"type": "uri", "value": "http://ex/a"}, "o": {"type": "literal", "value": "1"}}
            ]}
        }"#;
        let rs = ResultSet::from_sparql_json(json).unwrap();
        assert_eq!(rs.variables(), ["s".to_string(), "o".to_string()]);
        assert_eq!(rs.len(), 1);

        let encoded = rs.to_sparql_json().unwrap();
        assert_eq!(ResultSet::from_sparql_json(&encoded).unwrap(), rs);
    }
}
