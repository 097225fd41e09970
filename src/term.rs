//! RDF term values bound in query results.
//!
//! Terms serialize in the SPARQL 1.1 Query Results JSON shape so a result set
//! received from an HTTP endpoint can be decoded without translation.

use serde::{Deserialize, Serialize};

/// XSD namespace prefix used for typed literals.
pub const XSD: &str = "http://www.w3.org/2001/XMLSchema#";

/// An RDF term bound to a query variable.
///
/// Equality and ordering are structural, so two tuples binding the same
/// variables to the same terms compare equal regardless of where they came from.
///
/// # Examples
///
/// ```
/// use sparql_pubsub::RdfTerm;
///
/// let iri = RdfTerm::iri("http://example.org/a");
/// let lit = RdfTerm::typed(42, "integer");
///
/// assert!(iri.is_iri());
/// assert_eq!(lit.to_string(), "\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>");
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RdfTerm {
    #[serde(rename = "uri")]
    Iri { value: String },

    #[serde(rename = "literal", alias = "typed-literal")]
    Literal {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        datatype: Option<String>,
        #[serde(rename = "xml:lang", default, skip_serializing_if = "Option::is_none")]
        lang: Option<String>,
    },

    #[serde(rename = "bnode")]
    BlankNode { value: String },
}

impl RdfTerm {
    /// An IRI term.
    pub fn iri(value: impl Into<String>) -> Self {
        Self::Iri { value: value.into() }
    }

    /// A plain literal.
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal {
            value: value.into(),
            datatype: None,
            lang: None,
        }
    }

    /// A literal typed with an XSD datatype local name (e.g. `"integer"`).
    pub fn typed(value: impl ToString, xsd_local: &str) -> Self {
        Self::Literal {
            value: value.to_string(),
            datatype: Some(format!("{XSD}{xsd_local}")),
            lang: None,
        }
    }

    /// A language-tagged literal.
    pub fn lang_literal(value: impl Into<String>, lang: impl Into<String>) -> Self {
        Self::Literal {
            value: value.into(),
            datatype: None,
            lang: Some(lang.into()),
        }
    }

    /// A blank node.
    pub fn blank(label: impl Into<String>) -> Self {
        Self::BlankNode { value: label.into() }
    }

    /// True for IRIs.
    pub const fn is_iri(&self) -> bool {
        matches!(self, Self::Iri { .. })
    }

    /// True for literals.
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal { .. })
    }

    /// True for blank nodes.
    pub const fn is_blank(&self) -> bool {
        matches!(self, Self::BlankNode { .. })
    }

    /// Lexical value of the term (IRI string, literal form or blank label).
    #[must_use]
    pub fn lexical(&self) -> &str {
        match self {
            Self::Iri { value } | Self::Literal { value, .. } | Self::BlankNode { value } => value,
        }
    }

    /// Returns a human-readable kind name.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Iri { .. } => "uri",
            Self::Literal { .. } => "literal",
            Self::BlankNode { .. } => "bnode",
        }
    }
}

impl std::fmt::Display for RdfTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Iri { value } => write!(f, "<{value}>"),
            Self::BlankNode { value } => write!(f, "_:{value}"),
            Self::Literal { value, datatype, lang } => {
                write!(f, "{value:?}")?;
                if let Some(lang) = lang {
                    write!(f, "@{lang}")
                } else if let Some(dt) = datatype {
                    write!(f, "^^<{dt}>")
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl From<&str> for RdfTerm {
    fn from(v: &str) -> Self {
        Self::literal(v)
    }
}

impl From<String> for RdfTerm {
    fn from(v: String) -> Self {
        Self::literal(v)
    }
}

impl From<i64> for RdfTerm {
    fn from(v: i64) -> Self {
        Self::typed(v, "integer")
    }
}

impl From<i32> for RdfTerm {
    fn from(v: i32) -> Self {
        Self::typed(v, "integer")
    }
}

impl From<bool> for RdfTerm {
    fn from(v: bool) -> Self {
        Self::typed(v, "boolean")
    }
}
