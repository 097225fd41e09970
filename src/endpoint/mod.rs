//! Store collaborator: the SPARQL query/update service the engine drives.

/// In-memory reference endpoint.
pub mod memory;
/// Endpoint contract and request types.
pub mod traits;

pub use memory::{Dataset, MemoryEndpoint, UpdatePatch};
pub use traits::{EndpointError, GraphScope, Quad, SparqlEndpoint, UpdateOutcome};
