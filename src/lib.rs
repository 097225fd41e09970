//! # sparql-pubsub - Incremental SPARQL Subscriptions
//!
//! A publish/subscribe broker over a queryable RDF store. Clients register
//! long-running SELECT queries; whenever the store is updated, every active
//! subscription is re-evaluated and only the delta (bindings added, bindings
//! removed) is pushed to its owner.
//!
//! ## Core Concepts
//!
//! - **SubscriptionUnit**: one per subscription; owns the last result set and computes deltas
//! - **SubscriptionRegistry**: fans each update out to every unit and waits on a completion barrier
//! - **GateLivenessMonitor**: probes client connections and reaps subscriptions of dead ones
//! - **ClientSubscriptionChannel**: client-side request slot with credential-refresh retry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sparql_pubsub::{Broker, BrokerConfig, GateId, GraphScope, MemoryEndpoint};
//!
//! let endpoint = Arc::new(MemoryEndpoint::new());
//! let broker = Broker::new(BrokerConfig::default(), endpoint)?;
//!
//! let sub = broker.subscribe(
//!     "SELECT ?x WHERE { ?s <http://ex/p> ?x }",
//!     GraphScope::all(),
//!     GateId::from("ws-1"),
//!     Duration::from_secs(5),
//! )?;
//! let report = broker.update("INSERT DATA { <http://ex/s> <http://ex/p> 1 }", GraphScope::all())?;
//! let event = sub.stream.recv()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Values and result sets
pub mod bindings;
pub mod error;
pub mod term;

// Store collaborator
pub mod endpoint;

// Subscription engine
pub mod gates;
pub mod subscription;

// Client side and facade
pub mod client;
pub mod engine;

// Re-export primary types at crate root for convenience
pub use bindings::{diff, Delta, ResultSet, ResultTuple};
pub use client::{
    ChannelConfig, ClientEvent, ClientRequest, ClientSubscriptionChannel, Credential, CredentialProvider,
    ErrorResponse, ServerMessage, SubscriptionTransport,
};
pub use endpoint::{EndpointError, GraphScope, MemoryEndpoint, Quad, SparqlEndpoint, UpdateOutcome, UpdatePatch};
pub use engine::{Broker, BrokerConfig};
pub use error::{BrokerError, BrokerResult, ExecutionError, SecurityError, TransportError, ValidationError};
pub use gates::{Gate, GateLivenessMonitor, GateMonitorConfig};
pub use subscription::{
    GateId, Notification, NotificationPayload, NotificationStream, PropagationReport, RegistryConfig, RegistryStats,
    StreamEvent, Subscribed, SubscriptionId, SubscriptionRegistry, Termination,
};
pub use term::RdfTerm;
