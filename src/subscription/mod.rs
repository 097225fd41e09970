//! Subscription processing engine.
//!
//! A [`SubscriptionRegistry`] owns one [`SubscriptionUnit`] per active
//! subscription. Each update is fanned out to every unit; units re-run their
//! query, diff against their previous results and push non-empty deltas onto
//! the subscription's [`NotificationStream`].

mod barrier;
mod registry;
mod stream;
mod types;
mod unit;

pub use barrier::{CheckOutcome, CheckReport, CompletionToken};
pub use registry::{PropagationReport, RegistryConfig, RegistryStats, Subscribed, SubscriptionRegistry, Unsubscribed};
pub use stream::NotificationStream;
pub use types::{
    GateId, Notification, NotificationPayload, StreamEvent, SubscriptionId, Termination, UpdateContext,
};
pub use unit::{SubscriptionSpec, SubscriptionUnit, UnitState, WorkerExit};
