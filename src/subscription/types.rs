//! Identifiers, notifications and update context for the subscription engine.
//!
//! These types are serializable so a transport can forward them as-is.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bindings::{Delta, ResultSet};
use crate::endpoint::UpdateOutcome;
use crate::error::ValidationError;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl std::str::FromStr for SubscriptionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("sub-").unwrap_or(s);
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| ValidationError::InvalidSubscriptionId { value: s.to_string() })
    }
}

/// Identifier of a client transport connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateId(String);

impl GateId {
    /// The raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GateId {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl From<String> for GateId {
    fn from(v: String) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a notification carries.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationPayload {
    /// Full result set at subscribe time (sequence 0).
    Snapshot { results: ResultSet },
    /// Changes since the previous notification.
    Delta(Delta),
}

/// Unit of outward delivery for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// 0 for the initial snapshot, then 1, 2, ... per delivered delta.
    pub sequence: u64,
    /// Snapshot or delta.
    pub payload: NotificationPayload,
}

impl Notification {
    pub(crate) fn snapshot(subscription_id: SubscriptionId, results: ResultSet) -> Self {
        Self {
            subscription_id,
            sequence: 0,
            payload: NotificationPayload::Snapshot { results },
        }
    }

    pub(crate) fn delta(subscription_id: SubscriptionId, sequence: u64, delta: Delta) -> Self {
        Self {
            subscription_id,
            sequence,
            payload: NotificationPayload::Delta(delta),
        }
    }

    /// True for the sequence-0 snapshot.
    #[must_use]
    pub const fn is_initial(&self) -> bool {
        matches!(self.payload, NotificationPayload::Snapshot { .. })
    }

    /// Snapshot results, or the added side of a delta.
    #[must_use]
    pub fn added(&self) -> &ResultSet {
        match &self.payload {
            NotificationPayload::Snapshot { results } => results,
            NotificationPayload::Delta(delta) => &delta.added,
        }
    }

    /// Removed side of a delta; `None` for a snapshot.
    #[must_use]
    pub fn removed(&self) -> Option<&ResultSet> {
        match &self.payload {
            NotificationPayload::Snapshot { .. } => None,
            NotificationPayload::Delta(delta) => Some(&delta.removed),
        }
    }
}

/// The update a propagation cycle is reacting to.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    /// Monotonic cycle number assigned by the registry.
    pub update_id: u64,
    /// Effective quad changes reported by the endpoint.
    pub outcome: Arc<UpdateOutcome>,
    /// When the cycle started.
    pub started_at: DateTime<Utc>,
}

/// Why a stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Termination {
    /// Explicit unsubscribe by the owner.
    Unsubscribed,
    /// Removed by the engine (dead gate, shutdown).
    Forced { reason: String },
}

/// Item yielded by a [`NotificationStream`](super::NotificationStream).
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Notification(Notification),
    /// Terminal; nothing follows.
    Closed(Termination),
}
