//! Wire messages exchanged between a client channel and the broker.

use serde::{Deserialize, Serialize};

use crate::endpoint::GraphScope;
use crate::error::TransportError;
use crate::subscription::{Notification, SubscriptionId};

/// Client → broker request.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe {
        sparql: String,
        #[serde(default, skip_serializing_if = "GraphScope::is_unrestricted")]
        scope: GraphScope,
        /// Client-chosen label echoed back in the acknowledgement.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authorization: Option<String>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authorization: Option<String>,
    },
}

impl ClientRequest {
    /// Subscribe request without credentials.
    #[must_use]
    pub fn subscribe(sparql: impl Into<String>, scope: GraphScope, alias: Option<String>) -> Self {
        Self::Subscribe {
            sparql: sparql.into(),
            scope,
            alias,
            authorization: None,
        }
    }

    /// Unsubscribe request without credentials.
    #[must_use]
    pub const fn unsubscribe(subscription_id: SubscriptionId) -> Self {
        Self::Unsubscribe {
            subscription_id,
            authorization: None,
        }
    }

    /// Attaches (or replaces) the authorization header value.
    pub fn set_authorization(&mut self, value: impl Into<String>) {
        let value = Some(value.into());
        match self {
            Self::Subscribe { authorization, .. } | Self::Unsubscribe { authorization, .. } => *authorization = value,
        }
    }

    /// Attached `Authorization` header value.
    #[must_use]
    pub fn authorization(&self) -> Option<&str> {
        match self {
            Self::Subscribe { authorization, .. } | Self::Unsubscribe { authorization, .. } => authorization.as_deref(),
        }
    }

    /// Short label for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Error body sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP-style status code.
    pub status: u16,
    /// Machine-readable code (`invalid_grant`, `not_found`, ...).
    pub error: String,
    /// Human-readable detail.
    #[serde(default)]
    pub description: String,
}

impl ErrorResponse {
    /// Builds an error response.
    #[must_use]
    pub fn new(status: u16, error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            description: description.into(),
        }
    }
}

impl From<ErrorResponse> for TransportError {
    fn from(e: ErrorResponse) -> Self {
        Self::ServerError {
            status: e.status,
            error: e.error,
            description: e.description,
        }
    }
}

/// Broker → client message.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        subscription_id: SubscriptionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    Unsubscribed {
        subscription_id: SubscriptionId,
    },
    Notification(Notification),
    Error(ErrorResponse),
}

impl ServerMessage {
    /// True for messages that complete the outstanding request.
    #[must_use]
    pub const fn is_terminal_response(&self) -> bool {
        !matches!(self, Self::Notification(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_is_replaced_not_appended() {
        let mut req = ClientRequest::subscribe("SELECT * WHERE {?s ?p ?o}", GraphScope::all(), None);
        assert_eq!(req.authorization(), None);
        req.set_authorization("Bearer a");
        req.set_authorization("Bearer b");
        assert_eq!(req.authorization(), Some("Bearer b"));
    }

    #[test]
    fn requests_serialize_with_type_tag() {
        let id = SubscriptionId::new();
        let json = serde_json::to_value(ClientRequest::unsubscribe(id)).unwrap();
        assert_eq!(json["type"], "unsubscribe");
        assert!(json.get("authorization").is_none());

        let back: ClientRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, ClientRequest::unsubscribe(id));
    }

    #[test]
    fn server_error_parses_without_description() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"error","status":401,"error":"invalid_grant"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Error(ErrorResponse::new(401, "invalid_grant", "")));
        assert!(msg.is_terminal_response());
    }
}
