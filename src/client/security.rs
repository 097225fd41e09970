//! Security collaborator contract for the client channel.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

use super::protocol::ErrorResponse;

/// Bearer credential attached to outgoing requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Usually `Bearer`.
    pub token_type: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Bearer credential without a known expiry.
    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            token_type: "Bearer".to_string(),
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    /// Sets the expiry instant.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// `Authorization` header value.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// True once `expires_at` has passed. Credentials without expiry never expire locally.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// Source of credentials for a client channel.
pub trait CredentialProvider: Send + Sync {
    /// Credential to attach to a fresh request, if any.
    fn current_credential(&self) -> Option<Credential>;

    /// Whether a broker error means the attached credential expired.
    fn is_credential_expired(&self, error: &ErrorResponse) -> bool {
        error.status == 401 && error.error == "invalid_grant"
    }

    /// Obtains a new credential, blocking for at most `timeout`.
    fn refresh_credential(&self, timeout: Duration) -> Result<Credential, SecurityError>;
}

/// Provider for brokers that do not authenticate.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn current_credential(&self) -> Option<Credential> {
        None
    }

    fn is_credential_expired(&self, _error: &ErrorResponse) -> bool {
        false
    }

    fn refresh_credential(&self, _timeout: Duration) -> Result<Credential, SecurityError> {
        Err(SecurityError::RefreshFailed {
            message: "no credential source configured".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl CredentialProvider for Fixed {
        fn current_credential(&self) -> Option<Credential> {
            Some(Credential::bearer("t"))
        }

        fn refresh_credential(&self, _timeout: Duration) -> Result<Credential, SecurityError> {
            Ok(Credential::bearer("t2"))
        }
    }

    #[test]
    fn header_value() {
        assert_eq!(Credential::bearer("abc").authorization_header(), "Bearer abc");
    }

    #[test]
    fn default_expiry_detection() {
        let p = Fixed;
        assert!(p.is_credential_expired(&ErrorResponse::new(401, "invalid_grant", "")));
        assert!(!p.is_credential_expired(&ErrorResponse::new(401, "invalid_request", "")));
        assert!(!p.is_credential_expired(&ErrorResponse::new(500, "invalid_grant", "")));
    }

    #[test]
    fn local_expiry() {
        let now = Utc::now();
        let c = Credential::bearer("x").with_expiry(now - chrono::Duration::seconds(1));
        assert!(c.is_expired_at(now));
        assert!(!Credential::bearer("x").is_expired_at(now));
    }

    #[test]
    fn no_credentials_never_refreshes() {
        assert!(NoCredentials.refresh_credential(Duration::from_millis(1)).is_err());
        assert!(NoCredentials.current_credential().is_none());
    }
}
