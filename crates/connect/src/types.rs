use crate::error::ConnectError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The external account/service pair being authorized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub provider: String,
    pub service: String,
}

impl ConnectionRequest {
    pub fn new(provider: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.service)
    }
}

/// Returned by the authorize endpoint. `state` is opaque and only forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationGrant {
    pub authorization_url: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthConnection {
    pub provider: String,
    pub service: String,
    pub connected: bool,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

impl OAuthConnection {
    pub fn matches(&self, request: &ConnectionRequest) -> bool {
        self.connected && self.provider == request.provider && self.service == request.service
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn status_label(&self) -> &'static str {
        if !self.connected {
            "disconnected"
        } else if self.is_expired(Utc::now()) {
            "expired"
        } else {
            "connected"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOutcome {
    pub success: bool,
    pub provider: String,
    pub email: Option<String>,
    pub error: Option<ConnectError>,
}

impl ConnectionOutcome {
    pub fn succeeded(provider: impl Into<String>, email: Option<String>) -> Self {
        Self {
            success: true,
            provider: provider.into(),
            email,
            error: None,
        }
    }

    pub fn failed(provider: impl Into<String>, error: ConnectError) -> Self {
        Self {
            success: false,
            provider: provider.into(),
            email: None,
            error: Some(error),
        }
    }
}

/// What a single completion channel (callback message or status poll)
/// reported once it settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelResult {
    Success { email: Option<String> },
    Failure(ConnectError),
}

/// Identity of a launched window. Callback messages are matched on this,
/// never on an origin string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn connection(connected: bool) -> OAuthConnection {
        OAuthConnection {
            provider: "google".into(),
            service: "calendar".into(),
            connected,
            user_email: Some("ada@example.edu".into()),
            expires_at: None,
            scopes: None,
        }
    }

    #[test]
    fn test_matches_requires_connected_pair() {
        let request = ConnectionRequest::new("google", "calendar");
        assert!(connection(true).matches(&request));
        assert!(!connection(false).matches(&request));
        assert!(!connection(true).matches(&ConnectionRequest::new("google", "drive")));
        assert!(!connection(true).matches(&ConnectionRequest::new("microsoft", "calendar")));
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        let mut conn = connection(true);
        assert!(!conn.is_expired(now));
        conn.expires_at = Some(now - Duration::minutes(1));
        assert!(conn.is_expired(now));
        assert_eq!(conn.status_label(), "expired");
        conn.expires_at = Some(now + Duration::hours(1));
        assert!(!conn.is_expired(now));
        assert_eq!(conn.status_label(), "connected");
    }

    #[test]
    fn test_deserialize_connection_with_missing_optionals() {
        let conn: OAuthConnection = serde_json::from_str(
            r#"{"provider":"notion","service":"pages","connected":false}"#,
        )
        .unwrap();
        assert_eq!(conn.user_email, None);
        assert_eq!(conn.status_label(), "disconnected");
    }

    #[test]
    fn test_request_display() {
        assert_eq!(ConnectionRequest::new("google", "calendar").to_string(), "google/calendar");
    }
}
