//! Handshake and credential payloads.
//!
//! Wire shapes use `snake_case` field names and ISO-8601 timestamps; the
//! session API exposes normalized values ([`Auth`] with a `DateTime<Utc>`).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A credential as seen by application code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    /// Opaque bearer token.
    pub token: String,

    /// When the token stops being valid.
    pub expires_at: DateTime<Utc>,
}

impl Auth {
    /// Create a credential.
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Whether the token has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Credential wire shape: `{token, expires_at}` with an ISO-8601 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Opaque bearer token.
    pub token: String,

    /// Expiry as an RFC 3339 timestamp.
    pub expires_at: String,
}

impl From<&Auth> for AuthPayload {
    fn from(auth: &Auth) -> Self {
        Self {
            token: auth.token.clone(),
            // AutoSi keeps exactly the sub-second digits needed, so parsing
            // the string back yields the same instant.
            expires_at: auth.expires_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }
}

impl TryFrom<AuthPayload> for Auth {
    type Error = chrono::ParseError;

    fn try_from(payload: AuthPayload) -> Result<Self, Self::Error> {
        let expires_at = DateTime::parse_from_rfc3339(&payload.expires_at)?.with_timezone(&Utc);
        Ok(Self {
            token: payload.token,
            expires_at,
        })
    }
}

/// Host-side context shared with the guest.
///
/// Fields other than `member` are preserved as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Identifier of the member using the host application, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,

    /// Any additional context fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Context {
    /// Context for a member.
    pub fn for_member(member: impl Into<String>) -> Self {
        Self {
            member: Some(member.into()),
            extra: Map::new(),
        }
    }
}

/// Describes where the guest is mounted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Application the guest belongs to.
    pub application: String,

    /// Key of the view rendering the guest.
    pub view_key: String,

    /// Surface inside the view.
    pub surface: String,
}

/// Conventional reply payload to the guest's `hello`.
///
/// Every field is optional; a host may answer `hello` with any payload and
/// the guest caches whichever of these fields it finds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Initial context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,

    /// Initial credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthPayload>,

    /// Mount information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_info: Option<PluginInfo>,
}
