use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque user identifier, assigned by the external user directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub photo_url: Option<String>,
}

/// Read-only lookup into the user/profile directory.
///
/// The core never mutates profile records; it only resolves display data
/// for conversation partners.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn profile(&self, id: &UserId) -> Option<UserProfile>;
}
