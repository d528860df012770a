use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Display name shown to peers (typing indicators)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Fallback display name used by some issuers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Additional custom claims
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Claims {
    pub fn user_id(&self) -> &str {
        &self.sub
    }

    /// Username claim, then `name`, then the subject itself
    pub fn display_name(&self) -> &str {
        self.username
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.sub)
    }

    pub fn is_expired(&self) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.exp < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(username: Option<&str>, name: Option<&str>) -> Claims {
        Claims {
            sub: "user-1".to_string(),
            exp: chrono::Utc::now().timestamp() + 60,
            iat: chrono::Utc::now().timestamp(),
            username: username.map(str::to_string),
            name: name.map(str::to_string),
            extra: Default::default(),
        }
    }

    #[test]
    fn test_display_name_fallbacks() {
        assert_eq!(claims(Some("alice"), Some("Alice A.")).display_name(), "alice");
        assert_eq!(claims(None, Some("Alice A.")).display_name(), "Alice A.");
        assert_eq!(claims(None, None).display_name(), "user-1");
    }

    #[test]
    fn test_is_expired() {
        let mut c = claims(None, None);
        assert!(!c.is_expired());
        c.exp = chrono::Utc::now().timestamp() - 10;
        assert!(c.is_expired());
    }
}
