//! Author profile metadata (kind 0 content).

use serde::{Deserialize, Serialize};

/// Parsed kind 0 metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// User-facing display name (takes priority over name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Short biography/description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    /// Profile picture URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Banner image URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    /// NIP-05 identifier (e.g., "user@domain.com").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    /// Lightning address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
    /// Website URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

impl ProfileMetadata {
    /// Get the best display name available, falling back through options.
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.name.as_deref())
            .unwrap_or("Anonymous")
    }

    /// Parse kind 0 content. Unparseable content is treated as absent.
    pub fn from_json(content: &str) -> Option<Self> {
        match serde_json::from_str::<Self>(content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::debug!(error = %e, "discarding unparseable profile content");
                None
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_metadata_from_valid_json() {
        let json = r#"{"name":"alice","display_name":"Alice","about":"hello","picture":"https://example.com/pic.jpg","nip05":"alice@example.com"}"#;
        let meta = ProfileMetadata::from_json(json).unwrap();
        assert_eq!(meta.name.as_deref(), Some("alice"));
        assert_eq!(meta.display_name(), "Alice");
        assert_eq!(meta.nip05.as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn profile_metadata_from_invalid_json_is_absent() {
        assert!(ProfileMetadata::from_json("not json at all").is_none());
        assert!(ProfileMetadata::from_json("[1,2,3]").is_none());
    }

    #[test]
    fn profile_metadata_ignores_unknown_fields() {
        let meta = ProfileMetadata::from_json(r#"{"name":"bob","bot":true}"#).unwrap();
        assert_eq!(meta.display_name(), "bob");
    }

    #[test]
    fn display_name_fallbacks() {
        let empty_display = ProfileMetadata {
            name: Some("carol".to_string()),
            display_name: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(empty_display.display_name(), "carol");
        assert_eq!(ProfileMetadata::default().display_name(), "Anonymous");
    }
}
