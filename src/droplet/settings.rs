//! Serializable droplet settings and the errors raised when validating them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Invalid or inconsistent configuration payload.
///
/// Raised by apply/load; the previously committed configuration is never
/// touched when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required field is absent.
    #[error("missing required setting `{0}`")]
    Missing(String),
    /// A field is present but unusable.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        /// Offending field name.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// No factory is registered for this provider type.
    #[error("unknown provider type `{0}`")]
    UnknownProvider(String),
    /// Settings were accessed while the vault was locked.
    #[error("configuration is locked")]
    Locked,
    /// The persisted document could not be interpreted.
    #[error("malformed state document: {0}")]
    Malformed(String),
}

/// The opaque settings blob of one droplet.
///
/// The core reads only `display_name` and `poll_interval_secs`; everything
/// else lives in `fields` and belongs to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Name shown for this droplet.
    pub display_name: String,

    /// Per-droplet polling interval override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,

    /// Provider-specific entries (credentials, paths, accounts).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl Settings {
    /// Settings with a display name and no provider fields.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            poll_interval_secs: None,
            fields: Map::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Builder-style interval override.
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = Some(secs);
        self
    }

    /// Check the fields every provider relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on an empty name or a zero interval.
    pub fn validate_common(&self) -> Result<(), ConfigError> {
        if self.display_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "display_name".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        if self.poll_interval_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "poll_interval_secs".to_owned(),
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    /// A required non-empty string field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the field is absent, not a string, or blank.
    pub fn require_str(&self, key: &str) -> Result<&str, ConfigError> {
        match self.fields.get(key) {
            None => Err(ConfigError::Missing(key.to_owned())),
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
            Some(_) => Err(ConfigError::Invalid {
                field: key.to_owned(),
                reason: "expected a non-empty string".to_owned(),
            }),
        }
    }

    /// An optional string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}
