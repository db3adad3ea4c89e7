//! Bot kind descriptors.
//!
//! A kind bundles the defaults a freshly created bot starts with. Callers
//! may override any of them at creation time; the descriptor only fills
//! what the request left out.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotKind {
    Standard,
    Business,
    Custom,
}

impl BotKind {
    /// Defaults to `Standard` for anything unrecognized, same as an
    /// omitted kind.
    pub fn parse(value: &str) -> Self {
        match value {
            "business" => Self::Business,
            "custom" => Self::Custom,
            _ => Self::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Business => "business",
            Self::Custom => "custom",
        }
    }

    pub fn default_category(&self) -> &'static str {
        match self {
            Self::Standard => "general",
            Self::Business => "customer-service",
            Self::Custom => "custom",
        }
    }

    pub fn default_branding(&self) -> Value {
        match self {
            Self::Standard => json!({
                "primary_color": "#4f46e5",
                "avatar": "default",
            }),
            Self::Business => json!({
                "primary_color": "#0f766e",
                "avatar": "business",
                "show_powered_by": false,
            }),
            Self::Custom => json!({}),
        }
    }

    pub fn default_features(&self) -> Value {
        match self {
            Self::Standard => json!({
                "file_uploads": false,
                "conversation_export": false,
            }),
            Self::Business => json!({
                "file_uploads": true,
                "conversation_export": true,
                "crm_sync": true,
            }),
            Self::Custom => json!({}),
        }
    }
}

impl Default for BotKind {
    fn default() -> Self {
        Self::Standard
    }
}

/// Overlays caller-supplied JSON onto the kind default. Top-level keys from
/// the caller win; default keys the caller did not mention survive.
pub fn merge_defaults(default: Value, supplied: Option<Value>) -> Value {
    match supplied {
        None => default,
        Some(Value::Object(supplied_map)) => {
            let mut merged = match default {
                Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            for (key, value) in supplied_map {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        // Non-object payloads replace the default wholesale.
        Some(other) => other,
    }
}
