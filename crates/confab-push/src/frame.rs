//! Wire frames exchanged over the push connection

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single frame: `{"type": string, "data": object}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Parse a text payload. Returns `None` for anything that isn't a frame.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Serialize to the JSON text sent on the wire
    pub fn to_text(&self) -> String {
        // A Frame is a string plus a serde_json::Value, which always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}
