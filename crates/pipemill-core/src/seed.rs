//! The immutable seed document that initiates a job.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Input document for a job. Stored as `<pending>/<jobId>-seed.json`, then
/// moved verbatim to `<current>/<jobId>/seed.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seed {
    /// Human label, informational only; identity is the job id.
    pub name: String,
    /// Opaque payload handed to task stages.
    pub data: serde_json::Value,
    /// Pipeline slug; defaults to `default` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
}

impl Seed {
    /// Parse and validate a seed from raw JSON bytes.
    ///
    /// Error messages keep the caller-visible substrings stable:
    /// `"Invalid JSON"` for parse failures, `"Required fields missing"`
    /// when `name` or `data` is absent.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::validation(format!("Invalid JSON: {e}")))?;

        let name = value
            .get("name")
            .and_then(|n| n.as_str())
            .filter(|n| !n.trim().is_empty());
        let data = value.get("data").filter(|d| d.is_object());

        let mut missing = Vec::new();
        if name.is_none() {
            missing.push("name");
        }
        if data.is_none() {
            missing.push("data");
        }
        if !missing.is_empty() {
            return Err(Error::validation(format!(
                "Required fields missing: {}",
                missing.join(", ")
            )));
        }

        let pipeline = match value.get("pipeline") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(other) => {
                return Err(Error::validation(format!(
                    "Invalid pipeline field: expected string, got {other}"
                )));
            }
        };

        Ok(Seed {
            name: name.unwrap_or_default().to_string(),
            data: data.cloned().unwrap_or_default(),
            pipeline,
        })
    }
}
