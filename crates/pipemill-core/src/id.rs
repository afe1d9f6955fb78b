//! Job identifiers.

use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use uuid::Uuid;

use crate::{Error, Result};

static JOB_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{6,30}$").expect("job id pattern"));

/// Opaque identifier for a job.
///
/// Assigned at submission time; distinct from the seed's human-readable
/// `name`. Matches `^[A-Za-z0-9_-]{6,30}$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct JobId(String);

impl JobId {
    /// Validate and wrap a job id.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if JOB_ID_RE.is_match(&s) {
            Ok(Self(s))
        } else {
            Err(Error::validation(format!("invalid job id: {s:?}")))
        }
    }

    /// Generate a fresh server-assigned id (`j_` plus 10 hex chars).
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("j_{}", &hex[..10]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
