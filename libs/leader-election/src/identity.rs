//! Candidate identity and the leadership role being contested.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ElectionError, ElectionResult};

/// fallback when neither `HOSTNAME` nor the kernel hostname is readable
const UNKNOWN_HOST: &str = "localhost";

/// Opaque string that identifies one candidate among all processes competing
/// for the same [`Role`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Use a caller-chosen identity. Empty identities are rejected since an
    /// empty holder is how a released lease is recorded.
    pub fn new(id: impl Into<String>) -> ElectionResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ElectionError::Config("identity must not be empty".into()));
        }
        Ok(Self(id))
    }

    /// `<hostname>_<random token>`, unique across restarts of the same host.
    pub fn generate() -> Self {
        Self(format!("{}_{}", hostname(), uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn hostname() -> String {
    let non_empty = |h: String| Some(h.trim().to_owned()).filter(|h| !h.is_empty());
    std::env::var("HOSTNAME")
        .ok()
        .and_then(non_empty)
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok().and_then(non_empty))
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok().and_then(non_empty))
        .unwrap_or_else(|| UNKNOWN_HOST.to_owned())
}

/// Which leadership contest an elector participates in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role {
    pub namespace: String,
    pub name: String,
}

impl Role {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
