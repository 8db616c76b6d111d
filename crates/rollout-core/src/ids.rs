use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const DEPLOYMENT_PREFIX: &str = "dep";
const PROCESS_PREFIX: &str = "proc";

/// Opaque request-correlation token carried by every event.
///
/// Deployment events get a `dep_` id minted by the trigger controller,
/// process lifecycle events a `proc_` id minted by the host. Readers must
/// treat the value as opaque; ids loaded from storage keep whatever shape
/// they were written with.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh id for a deployment request.
    pub fn new() -> Self {
        Self::with_prefix(DEPLOYMENT_PREFIX)
    }

    /// Fresh id for a process lifecycle event (boot, stop, crash).
    pub fn process() -> Self {
        Self::with_prefix(PROCESS_PREFIX)
    }

    fn with_prefix(prefix: &str) -> Self {
        Self(format!("{}_{}", prefix, Uuid::now_v7()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
