//! Error taxonomy shared by every ferry crate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Errors surfaced by planning and execution.
///
/// `Clone` so a cached failure can be observed by every caller that raced on
/// the same attached-state key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FerryError {
    /// Caller-supplied descriptor is malformed or internally inconsistent.
    #[error("bad input: {0}")]
    BadInput(String),
    /// Invariant violation or serialization bug.
    #[error("internal: {0}")]
    Internal(String),
    /// A call to the cluster API failed.
    #[error("{what}: {source}")]
    Invocation {
        what: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("not found: {0}")]
    NotFound(String),
    /// The cluster does not (yet) serve the requested kind.
    #[error("no matches for kind \"{kind}\" in version \"{}\"", api_version(.group, .version))]
    NoMatch { group: String, version: String, kind: String },
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{what}: deadline exceeded (last observed: {status}); inspect with `{hint}`")]
    DeadlineExceeded { what: String, status: String, hint: String },
    #[error(transparent)]
    ContainerFailed(#[from] ContainerFailure),
}

pub type Result<T, E = FerryError> = std::result::Result<T, E>;

fn api_version(group: &str, version: &str) -> String {
    if group.is_empty() { version.to_string() } else { format!("{}/{}", group, version) }
}

impl FerryError {
    pub fn bad_input(msg: impl Into<String>) -> Self { Self::BadInput(msg.into()) }

    pub fn internal(msg: impl Into<String>) -> Self { Self::Internal(msg.into()) }

    pub fn invocation<E>(what: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Invocation { what: what.into(), source: Arc::new(source) }
    }

    /// Prefix the message with the operation description, keeping the variant.
    pub fn context(self, what: &str) -> Self {
        match self {
            Self::BadInput(m) => Self::BadInput(format!("{}: {}", what, m)),
            Self::Internal(m) => Self::Internal(format!("{}: {}", what, m)),
            Self::Invocation { what: inner, source } => Self::Invocation { what: format!("{}: {}", what, inner), source },
            Self::NotFound(m) => Self::NotFound(format!("{}: {}", what, m)),
            Self::AlreadyExists(m) => Self::AlreadyExists(format!("{}: {}", what, m)),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }

    pub fn is_no_match(&self) -> bool { matches!(self, Self::NoMatch { .. }) }

    pub fn is_cancelled(&self) -> bool { matches!(self, Self::Cancelled) }
}

impl From<serde_json::Error> for FerryError {
    fn from(e: serde_json::Error) -> Self { Self::Internal(format!("serialization failed: {}", e)) }
}

/// A container that terminated unsuccessfully in a pod that will not restart it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedContainer {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub reason: String,
    pub message: String,
    pub exit_code: i32,
}

impl FailedContainer {
    pub fn reference(&self) -> String { format!("{}/{}/{}", self.namespace, self.pod, self.container) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: container failed with: {reason}")]
pub struct ContainerFailure {
    /// `namespace/pod`
    pub name: String,
    pub reason: String,
    pub failed: Vec<FailedContainer>,
}
