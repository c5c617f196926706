pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation referenced an ipset that does not exist or has the wrong kind.
    #[error("unknown ipset: {0}")]
    UnknownSet(String),

    #[error("network policy {0} already exists")]
    PolicyExists(String),

    #[error("network policy {0} not found")]
    PolicyNotFound(String),

    #[error("adding {set} to list {list} would create a cycle")]
    Cycle { list: String, set: String },

    /// Staged policies were held back because they reference missing ipsets.
    ///
    /// All other pending state was applied.
    #[error("{} network policies failed validation", .0.len())]
    Validation(Vec<ValidationError>),

    #[error("failed to apply program: {0:#}")]
    Executor(anyhow::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("network policy {policy} references unknown ipsets: {}", .missing.join(", "))]
pub struct ValidationError {
    pub policy: String,
    pub missing: Vec<String>,
}

// === impl Error ===

impl Error {
    /// Indicates whether the error left staged state pending for a subsequent apply.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Executor(_))
    }
}
