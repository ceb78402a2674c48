/// Errors that end the process.
///
/// Everything else in the coordinator is contained: probe failures become an
/// execution status, dispatcher refusals are recorded decisions, and
/// persistence hiccups abort the current tick and surface through the health
/// endpoint. Only the conditions below exit.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unrecoverable persistence failure")]
    Persistence(#[source] anyhow::Error),

    #[error("cluster leadership lost")]
    LeaderLost,
}

impl FatalError {
    /// The process exit code advertised for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Config(_) => 1,
            FatalError::Persistence(_) => 2,
            FatalError::LeaderLost => 64,
        }
    }
}
