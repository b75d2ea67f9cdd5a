use thiserror::Error;

/// A single worker that could not be evaluated during a pass.
///
/// The pass keeps going past these; they are reported together at the end so
/// one bad record cannot starve the rest of the batch of monitoring.
#[derive(Debug)]
pub struct WorkerFailure {
    pub deal_id: i64,
    pub error: anyhow::Error,
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deal {}: {:#}", self.deal_id, self.error)
    }
}

#[derive(Debug, Error)]
pub enum TrackingError {
    /// A registry or store read failed; the whole pass is abandoned.
    #[error("lookup failed: {0:#}")]
    Lookup(anyhow::Error),

    /// A total that is structurally guaranteed nonzero came back zero.
    #[error("data consistency failure: {0}")]
    DataConsistency(String),

    /// A deal termination or store write failed mid-escalation.
    #[error("enforcement failed: {0:#}")]
    Enforcement(anyhow::Error),

    /// The pass visited every worker but some of them failed.
    #[error("tracking pass completed with {} failed worker(s)", .0.len())]
    Pass(Vec<WorkerFailure>),
}

impl TrackingError {
    pub fn lookup(err: impl Into<anyhow::Error>) -> Self {
        Self::Lookup(err.into())
    }

    pub fn enforcement(err: impl Into<anyhow::Error>) -> Self {
        Self::Enforcement(err.into())
    }
}
