//! Failure taxonomy for the resolution pipeline.
//!
//! Every component failure is mapped into one of these classes before it
//! reaches the scheduler, which only dispatches on retryable vs terminal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Network timeouts, RPC rate limits, missing samples. Retried with
    /// backoff up to the job's retry budget.
    #[error("transient: {0}")]
    Transient(String),

    /// Contract reverts (other than already-resolved) and invalid market
    /// config. The job fails terminally.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The market is already resolved or cancelled on-chain. Treated as
    /// success by the scheduler.
    #[error("market already resolved or cancelled on-chain")]
    AlreadyTerminal,

    /// No registered fetcher can serve the market's subject. Terminal, with
    /// an operator-visible message.
    #[error("no fetcher available for subject {0}")]
    NoFetcher(String),

    /// The oracle already holds a different committed outcome; another
    /// resolver acted. Terminal.
    #[error("conflicting commit: computed outcome {ours}, chain holds {theirs}")]
    ConflictingCommit { ours: u8, theirs: u8 },
}

impl ResolveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Transient(_))
    }
}
