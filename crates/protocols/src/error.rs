//! Engine error types.

use thiserror::Error;
use tss_provider::ProviderError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A primitive call failed; the error text is preserved verbatim so the
    /// coordinator can surface it in the failed session's data.
    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// The machine was advanced with a round it does not consume next.
    #[error("{kind} machine cannot advance with round {round}")]
    UnexpectedRound { kind: &'static str, round: u16 },

    /// The machine already produced its artifact.
    #[error("{kind} machine already finished")]
    Finished { kind: &'static str },
}

pub type EngineResult<T> = Result<T, EngineError>;
