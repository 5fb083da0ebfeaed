//! Error types for the runtime protocol client.

use thiserror::Error;

/// Errors surfaced by the runtime protocol client.
///
/// Transport failures with a known classification are re-mapped to
/// [`RuntimeApiError::Upstream`]; every other transport error passes
/// through unchanged as [`RuntimeApiError::Transport`]. None of these are
/// retried here — retry policy belongs to the poll loop driving the client.
#[derive(Error, Debug)]
pub enum RuntimeApiError {
    /// The control plane answered with a status outside the contract.
    #[error("control plane returned unexpected status {0}")]
    BadStatusCode(u16),

    /// A next-invocation response arrived with an empty body.
    #[error("next-invocation response carried no body")]
    NoBody,

    /// A next-invocation response was missing a required header, or the
    /// header value could not be parsed.
    #[error("next-invocation response missing or malformed header {0}")]
    InvocationMissingHeader(&'static str),

    /// A transport failure with a stable classification.
    #[error("upstream transport failure: {0}")]
    Upstream(&'static str),

    /// The call was aborted via [`RuntimeClient::cancel`].
    ///
    /// [`RuntimeClient::cancel`]: crate::client::RuntimeClient::cancel
    #[error("call cancelled")]
    Cancelled,

    /// Any other transport error, propagated unchanged.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Result type alias for client operations.
pub type RuntimeApiResult<T> = Result<T, RuntimeApiError>;
