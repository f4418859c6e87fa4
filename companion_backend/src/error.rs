use thiserror::Error;

/// Why a completion request did not produce a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionFailure {
    ProviderUnavailable,
    EmptyCredentialPool,
    MalformedResponse,
}

impl CompletionFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionFailure::ProviderUnavailable => "provider_unavailable",
            CompletionFailure::EmptyCredentialPool => "empty_credential_pool",
            CompletionFailure::MalformedResponse => "malformed_response",
        }
    }
}

/// Error surfaced by the completion orchestrator.
///
/// Callers never show `detail` to end users; it exists for logs and the
/// dashboard event feed.
#[derive(Debug, Clone, Error)]
#[error("completion failed ({}): {detail}", reason.as_str())]
pub struct CompletionError {
    pub reason: CompletionFailure,
    pub detail: String,
}

impl CompletionError {
    pub fn new(reason: CompletionFailure, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn empty_pool() -> Self {
        Self::new(
            CompletionFailure::EmptyCredentialPool,
            "no provider credentials configured",
        )
    }
}

/// Failure reported by a completion provider for a single request.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("provider returned a malformed response: {0}")]
    Malformed(String),
}

impl From<ProviderError> for CompletionError {
    fn from(error: ProviderError) -> Self {
        let reason = match error {
            ProviderError::Malformed(_) => CompletionFailure::MalformedResponse,
            ProviderError::Timeout
            | ProviderError::Transport(_)
            | ProviderError::Rejected { .. } => CompletionFailure::ProviderUnavailable,
        };
        CompletionError::new(reason, error.to_string())
    }
}
