use thiserror::Error;

/// Failure of a call against the remote backend.
///
/// The sync engine retries every variant the same way; the split only drives
/// logging and lets adapters report what went wrong.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Remote does not reflect write to {table}/{id}")]
    NotVerified { table: String, id: String },

    #[error("Timeout error")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    /// True for failures caused by reachability rather than by the remote
    /// refusing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Transient(_) | RemoteError::Timeout | RemoteError::Http(_)
        )
    }
}
