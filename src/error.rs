use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

///
/// Failure taxonomy for the whole library.
///
/// Repository-level conditions that callers routinely branch on (`NoNode`,
/// `NodeExists`, `NotEmpty`) are their own variants so call sites can match
/// on them instead of parsing messages.
///
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("node exists: {0}")]
    NodeExists(String),

    #[error("node not empty: {0}")]
    NotEmpty(String),

    #[error("connection loss: {0}")]
    ConnectionLoss(String),

    #[error("operation timeout: {0}")]
    OperationTimeout(String),

    #[error("bad version: {0}")]
    BadVersion(String),

    /// Conditional publish of a cached document lost against a newer
    /// repository version.  Callers refetch and retry.
    #[error("publish version: {0}")]
    PublishVersion(String),

    #[error("no auth: {0}")]
    NoAuth(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("object removed: {0}")]
    ObjectRemoved(String),

    #[error("already connected: {0}")]
    AlreadyConnected(String),

    #[error("inconsistent internal state: {0}")]
    InconsistentInternalState(String),

    #[error("system failure: {0}")]
    SystemFailure(String),

    #[error("unknown error code {code}: {message}")]
    UnknownErrorCode { code: i32, message: String },
}

impl Error {
    /// Whether this error came out of a conditional write that saw a newer
    /// version, in either its repository or cached-document form.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::BadVersion(_) | Error::PublishVersion(_))
    }
}
