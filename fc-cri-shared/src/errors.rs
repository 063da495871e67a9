//! Error taxonomy for the runtime.
//!
//! The set of kinds is closed: every error produced by the runtime maps to
//! exactly one variant, and the shim layer translates these one-to-one into
//! the containerd error space. Context travels in the message; callers that
//! need to branch do so on the variant, not the text.

use std::fmt;

/// Result alias used across the host runtime and agent.
pub type FcResult<T> = std::result::Result<T, FcError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FcError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer (agent, VMM socket) is unreachable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Pool exhausted with no fallback path.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Host is missing something we need (kvm, binaries, golden snapshot).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl FcError {
    /// Short kind name, stable across messages. Used in logs and tests.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FcError::NotFound(_) => ErrorKind::NotFound,
            FcError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FcError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FcError::Unavailable(_) => ErrorKind::Unavailable,
            FcError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            FcError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            FcError::Internal(_) => ErrorKind::Internal,
            FcError::Cancelled(_) => ErrorKind::Cancelled,
            FcError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            FcError::NotImplemented(_) => ErrorKind::NotImplemented,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FcError::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, FcError::Unavailable(_))
    }
}

/// The kind of an [`FcError`], without the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Unavailable,
    ResourceExhausted,
    FailedPrecondition,
    Internal,
    Cancelled,
    DeadlineExceeded,
    NotImplemented,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::FailedPrecondition => "failed_precondition",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::NotImplemented => "not_implemented",
        };
        f.write_str(name)
    }
}

// IO errors that reach this conversion have lost their path context, so they
// land in Internal. Sites that can say more (missing kernel, bad drive path)
// map explicitly before the `?`.
impl From<std::io::Error> for FcError {
    fn from(err: std::io::Error) -> Self {
        FcError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for FcError {
    fn from(err: serde_json::Error) -> Self {
        FcError::Internal(format!("json: {}", err))
    }
}
