use std::error::Error;
use std::fmt::{Display, Formatter};

/// Status codes used at the sync boundary. The numbering and meaning follow
/// the transport status space so errors can round-trip through the backend
/// unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Cancelled => "estuary/cancelled",
            ErrorCode::Unknown => "estuary/unknown",
            ErrorCode::InvalidArgument => "estuary/invalid-argument",
            ErrorCode::DeadlineExceeded => "estuary/deadline-exceeded",
            ErrorCode::NotFound => "estuary/not-found",
            ErrorCode::AlreadyExists => "estuary/already-exists",
            ErrorCode::PermissionDenied => "estuary/permission-denied",
            ErrorCode::ResourceExhausted => "estuary/resource-exhausted",
            ErrorCode::FailedPrecondition => "estuary/failed-precondition",
            ErrorCode::Aborted => "estuary/aborted",
            ErrorCode::OutOfRange => "estuary/out-of-range",
            ErrorCode::Unimplemented => "estuary/unimplemented",
            ErrorCode::Internal => "estuary/internal",
            ErrorCode::Unavailable => "estuary/unavailable",
            ErrorCode::DataLoss => "estuary/data-loss",
            ErrorCode::Unauthenticated => "estuary/unauthenticated",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncError {
    pub code: ErrorCode,
    message: String,
}

impl SyncError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for SyncError {}

pub type SyncResult<T> = Result<T, SyncError>;

pub fn cancelled(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::InvalidArgument, message)
}

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::PermissionDenied, message)
}

pub fn failed_precondition(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::Aborted, message)
}

pub fn internal_error(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::Internal, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::Unavailable, message)
}

pub fn unauthenticated(message: impl Into<String>) -> SyncError {
    SyncError::new(ErrorCode::Unauthenticated, message)
}
