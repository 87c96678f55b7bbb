//! Abstract error kinds shared by every layer in a chain.
//!
//! See the "ERROR HANDLING DESIGN" section of the design docs: layers
//! report one of these kinds, the dispatcher maps it to an NBD wire error
//! code, and a `PROTOCOL_VIOLATION` kills the connection while anything
//! else just fails the one request.

use std::fmt;

use crate::proto::ErrorType;

/// Abstract error kind returned by a layer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    OutOfRange,
    ReadOnly,
    PermissionDenied,
    NotSupported,
    OutOfMemory,
    IoFailure,
    ProtocolViolation,
    Timeout,
    Shutdown,
    FormatError,
    PrematureEof,
}

impl ErrorKind {
    /// Map to the wire-visible NBD error code, per the §7 table.
    pub fn to_wire(self) -> ErrorType {
        match self {
            ErrorKind::InvalidRequest | ErrorKind::OutOfRange => ErrorType::EINVAL,
            ErrorKind::ReadOnly | ErrorKind::PermissionDenied => ErrorType::EPERM,
            ErrorKind::NotSupported => ErrorType::ENOTSUP,
            ErrorKind::OutOfMemory => ErrorType::ENOMEM,
            ErrorKind::IoFailure | ErrorKind::FormatError | ErrorKind::PrematureEof => {
                ErrorType::EIO
            }
            ErrorKind::Timeout => ErrorType::ESHUTDOWN,
            ErrorKind::Shutdown => ErrorType::ESHUTDOWN,
            ErrorKind::ProtocolViolation => ErrorType::EINVAL,
        }
    }

    /// Whether an error of this kind should kill the connection outright
    /// rather than just fail the one request.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::ProtocolViolation | ErrorKind::Shutdown)
    }
}

/// An error surfaced by a layer, chain builder, or connection.
#[derive(Debug, Clone)]
pub struct ChainError {
    kind: ErrorKind,
    message: String,
}

impl ChainError {
    pub fn new<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        ChainError {
            kind,
            message: message.as_ref().to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn invalid_request<S: AsRef<str>>(message: S) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn out_of_range<S: AsRef<str>>(message: S) -> Self {
        Self::new(ErrorKind::OutOfRange, message)
    }

    pub fn read_only<S: AsRef<str>>(message: S) -> Self {
        Self::new(ErrorKind::ReadOnly, message)
    }

    pub fn not_supported<S: AsRef<str>>(message: S) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn io_failure<S: AsRef<str>>(message: S) -> Self {
        Self::new(ErrorKind::IoFailure, message)
    }

    pub fn format_error<S: AsRef<str>>(message: S) -> Self {
        Self::new(ErrorKind::FormatError, message)
    }

    pub fn premature_eof<S: AsRef<str>>(message: S) -> Self {
        Self::new(ErrorKind::PrematureEof, message)
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as K;
        let kind = match err.kind() {
            K::PermissionDenied => ErrorKind::PermissionDenied,
            K::InvalidInput | K::InvalidData => ErrorKind::InvalidRequest,
            K::UnexpectedEof => ErrorKind::PrematureEof,
            K::OutOfMemory => ErrorKind::OutOfMemory,
            _ => ErrorKind::IoFailure,
        };
        ChainError::new(kind, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;
