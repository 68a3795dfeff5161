use serde::{Deserialize, Serialize};

/// Error codes declared by an ICAT server, plus `Internal` for anything
/// that goes wrong on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BadParameter,
    Internal,
    InsufficientPrivileges,
    NoSuchObjectFound,
    ObjectAlreadyExists,
    Session,
    Validation,
    NotImplemented,
}

impl ErrorKind {
    /// Map a wire identifier from an error envelope's `code` field.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "BAD_PARAMETER" => Some(Self::BadParameter),
            "INTERNAL" => Some(Self::Internal),
            "INSUFFICIENT_PRIVILEGES" => Some(Self::InsufficientPrivileges),
            "NO_SUCH_OBJECT_FOUND" => Some(Self::NoSuchObjectFound),
            "OBJECT_ALREADY_EXISTS" => Some(Self::ObjectAlreadyExists),
            "SESSION" => Some(Self::Session),
            "VALIDATION" => Some(Self::Validation),
            "NOT_IMPLEMENTED" => Some(Self::NotImplemented),
            _ => None,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Self::BadParameter => "BAD_PARAMETER",
            Self::Internal => "INTERNAL",
            Self::InsufficientPrivileges => "INSUFFICIENT_PRIVILEGES",
            Self::NoSuchObjectFound => "NO_SUCH_OBJECT_FOUND",
            Self::ObjectAlreadyExists => "OBJECT_ALREADY_EXISTS",
            Self::Session => "SESSION",
            Self::Validation => "VALIDATION",
            Self::NotImplemented => "NOT_IMPLEMENTED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_code())
    }
}

/// The single error type surfaced by every operation in this workspace.
///
/// `offset` is a byte offset into an offending query for errors the server
/// can localise; -1 means the server supplied none.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct IcatError {
    pub kind: ErrorKind,
    pub message: String,
    pub offset: i32,
}

impl IcatError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            offset: -1,
        }
    }

    pub fn with_offset(kind: ErrorKind, message: impl Into<String>, offset: i32) -> Self {
        Self {
            kind,
            message: message.into(),
            offset,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadParameter, message)
    }
}

pub type Result<T> = std::result::Result<T, IcatError>;
