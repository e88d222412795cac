use std::backtrace::Backtrace;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Semantic error categories surfaced to callers.
///
/// `Backend` covers any I/O or protocol failure from the store; everything
/// else is produced by the engine itself and is safe to retry or report
/// without touching the connection.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid table: {0}")]
    InvalidTable(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("no index matches the filter set")]
    NoIndex,

    #[error("operation not supported: {0}")]
    OpNotSupported(String),

    #[error("no results found for query")]
    EmptyResult,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// An engine error: a kind plus the stack trace captured where it was built.
pub struct Error {
    kind: ErrorKind,
    trace: Backtrace,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            trace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The stack trace captured at construction. Disabled traces render as
    /// a one-line placeholder, per `std::backtrace` semantics.
    pub fn trace(&self) -> &Backtrace {
        &self.trace
    }

    pub fn invalid_table(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTable(name.into()))
    }

    pub fn no_index() -> Self {
        Self::new(ErrorKind::NoIndex)
    }

    pub fn op_not_supported(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::OpNotSupported(what.into()))
    }

    pub fn empty_result() -> Self {
        Self::new(ErrorKind::EmptyResult)
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Codec(msg.into()))
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend(msg.into()))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation(msg.into()))
    }

    pub fn is_backend(&self) -> bool {
        matches!(self.kind, ErrorKind::Backend(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.kind, self.trace)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::backend(err.to_string())
    }
}
