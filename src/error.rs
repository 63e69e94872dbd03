//! Crate-wide error type.
//!
//! Mirrors the original DTrace error model: a small fixed set of error
//! kinds (`dtp->dt_errno` in the original source) plus an optional heap
//! message (`dt_set_errmsg`). Data-plane faults (`BadAddress`, `IllegalOp`)
//! are raised through [`crate::trampoline::DispatchContext::fault`] rather
//! than returned, since the data plane cannot propagate `Result` across a
//! probe firing — see spec §7.

use std::fmt;

/// The fixed set of error kinds from spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Allocation failure.
    NoMemory,
    /// A probe lookup by description or PRID found nothing.
    NoSuchProbe,
    /// Attempted to insert a probe description that already exists.
    Duplicate,
    /// Attempted to attach a second USDT overlying probe to an underlying
    /// site that already has one.
    DuplicateUsdt,
    /// Data-plane: a kernel memory dereference failed.
    BadAddress,
    /// Data-plane: an unknown built-in variable id was requested.
    IllegalOp,
    /// A compiled clause requires destructive actions but the session has
    /// not opted in.
    DestructiveDisallowed,
    /// Compiling, loading, or attaching a probe's program failed.
    EnablingFailed,
    /// The tracepoint backend reported a failure not covered above.
    BpfError,
    /// The DOF-parsed wire stream was malformed.
    BadDof,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NoMemory => "out of memory",
            ErrorKind::NoSuchProbe => "no such probe",
            ErrorKind::Duplicate => "probe already exists",
            ErrorKind::DuplicateUsdt => "underlying probe already has a USDT overlying probe",
            ErrorKind::BadAddress => "bad kernel address",
            ErrorKind::IllegalOp => "illegal built-in variable",
            ErrorKind::DestructiveDisallowed => "destructive actions not allowed",
            ErrorKind::EnablingFailed => "failed to enable probe",
            ErrorKind::BpfError => "tracepoint backend error",
            ErrorKind::BadDof => "malformed DOF stream",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type: a kind plus an optional free-form message,
/// matching `dtp->dt_errno` / `dtp->dt_errmsg` in the original source.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{}", message.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, message: None }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_message(ErrorKind::BpfError, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
