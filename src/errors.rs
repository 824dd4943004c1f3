use std::fmt::{Display, Formatter};

/// Abstract error kinds shared by every component.
///
/// Provider adapters translate native cloud errors into one of these kinds
/// so callers can react without matching on provider-specific messages.
/// `Internal` wraps native errors that have no neutral equivalent; the raw
/// message always rides along in the domain error variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Conflict,
    PreconditionFailed,
    NotModified,
    Unsupported,
    Timeout,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::BadRequest => "bad request",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PreconditionFailed => "precondition failed",
            ErrorKind::NotModified => "not modified",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}
