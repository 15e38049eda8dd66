//
// Crate-wide error type, and the mapping to HTTP status codes.
//
use std::error::Error;
use std::fmt;
use std::io;

use http::StatusCode;

use crate::fs::FsError;

pub(crate) type DavResult<T> = Result<T, DavError>;

/// Errors that can be generated while handling a request.
///
/// Most of these map straight onto an HTTP status code. The exceptions
/// carry extra meaning: `StatusClose` poisons the connection (the request
/// body was not fully consumed), and `ChildError` means the failure has
/// already been recorded in a multistatus response body.
#[derive(Debug)]
pub enum DavError {
    XmlReadError,
    XmlParseError,
    InvalidPath,
    UnknownDavMethod,
    Unauthorized,
    UnsupportedMediaType,
    UnsupportedEncoding,
    Timeout,
    ChildError,
    Status(StatusCode),
    StatusClose(StatusCode),
    FsError(FsError),
    IoError(io::Error),
}

impl DavError {
    /// HTTP status code for this error.
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            DavError::XmlReadError => StatusCode::BAD_REQUEST,
            DavError::XmlParseError => StatusCode::BAD_REQUEST,
            DavError::InvalidPath => StatusCode::BAD_REQUEST,
            DavError::UnknownDavMethod => StatusCode::NOT_IMPLEMENTED,
            DavError::Unauthorized => StatusCode::UNAUTHORIZED,
            DavError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::UnsupportedEncoding => StatusCode::NOT_ACCEPTABLE,
            DavError::Timeout => StatusCode::REQUEST_TIMEOUT,
            DavError::ChildError => StatusCode::MULTI_STATUS,
            DavError::Status(s) => *s,
            DavError::StatusClose(s) => *s,
            DavError::FsError(e) => fserror_to_status(e),
            DavError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Can we keep the connection open after this error, or was the
    /// request body left partially unread.
    pub(crate) fn must_close(&self) -> bool {
        matches!(
            self,
            DavError::StatusClose(_) | DavError::Timeout | DavError::IoError(_)
        )
    }
}

pub(crate) fn fserror_to_status(e: &FsError) -> StatusCode {
    match e {
        FsError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        FsError::GeneralFailure => StatusCode::INTERNAL_SERVER_ERROR,
        FsError::Exists => StatusCode::METHOD_NOT_ALLOWED,
        FsError::NotFound => StatusCode::NOT_FOUND,
        FsError::Forbidden => StatusCode::FORBIDDEN,
        FsError::InsufficientStorage => StatusCode::INSUFFICIENT_STORAGE,
        FsError::LoopDetected => StatusCode::LOOP_DETECTED,
        FsError::PathTooLong => StatusCode::URI_TOO_LONG,
        FsError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        FsError::IsRemote => StatusCode::BAD_GATEWAY,
    }
}

impl fmt::Display for DavError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DavError::XmlReadError => write!(f, "error reading XML body"),
            DavError::XmlParseError => write!(f, "error parsing XML body"),
            DavError::InvalidPath => write!(f, "invalid URL path"),
            DavError::UnknownDavMethod => write!(f, "method not recognized"),
            DavError::Unauthorized => write!(f, "access denied for principal"),
            DavError::UnsupportedMediaType => write!(f, "unsupported media type"),
            DavError::UnsupportedEncoding => write!(f, "unsupported content coding"),
            DavError::Timeout => write!(f, "request body idle timeout"),
            DavError::ChildError => write!(f, "error already reported in multistatus"),
            DavError::Status(s) => write!(f, "http status {s}"),
            DavError::StatusClose(s) => write!(f, "http status {s} (connection close)"),
            DavError::FsError(e) => write!(f, "filesystem error: {e:?}"),
            DavError::IoError(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for DavError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DavError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FsError> for DavError {
    fn from(e: FsError) -> Self {
        DavError::FsError(e)
    }
}

impl From<io::Error> for DavError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            DavError::Timeout
        } else {
            DavError::IoError(e)
        }
    }
}

impl From<StatusCode> for DavError {
    fn from(s: StatusCode) -> Self {
        DavError::Status(s)
    }
}

impl From<xml::writer::Error> for DavError {
    fn from(e: xml::writer::Error) -> Self {
        match e {
            xml::writer::Error::Io(e) => DavError::IoError(e),
            _ => DavError::XmlReadError,
        }
    }
}

impl From<xmltree::ParseError> for DavError {
    fn from(_: xmltree::ParseError) -> Self {
        DavError::XmlParseError
    }
}

impl From<DavError> for io::Error {
    fn from(e: DavError) -> Self {
        match e {
            DavError::IoError(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
