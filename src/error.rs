//! Error handling for mediawarden.
//!
//! Errors carry a coarse [`ErrorKind`] modelled after gRPC status codes and
//! the underlying error as details. The daemon never treats an error as
//! fatal: the kind mostly decides how loudly a failure is logged, and
//! whether the main loop backs off.

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Boxed source error.
type Details = Box<dyn std::error::Error + Send + Sync>;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Details,
}

/// Standard result type for mediawarden operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// Only the codes that a shell channel, a REST control plane and a few state
/// files can produce are represented.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    #[error("operation was cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    #[error("invalid argument specified")]
    InvalidArgument = 3,

    /// A remote shell command or control-plane request timed out.
    #[error("operation timed out")]
    DeadlineExceeded = 4,

    #[error("not found")]
    NotFound = 5,

    #[error("permission denied")]
    PermissionDenied = 7,

    /// The control plane is rate limiting.
    #[error("resource has been exhausted")]
    ResourceExhausted = 8,

    #[error("out of range")]
    OutOfRange = 11,

    #[error("internal error")]
    Internal = 13,

    /// The remote device or the control plane cannot be reached.
    #[error("service unavailable")]
    Unavailable = 14,

    /// The control plane rejected the bearer token, or the device refused
    /// the ADB key.
    #[error("no valid authentication credentials")]
    Unauthenticated = 16,
}

macro_rules! constructors {
    ($($name:ident => $kind:ident),+ $(,)?) => {
        $(
            #[doc = concat!("Creates an [`ErrorKind::", stringify!($kind), "`] error.")]
            pub fn $name<E>(error: E) -> Self
            where
                E: Into<Details>,
            {
                Self::new(ErrorKind::$kind, error)
            }
        )+
    };
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Details>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    constructors! {
        cancelled => Cancelled,
        deadline_exceeded => DeadlineExceeded,
        internal => Internal,
        invalid_argument => InvalidArgument,
        not_found => NotFound,
        out_of_range => OutOfRange,
        permission_denied => PermissionDenied,
        resource_exhausted => ResourceExhausted,
        unauthenticated => Unauthenticated,
        unavailable => Unavailable,
        unknown => Unknown,
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Maps a non-success HTTP status returned by the control plane.
    #[must_use]
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let message = format!("{context}: HTTP {status}");
        match status.as_u16() {
            400 | 422 => Self::invalid_argument(message),
            401 => Self::unauthenticated(message),
            403 => Self::permission_denied(message),
            404 => Self::not_found(message),
            408 | 504 => Self::deadline_exceeded(message),
            429 => Self::resource_exhausted(message),
            500 => Self::internal(message),
            502 | 503 => Self::unavailable(message),
            _ => Self::unknown(message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error as "{kind}: {details}".
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Spawning `adb` and touching state files are the main sources.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrNotAvailable | ConnectionRefused | NotConnected | BrokenPipe
            | ConnectionReset | ConnectionAborted | UnexpectedEof => Self::unavailable(err),
            Interrupted => Self::cancelled(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            _ => Self::unknown(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        if let Some(status) = err.status() {
            return Self::from_status(status, &err.to_string());
        }

        if err.is_connect() || err.is_request() {
            return Self::unavailable(err);
        }

        if err.is_decode() || err.is_body() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        Self::unknown(err)
    }
}

/// Converts JSON errors through IO error mapping.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<reqwest::header::InvalidHeaderValue> for Error {
    fn from(e: reqwest::header::InvalidHeaderValue) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<time::error::Parse> for Error {
    fn from(e: time::error::Parse) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e)
    }
}
