//! Fault taxonomy and registration-time configuration errors.
//!
//! A [`Fault`] is any error condition raised while processing a request:
//! middleware faults, responder faults, routing faults, and the synthesized
//! body-size fault. Each fault carries a [`FaultKind`] tag; error handlers
//! are registered against a kind and claim any fault whose kind they
//! subsume, so a handler for `FaultKind::Error` also claims the more
//! specific `FaultKind::PayloadTooLarge`.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::http::request::Method;
use crate::http::response::StatusCode;

/// Kind tag attached to every fault.
///
/// Kinds form a small hierarchy used for handler matching:
///
/// ```text
/// Any
/// ├── Status              direct status signal
/// ├── Error               structured HTTP error
/// │   ├── PayloadTooLarge
/// │   ├── NotFound
/// │   └── MethodNotAllowed
/// └── App                 opaque application fault
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Any,
    Status,
    Error,
    PayloadTooLarge,
    NotFound,
    MethodNotAllowed,
    App,
}

impl FaultKind {
    pub fn parent(self) -> Option<FaultKind> {
        match self {
            FaultKind::Any => None,
            FaultKind::Status | FaultKind::Error | FaultKind::App => Some(FaultKind::Any),
            FaultKind::PayloadTooLarge
            | FaultKind::NotFound
            | FaultKind::MethodNotAllowed => Some(FaultKind::Error),
        }
    }

    /// Returns true if `other` is this kind or a more specific kind
    /// registered under it.
    pub fn subsumes(self, other: FaultKind) -> bool {
        let mut current = Some(other);

        while let Some(kind) = current {
            if kind == self {
                return true;
            }
            current = kind.parent();
        }

        false
    }
}

/// Signal payload instructing the framework to compose a response directly
/// from a status code and headers.
#[derive(Debug, Clone)]
pub struct HttpStatus {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
}

impl HttpStatus {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Structured HTTP error: composes a standard JSON error-body response when
/// raised (or re-raised from within an error handler).
#[derive(Debug, Clone, Serialize)]
pub struct HttpError {
    #[serde(skip)]
    pub kind: FaultKind,
    #[serde(skip)]
    pub status: StatusCode,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HttpError {
    pub fn new(status: StatusCode, title: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Error,
            status,
            title: title.into(),
            description: None,
        }
    }

    pub fn payload_too_large() -> Self {
        Self {
            kind: FaultKind::PayloadTooLarge,
            ..Self::new(StatusCode::PayloadTooLarge, "Payload Too Large")
        }
    }

    pub fn not_found() -> Self {
        Self {
            kind: FaultKind::NotFound,
            ..Self::new(StatusCode::NotFound, "Not Found")
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            kind: FaultKind::MethodNotAllowed,
            ..Self::new(StatusCode::MethodNotAllowed, "Method Not Allowed")
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Any error condition raised while processing a request.
#[derive(Debug)]
pub enum Fault {
    /// Compose a response directly from a status/headers tuple.
    Status(HttpStatus),
    /// Compose a standard error-body response.
    Error(HttpError),
    /// Opaque application fault from middleware, a responder, or a
    /// data/finalize callback.
    App(anyhow::Error),
}

impl Fault {
    pub fn app(err: impl Into<anyhow::Error>) -> Self {
        Fault::App(err.into())
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Fault::Status(_) => FaultKind::Status,
            Fault::Error(e) => e.kind,
            Fault::App(_) => FaultKind::App,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Status(s) => write!(f, "status signal: {}", s.status.as_u16()),
            Fault::Error(e) => write!(f, "{} {}", e.status.as_u16(), e.title),
            Fault::App(e) => e.fmt(f),
        }
    }
}

impl From<HttpStatus> for Fault {
    fn from(status: HttpStatus) -> Self {
        Fault::Status(status)
    }
}

impl From<HttpError> for Fault {
    fn from(error: HttpError) -> Self {
        Fault::Error(error)
    }
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        Fault::App(err)
    }
}

/// Registration-time configuration error. Fails route registration fast and
/// is never routed through the error handler registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A finalize responder was registered without its data counterpart.
    DataResponderMissing {
        uri_template: String,
        method: Method,
    },
    /// A data responder was registered without its finalize counterpart.
    FinalizeResponderMissing {
        uri_template: String,
        method: Method,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::DataResponderMissing { uri_template, method } => write!(
                f,
                "a finalize responder was found for {} on '{}', \
                 but the corresponding data responder is missing",
                method.as_str(),
                uri_template,
            ),
            ConfigError::FinalizeResponderMissing { uri_template, method } => write!(
                f,
                "a data responder was found for {} on '{}', \
                 but the corresponding finalize responder is missing",
                method.as_str(),
                uri_template,
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
