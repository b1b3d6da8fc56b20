// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error codes and structured error objects visible at the crate boundary.

use std::fmt;

/// Boundary error code, matching the fixed vocabulary every external caller
/// (schema engine, plugin back-ends, CLI adapter) is expected to switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    InvalArg,
    /// Schema engine ("libyang"-equivalent) reported an error.
    Ly,
    /// Host OS call failed (mmap, shm_open, futex, ...).
    Sys,
    NoMemory,
    NotFound,
    Exists,
    Internal,
    Unsupported,
    ValidationFailed,
    OperationFailed,
    Unauthorized,
    Locked,
    TimeOut,
    CallbackFailed,
    /// Subscriber is not ready yet; the event stays pending and the engine
    /// moves on to the rest of the wave. Only valid for non-ENABLED callbacks.
    CallbackShelve,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::InvalArg => "INVAL_ARG",
            Self::Ly => "LY",
            Self::Sys => "SYS",
            Self::NoMemory => "NO_MEMORY",
            Self::NotFound => "NOT_FOUND",
            Self::Exists => "EXISTS",
            Self::Internal => "INTERNAL",
            Self::Unsupported => "UNSUPPORTED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::OperationFailed => "OPERATION_FAILED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Locked => "LOCKED",
            Self::TimeOut => "TIME_OUT",
            Self::CallbackFailed => "CALLBACK_FAILED",
            Self::CallbackShelve => "CALLBACK_SHELVE",
        };
        f.write_str(s)
    }
}

/// A structured error as carried between subscriber replies and the engine.
///
/// `format_id`/`opaque_data` let application callbacks round-trip their own
/// error payloads through the engine without this crate having to understand
/// them.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    pub format_id: Option<String>,
    pub opaque_data: Option<Vec<u8>>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            format_id: None,
            opaque_data: None,
        }
    }

    pub fn with_opaque(mut self, format_id: impl Into<String>, data: Vec<u8>) -> Self {
        self.format_id = Some(format_id.into());
        self.opaque_data = Some(data);
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Top-level error type returned from this crate's public operations.
///
/// Organized by the layer that raises it, mirroring the boundary error codes
/// in §6 of the design but carrying Rust-native context (`io::Error`,
/// poisoned-lock sources) where that is more useful to callers inside this
/// process.
#[derive(Debug)]
pub enum Error {
    // --- Argument / usage errors ---
    InvalArg(String),
    Exists(String),
    NotFound(String),

    // --- Schema engine errors (delegated, opaque) ---
    SchemaEngine(String),

    // --- Host OS / shared-memory errors ---
    Sys(std::io::Error),
    NoMemory,
    Unsupported(String),

    // --- Lock / protocol errors ---
    TimeOut,
    Locked(String),
    CallbackFailed(ErrorInfo),
    /// A lock this process previously held could not be reacquired (after a
    /// timed-out upgrade, or during stale-holder recovery). See Design Notes
    /// open question (a): treated as fatal rather than logged-and-ignored.
    Internal(String),
    ValidationFailed(String),
    OperationFailed(String),
    Unauthorized(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalArg(_) => ErrorCode::InvalArg,
            Self::Exists(_) => ErrorCode::Exists,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::SchemaEngine(_) => ErrorCode::Ly,
            Self::Sys(_) => ErrorCode::Sys,
            Self::NoMemory => ErrorCode::NoMemory,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::TimeOut => ErrorCode::TimeOut,
            Self::Locked(_) => ErrorCode::Locked,
            Self::CallbackFailed(_) => ErrorCode::CallbackFailed,
            Self::Internal(_) => ErrorCode::Internal,
            Self::ValidationFailed(_) => ErrorCode::ValidationFailed,
            Self::OperationFailed(_) => ErrorCode::OperationFailed,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalArg(s) => write!(f, "invalid argument: {s}"),
            Self::Exists(s) => write!(f, "already exists: {s}"),
            Self::NotFound(s) => write!(f, "not found: {s}"),
            Self::SchemaEngine(s) => write!(f, "schema engine error: {s}"),
            Self::Sys(e) => write!(f, "system error: {e}"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::Unsupported(s) => write!(f, "unsupported: {s}"),
            Self::TimeOut => write!(f, "operation timed out"),
            Self::Locked(s) => write!(f, "locked: {s}"),
            Self::CallbackFailed(info) => write!(f, "callback failed: {info}"),
            Self::Internal(s) => write!(f, "internal error: {s}"),
            Self::ValidationFailed(s) => write!(f, "validation failed: {s}"),
            Self::OperationFailed(s) => write!(f, "operation failed: {s}"),
            Self::Unauthorized(s) => write!(f, "unauthorized: {s}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sys(e) => Some(e),
            Self::CallbackFailed(info) => Some(info),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Sys(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_display() {
        assert_eq!(ErrorCode::TimeOut.to_string(), "TIME_OUT");
        assert_eq!(ErrorCode::CallbackShelve.to_string(), "CALLBACK_SHELVE");
    }

    #[test]
    fn error_exposes_matching_code() {
        assert_eq!(Error::NoMemory.code(), ErrorCode::NoMemory);
        assert_eq!(Error::InvalArg("x".into()).code(), ErrorCode::InvalArg);
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::other("boom");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::Sys);
    }
}
