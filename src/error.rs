//! Error types for the hwcomposer backend

use std::collections::TryReserveError;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by a composition device.
///
/// `code` is the raw value the HAL returned; `op` names the call that failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{op} failed with device error {code}")]
pub struct DeviceError {
    pub op: &'static str,
    pub code: i32,
}

impl DeviceError {
    pub fn new(op: &'static str, code: i32) -> Self {
        Self { op, code }
    }

    /// Map a HAL return value to a `Result`, zero being success.
    pub fn check(op: &'static str, code: i32) -> std::result::Result<(), Self> {
        if code == 0 {
            Ok(())
        } else {
            Err(Self::new(op, code))
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("out of memory while building {0}")]
    OutOfMemory(&'static str),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("{what} did not signal within {timeout:?}")]
    FenceTimeout { what: &'static str, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The result classes the display front end distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidParameter,
    OutOfMemory,
    OperationFailed,
    BadRequest,
    NotFound,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::OperationFailed(_)
            | Error::Device(_)
            | Error::FenceTimeout { .. }
            | Error::Io(_) => ErrorKind::OperationFailed,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidParameter(msg.into())
    }

    pub(crate) fn failed(msg: impl Into<String>) -> Self {
        Error::OperationFailed(msg.into())
    }

    pub(crate) fn oom(what: &'static str) -> impl FnOnce(TryReserveError) -> Self {
        move |_| Error::OutOfMemory(what)
    }
}
