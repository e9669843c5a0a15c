// Copyright 2017 PingCAP, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! gRPC status codes and the terminal `Status` carried on every `End`.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;

/// The standard gRPC status code set.
///
/// Numeric values match the wire encoding used in the `grpc-status`
/// trailer (decimal ASCII).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// The terminal outcome of an RPC, carried in the response-side `End`.
///
/// `cause` is the library error that produced this `Status`, when there
/// is one (spec §3: `{code, message, cause: Option<Error>}`) — kept
/// behind an `Arc` since `Status` is cloned freely (once into the
/// trailing `End`, once into whatever an `ErrorDelegate` observes) while
/// `Error` itself is not `Clone`.
#[derive(Debug, Clone)]
pub struct Status {
    pub code: StatusCode,
    pub message: Option<String>,
    pub cause: Option<Arc<Error>>,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Status {
        Status {
            code,
            message: Some(message.into()),
            cause: None,
        }
    }

    pub fn ok() -> Status {
        Status {
            code: StatusCode::Ok,
            message: None,
            cause: None,
        }
    }

    pub fn with_code(code: StatusCode) -> Status {
        Status {
            code,
            message: None,
            cause: None,
        }
    }

    /// Attach the library/observer error this status was derived from.
    pub fn with_cause(mut self, cause: Arc<Error>) -> Status {
        self.cause = Some(cause);
        self
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.code, StatusCode::Ok)
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Status {
        let code = match err {
            Error::ProtocolViolation(_) => StatusCode::Internal,
            Error::StreamCardinalityViolation(_) => StatusCode::Internal,
            Error::Codec(_) => StatusCode::Internal,
            Error::Library(_) => StatusCode::Internal,
            Error::Observer(_) => StatusCode::Unknown,
            Error::Transport(_) => StatusCode::Unavailable,
            Error::ResourceExhausted(_) => StatusCode::ResourceExhausted,
            Error::AlreadyComplete => StatusCode::Internal,
        };
        Status::new(code, err.to_string()).with_cause(Arc::new(err.clone()))
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Status {
        Status::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_error_carries_the_originating_error_as_cause() {
        let err = Error::Codec("bad payload".into());
        let status = Status::from(&err);
        assert_eq!(status.code, StatusCode::Internal);
        assert!(matches!(status.cause.as_deref(), Some(Error::Codec(_))));
    }

    #[test]
    fn new_and_ok_leave_cause_unset() {
        assert!(Status::new(StatusCode::NotFound, "missing").cause.is_none());
        assert!(Status::ok().cause.is_none());
    }
}
