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

//! The error taxonomy of spec §7.

use thiserror::Error;

/// Errors produced by the call pipeline core.
///
/// `ProtocolViolation` and `StreamCardinalityViolation` never reach
/// user code directly; they are folded into an `End` by
/// [`crate::error_processor::ErrorProcessor`]. `Observer` wraps an
/// error surfaced by user code or a user future and is the only
/// variant routed through `process_observer_error` rather than
/// `process_library_error`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("stream cardinality violation: {0}")]
    StreamCardinalityViolation(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("library error: {0}")]
    Library(String),

    #[error("observer error: {0}")]
    Observer(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// An inbound message exceeded `max_receive_message_length`, or a
    /// pre-observer request buffer exceeded `request_buffer_limit`
    /// (spec §6, §9 Open Question on buffer bounds).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Recoverable: returned on ack futures for writes submitted after
    /// `End` has already been sent. Never drives the handler anywhere;
    /// it is the "no-op, but tell the caller" outcome of spec §8
    /// invariant 3.
    #[error("call already complete")]
    AlreadyComplete,
}

pub type Result<T> = std::result::Result<T, Error>;
