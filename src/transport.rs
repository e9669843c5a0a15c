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

//! Data model shared across the transport ↔ core boundary (spec §3, §6).

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::metadata::HeaderMap;
use crate::status::Status;

/// Per-message hints threaded alongside an outbound `Message` part.
///
/// `compress` is advisory: honored only when the server has
/// compression enabled (`ServerConfig::server_compression_enabled`).
/// `flush` forces the transport to flush its write buffer immediately
/// after this message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    pub compress: bool,
    pub flush: bool,
}

/// One inbound part of a single RPC, in the order
/// `Metadata -> Message* -> End` (spec §3).
#[derive(Debug)]
pub enum RequestPart {
    Metadata(HeaderMap),
    Message(Bytes),
    End,
    /// A transport-originated fault delivered out of band of the
    /// `Metadata -> Message* -> End` sequence — e.g. an HTTP/2 stream
    /// reset or an interceptor-injected deadline expiry (spec §5, §6:
    /// `receive_error`). Drives the handler straight to `End` through
    /// `ErrorProcessor::process_library_error`, bypassing `StreamState`
    /// entirely since it can legally arrive in any non-terminal state.
    Error(Error),
}

/// One outbound part of a single RPC, in the order
/// `Metadata -> Message* -> End`. Exactly one `End` terminates the
/// stream (spec §3, §8 invariant 1).
#[derive(Debug)]
pub enum ResponsePart {
    Metadata(HeaderMap),
    Message(Bytes, MessageMetadata),
    End(Status, HeaderMap),
}

/// A one-shot acknowledgement handle threaded alongside every part
/// that moves through the [`crate::interceptor::InterceptorPipeline`].
///
/// Every interceptor that observes a part must forward or fail its ack
/// exactly once (spec §4.4). Dropping a `PartAck` without fulfilling it
/// is a bug in an interceptor; in debug builds this is flagged rather
/// than silently ignored (spec §9 supplement on ack discipline).
pub struct PartAck {
    sender: Option<oneshot::Sender<Result<(), Error>>>,
}

pub type AckFuture = oneshot::Receiver<Result<(), Error>>;

impl PartAck {
    pub fn pair() -> (PartAck, AckFuture) {
        let (tx, rx) = oneshot::channel();
        (PartAck { sender: Some(tx) }, rx)
    }

    /// Settle the ack with a result. Consumes `self` so it cannot be
    /// settled twice from the same handle.
    pub fn fulfill(mut self, result: Result<(), Error>) {
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(result);
        }
    }

    /// Settle the ack as `AlreadyComplete` without treating it as a
    /// propagating error — used when a part arrives after `End` has
    /// already been sent (spec §8 invariant 3).
    pub fn fulfill_already_complete(self) {
        self.fulfill(Err(Error::AlreadyComplete));
    }
}

impl Drop for PartAck {
    fn drop(&mut self) {
        if self.sender.is_some() {
            debug_assert!(
                false,
                "PartAck dropped without being forwarded or settled exactly once"
            );
        }
    }
}

/// Target interface to which serialized response parts are written;
/// supplied by the transport (spec §4, "ResponseWriter").
///
/// All three methods resolve only once the transport has accepted the
/// bytes (or failed to) — the returned `Result` IS the ack for this
/// boundary; there is no separate handle here because the transport is
/// always the terminal sink, never a relay (spec §6).
#[async_trait]
pub trait ResponseWriter: Send {
    async fn send_metadata(&mut self, headers: HeaderMap, flush: bool) -> Result<(), Error>;
    async fn send_message(&mut self, bytes: Bytes, meta: MessageMetadata) -> Result<(), Error>;
    async fn send_end(&mut self, status: Status, trailers: HeaderMap) -> Result<(), Error>;
}
