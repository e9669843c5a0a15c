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

//! `CallContext` (spec §3, §4.3): the per-call shared structure handed
//! to user code, interceptors, and the handler alike.
//!
//! The teacher splits this across `RpcContext` (read-only call facts:
//! method, deadline, peer) and `ShareCall`/the `*Sink` family (mutable,
//! completion-carrying state), because its sinks are generic over the
//! response message type and therefore can't live on one shared,
//! non-generic struct without boxing. Native `async`/`await` removes
//! that constraint — the "one-shot completion handle" spec §4.3 talks
//! about is just the `.await` point inside the handler's own async
//! function body (spec §9's callback-to-native-async design note
//! explicitly allows either a channel or a task-local future for this
//! mapping) — so `CallContext` here is one plain, non-generic,
//! `Rc`-shared struct for the whole call, and `CallHandler` owns the
//! await point instead of a separate `response_sink`/`status_sink`
//! field.
//!
//! `Rc<RefCell<..>>` rather than `Arc<Mutex<..>>`: spec §5 guarantees
//! every mutation happens on the call's single-threaded execution
//! context, so no cross-thread synchronization is required inside the
//! core (see `crate::executor`).

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;
use http::Extensions;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::metadata::HeaderMap;
use crate::transport::{AckFuture, MessageMetadata, PartAck};

/// A message queued by `CallContext::send_response` for the handler's
/// outbound loop to forward through the interceptor pipeline.
pub(crate) struct OutboundMessage {
    pub bytes: Bytes,
    pub meta: MessageMetadata,
    pub ack: PartAck,
}

pub(crate) type OutboundSender = mpsc::UnboundedSender<OutboundMessage>;
pub(crate) type OutboundReceiver = mpsc::UnboundedReceiver<OutboundMessage>;

struct Inner {
    headers: HeaderMap,
    trailers: HeaderMap,
    deadline: Option<Instant>,
    compression_enabled: bool,
    server_compression_enabled: bool,
    extensions: Extensions,
    remote_address: Option<String>,
    path: String,
    completed: bool,
    /// Present only for server-streaming/bidi handlers; `send_response`
    /// on a unary/client-streaming context always rejects (spec §4.5:
    /// "streaming-response variants only").
    outbound: Option<OutboundSender>,
}

/// Per-call shared data: headers, deadline, compression flag, mutable
/// trailing metadata, user-info scratch space, and (for streaming
/// responses) the channel through which `send_response` feeds the
/// handler's outbound loop.
#[derive(Clone)]
pub struct CallContext {
    inner: Rc<RefCell<Inner>>,
}

impl CallContext {
    pub(crate) fn new(
        headers: HeaderMap,
        path: String,
        remote_address: Option<String>,
        deadline: Option<Instant>,
        server_compression_enabled: bool,
        outbound: Option<OutboundSender>,
    ) -> CallContext {
        CallContext {
            inner: Rc::new(RefCell::new(Inner {
                headers,
                trailers: HeaderMap::new(),
                deadline,
                compression_enabled: false,
                server_compression_enabled,
                extensions: Extensions::new(),
                remote_address,
                path,
                completed: false,
                outbound,
            })),
        }
    }

    /// Build a context for a streaming-response cardinality (server-streaming
    /// or bidi), wired to a fresh outbound channel whose receiving half the
    /// caller threads into the handler's drive loop as it forwards
    /// `send_response` traffic alongside the invoked user future (spec
    /// §4.5.3/§4.5.4).
    pub(crate) fn new_with_streaming_outbound(
        headers: HeaderMap,
        path: String,
        remote_address: Option<String>,
        deadline: Option<Instant>,
        server_compression_enabled: bool,
    ) -> (CallContext, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = CallContext::new(
            headers,
            path,
            remote_address,
            deadline,
            server_compression_enabled,
            Some(tx),
        );
        (ctx, rx)
    }

    /// Received request headers, immutable after observation.
    pub fn headers(&self) -> HeaderMap {
        self.inner.borrow().headers.clone()
    }

    pub fn path(&self) -> String {
        self.inner.borrow().path.clone()
    }

    pub fn remote_address(&self) -> Option<String> {
        self.inner.borrow().remote_address.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.borrow().deadline
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.inner
            .borrow()
            .deadline
            .is_some_and(|d| Instant::now() >= d)
    }

    /// Influences outbound messages written after this call (an
    /// advisory per-response hint; only honored if the server has
    /// compression enabled — spec §3).
    pub fn set_compression(&self, enabled: bool) {
        self.inner.borrow_mut().compression_enabled = enabled;
    }

    pub(crate) fn effective_compression(&self) -> bool {
        let inner = self.inner.borrow();
        inner.compression_enabled && inner.server_compression_enabled
    }

    /// Merge a trailer value in. Silently ignored once the call has
    /// reached its terminal state — mutations racing with `End` are
    /// lost by design, since the call's execution context is the sole
    /// author of both (spec §5).
    pub fn set_trailer(&self, name: &str, value: impl Into<String>) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.completed {
            return Ok(());
        }
        inner.trailers.append(name, value)
    }

    pub fn trailers(&self) -> HeaderMap {
        self.inner.borrow().trailers.clone()
    }

    /// Typed per-call scratch space shared with interceptors. Only
    /// safe to touch from the call's own execution context (spec §5).
    pub fn insert_user_info<T: Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.inner.borrow_mut().extensions.insert(value)
    }

    pub fn get_user_info<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner.borrow().extensions.get::<T>().cloned()
    }

    /// Emit a response message (server-streaming / bidi only).
    ///
    /// Permitted whenever the call has not yet reached its terminal
    /// state (spec §4.5.3/4.5.4: "whenever state is (Invoked |
    /// CreatedContext) && !Completed"). Returns an `AlreadyComplete`
    /// ack if the call already finished, and a `Library` error ack if
    /// this context's cardinality doesn't support streaming responses.
    pub fn send_response(&self, bytes: Bytes, meta: MessageMetadata) -> AckFuture {
        let (ack, fut) = PartAck::pair();
        let mut inner = self.inner.borrow_mut();
        if inner.completed {
            ack.fulfill_already_complete();
            return fut;
        }
        match inner.outbound.as_ref() {
            Some(tx) => {
                // Handler's receiving end is already gone; treat as complete
                // rather than dropping the ack unfulfilled.
                if let Err(e) = tx.send(OutboundMessage { bytes, meta, ack }) {
                    e.0.ack.fulfill_already_complete();
                }
            }
            None => {
                ack.fulfill(Err(Error::Library(
                    "send_response is not supported on this call's cardinality".into(),
                )));
            }
        }
        fut
    }

    pub(crate) fn mark_completed(&self) {
        self.inner.borrow_mut().completed = true;
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.inner.borrow().completed
    }
}

/// Typed front door onto [`CallContext::send_response`], handed to
/// server-streaming and bidi user code instead of raw `Bytes` (spec
/// §4.5.3/§4.5.4's "context.send_response" — the teacher's
/// `ServerStreamingSink`/`DuplexSink` play the same role, wrapping a
/// `SerializeFn` around the raw call so user code never touches wire
/// bytes directly).
#[derive(Clone)]
pub struct ResponseSink<Q> {
    ctx: CallContext,
    ser: crate::codec::SerializeFn<Q>,
}

impl<Q> ResponseSink<Q> {
    pub(crate) fn new(ctx: CallContext, ser: crate::codec::SerializeFn<Q>) -> ResponseSink<Q> {
        ResponseSink { ctx, ser }
    }

    /// Serialize and enqueue one response message. The returned future
    /// resolves once the transport has accepted (or rejected) it.
    pub fn send(&self, value: &Q, meta: MessageMetadata) -> Result<AckFuture, Error> {
        let mut buf = bytes::BytesMut::new();
        (self.ser)(value, &mut buf)?;
        Ok(self.ctx.send_response(buf.freeze(), meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CallContext {
        CallContext::new(
            HeaderMap::new(),
            "/svc.S/M".into(),
            Some("127.0.0.1:1".into()),
            None,
            true,
            None,
        )
    }

    #[test]
    fn trailer_mutation_ignored_after_completion() {
        let c = ctx();
        c.set_trailer("x", "before").unwrap();
        c.mark_completed();
        c.set_trailer("x", "after").unwrap();
        assert_eq!(c.trailers().get_all("x").collect::<Vec<_>>(), vec!["before"]);
    }

    #[test]
    fn compression_requires_both_flags() {
        let c = ctx();
        c.set_compression(true);
        // server_compression_enabled is true in `ctx()`.
        assert!(c.effective_compression());
    }

    #[tokio::test]
    async fn send_response_without_outbound_channel_fails() {
        let c = ctx();
        let fut = c.send_response(Bytes::new(), MessageMetadata::default());
        let res = fut.await.unwrap();
        assert!(res.is_err());
    }
}
