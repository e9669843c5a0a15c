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

//! `CallHandler` (spec §4.5): the largest piece of the core — routes a
//! call to user code by streaming cardinality and drives it to exactly
//! one terminal `End`.
//!
//! The teacher spells these out as four free functions
//! (`execute_unary`, `execute_client_streaming`, `execute_server_streaming`,
//! `execute_duplex_streaming` in `call/server.rs`) plus four generic
//! `*Sink` wrapper types. Spec §9 explicitly asks for the opposite
//! shape — "collapse the four cardinality-specific handler types into
//! one handler type whose internal state machine carries a cardinality
//! tag" — so this module keeps the teacher's four driving functions
//! (same names, `drive_*`) but has them close over one shared
//! `HandlerState`/`StreamState` pair instead of four unrelated sink
//! structs.
//!
//! Every `drive_*` function owns its inbound channel outright and uses
//! `tokio::select!` to interleave "more request parts arrived" against
//! "the in-flight user future resolved," which is what lets a
//! cardinality violation (e.g. a second message on a unary call) be
//! detected *while* the user's future is still pending, without any
//! cross-task shared state (spec §5's single-threaded suspension-point
//! guarantee holds trivially: it's all one `.await` chain on one task).
//!
//! `StreamState` is threaded through as `&RefCell<StreamState>` rather
//! than `&mut StreamState`: the bidi and server-streaming drivers poll
//! the inbound request side and the `CallContext::send_response` queue
//! concurrently in the same `select!`, and both sides need to record
//! transitions on the one shared automaton (spec §4.1's "duplicated at
//! two layers" note is about transport-vs-pipeline-vs-handler layering,
//! not about splitting the axes themselves — there is still exactly one
//! `StreamState` per call at this layer). Every borrow is taken and
//! dropped within a single synchronous statement, never held across an
//! `.await`, so this never contends with itself.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use futures::future::LocalBoxFuture;
use tokio::sync::mpsc;

use crate::codec::{DeserializeFn, SerializeFn};
use crate::context::{CallContext, OutboundMessage, OutboundReceiver, ResponseSink};
use crate::error::Error;
use crate::error_processor::ErrorProcessor;
use crate::interceptor::InterceptorPipeline;
use crate::metadata::HeaderMap;
use crate::state::{StreamState, Transition};
use crate::status::{Status, StatusCode};
use crate::transport::{MessageMetadata, PartAck, RequestPart, ResponsePart, ResponseWriter};
use tracing::{debug, warn};

/// One inbound part alongside the ack the pipeline expects settled.
pub type InboundItem = (RequestPart, PartAck);
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundItem>;
pub type InboundSender = mpsc::UnboundedSender<InboundItem>;

/// The streaming shape of one RPC method (spec §2 GLOSSARY: "Call
/// cardinality").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidirectionalStreaming,
}

/// Common lifecycle every cardinality passes through (spec §4.5: "Idle
/// -> CreatedContext -> Invoked -> Completed").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Idle,
    CreatedContext,
    Invoked,
    Completed,
}

/// User code consuming a request stream (client-streaming / bidi),
/// producing `Out` once the request side closes.
///
/// `Out` is `Q` for client-streaming (the single response value) and
/// `Status` for bidi (the terminal status) — the same abstraction
/// serves both "observer-based request consumption" cardinalities,
/// differing only in what their `on_end` hands back (spec §9 design
/// note: generalize the observer factory so both cardinalities that
/// stream requests share one shape).
#[async_trait::async_trait(?Send)]
pub trait StreamObserver<P, Out> {
    async fn on_message(&mut self, msg: P) -> Result<(), Error>;
    async fn on_end(self: Box<Self>) -> Result<Out, Error>;
}

pub type UnaryFn<P, Q> = Rc<dyn Fn(CallContext, P) -> LocalBoxFuture<'static, Result<Q, Error>>>;
pub type ServerStreamingFn<P, Q> =
    Rc<dyn Fn(CallContext, P, ResponseSink<Q>) -> LocalBoxFuture<'static, Result<Status, Error>>>;
pub type ObserverFactory<P, Out> =
    Rc<dyn Fn(CallContext) -> LocalBoxFuture<'static, Result<Box<dyn StreamObserver<P, Out>>, Error>>>;
pub type BidiFactory<P, Q> = Rc<
    dyn Fn(
        CallContext,
        ResponseSink<Q>,
    ) -> LocalBoxFuture<'static, Result<Box<dyn StreamObserver<P, Status>>, Error>>,
>;

/// The user code registered for one method, tagged by cardinality
/// (spec §9: one handler type, internal cardinality tag).
pub enum UserCode<P, Q> {
    Unary(UnaryFn<P, Q>),
    ClientStreaming(ObserverFactory<P, Q>),
    ServerStreaming(ServerStreamingFn<P, Q>),
    BidirectionalStreaming(BidiFactory<P, Q>),
}

impl<P, Q> UserCode<P, Q> {
    pub fn call_type(&self) -> CallType {
        match self {
            UserCode::Unary(_) => CallType::Unary,
            UserCode::ClientStreaming(_) => CallType::ClientStreaming,
            UserCode::ServerStreaming(_) => CallType::ServerStreaming,
            UserCode::BidirectionalStreaming(_) => CallType::BidirectionalStreaming,
        }
    }
}

/// Everything needed to drive one call to completion: the freshly
/// constructed context, the inbound channel (already behind the
/// request-side interceptor pipeline), and the outbound port (the
/// response-side interceptor pipeline feeding a transport
/// [`ResponseWriter`]).
pub struct CallDriveArgs {
    pub ctx: CallContext,
    pub inbound: InboundReceiver,
    pub outbound: OutboundPort,
    pub error_processor: ErrorProcessor,
    pub request_buffer_limit: Option<usize>,
    pub max_receive_message_length: Option<usize>,
    /// Receiving half of `ctx`'s outbound channel, present only for
    /// server-streaming/bidi calls (spec §4.5.3/§4.5.4: "context.send_response
    /// is permitted whenever ..."). `drive_unary`/`drive_client_streaming`
    /// ignore this — their contexts are built with no outbound channel at
    /// all, so `CallContext::send_response` always rejects on those
    /// cardinalities (spec §4.3: "streaming-response variants only").
    pub response_queue: Option<OutboundReceiver>,
}

/// Serialize a response value with a bare `SerializeFn`, without
/// pulling in a paired `Deserializer` for an unrelated type — unlike
/// [`crate::codec::Marshaller`], a unary/client-streaming response
/// path only ever has the outbound `SerializeFn` in scope, and `P`
/// (the request type) need not equal `Q` (the response type).
fn serialize_with<Q>(ser: SerializeFn<Q>, value: &Q) -> Result<Bytes, Error> {
    let mut buf = bytes::BytesMut::new();
    ser(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Reject an inbound message over `max_receive_message_length` before it
/// is ever handed to a deserializer (spec §6).
fn check_message_size(len: usize, limit: Option<usize>) -> Result<(), Error> {
    match limit {
        Some(limit) if len > limit => Err(Error::ResourceExhausted(format!(
            "inbound message of {len} bytes exceeds max_receive_message_length of {limit}"
        ))),
        _ => Ok(()),
    }
}

/// Forward one `send_response`-queued message through the outbound
/// interceptor pipeline, settling its ack with the outcome. Used by the
/// streaming-response drivers to interleave `CallContext::send_response`
/// traffic with their own inbound-watching loop.
async fn forward_outbound_message(
    outbound: &OutboundPort,
    stream: &RefCell<StreamState>,
    msg: OutboundMessage,
) {
    let transition = stream.borrow_mut().send_message();
    match transition {
        Transition::Applied => {
            let result = outbound.send(ResponsePart::Message(msg.bytes, msg.meta)).await;
            msg.ack.fulfill(result);
        }
        _ => msg.ack.fulfill_already_complete(),
    }
}

/// Funnels `ResponsePart`s through the response-side interceptor
/// pipeline to the transport's [`ResponseWriter`].
///
/// The writer sits behind a [`tokio::sync::Mutex`] rather than a
/// `RefCell`: `ResponseSink` (spec §4.4) is `Send + Sync` because the
/// same interceptor chain type is shared across calls that may run on
/// different executor threads, even though any single call only ever
/// touches its own writer from its own task (spec §5).
pub struct OutboundPort {
    pipeline: InterceptorPipeline,
    writer: tokio::sync::Mutex<Box<dyn ResponseWriter>>,
}

impl OutboundPort {
    pub fn new(pipeline: InterceptorPipeline, writer: Box<dyn ResponseWriter>) -> OutboundPort {
        OutboundPort {
            pipeline,
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    async fn send(&self, part: ResponsePart) -> Result<(), Error> {
        let (ack, fut) = PartAck::pair();
        let sink = WriterSink { writer: &self.writer };
        self.pipeline.dispatch_response(part, ack, &sink).await;
        fut.await.map_err(|_| Error::AlreadyComplete)?
    }
}

struct WriterSink<'a> {
    writer: &'a tokio::sync::Mutex<Box<dyn ResponseWriter>>,
}

#[async_trait::async_trait]
impl<'a> crate::interceptor::ResponseSink for WriterSink<'a> {
    async fn deliver(&self, part: ResponsePart, ack: PartAck) {
        let mut writer = self.writer.lock().await;
        let result = match part {
            ResponsePart::Metadata(h) => writer.send_metadata(h, false).await,
            ResponsePart::Message(b, m) => writer.send_message(b, m).await,
            ResponsePart::End(status, trailers) => writer.send_end(status, trailers).await,
        };
        drop(writer);
        ack.fulfill(result);
    }
}

/// Turn any error into the `(Status, HeaderMap)` pair that terminates
/// the call, via the configured [`ErrorProcessor`] (spec §4.6).
async fn resolve_library_error(
    err: Error,
    ctx: &CallContext,
    error_processor: &ErrorProcessor,
) -> (Status, HeaderMap) {
    tracing::error!(path = %ctx.path(), error = %err, "library error terminating call");
    error_processor
        .process_library_error(&err, &ctx.trailers())
        .await
}

async fn resolve_observer_error(
    err: Error,
    ctx: &CallContext,
    error_processor: &ErrorProcessor,
) -> (Status, HeaderMap) {
    tracing::error!(path = %ctx.path(), error = %err, "observer error terminating call");
    error_processor
        .process_observer_error(&err, &ctx.trailers())
        .await
}

/// Send the one empty response-headers part every call opens with,
/// once (spec §4.5: "Idle + Metadata -> CreatedContext: ... enqueue
/// response headers Metadata(empty) onto outbound").
async fn send_initial_metadata(outbound: &OutboundPort, stream: &RefCell<StreamState>) {
    let transition = stream.borrow_mut().send_headers();
    if transition == Transition::Applied {
        let _ = outbound.send(ResponsePart::Metadata(HeaderMap::new())).await;
    }
}

/// Emit the single terminal `End`, tolerant of being called more than
/// once (spec §8 invariant 1: exactly one `End` reaches the wire; the
/// `StreamState` silently drops any further attempt).
async fn finish_call(
    outbound: &OutboundPort,
    stream: &RefCell<StreamState>,
    ctx: &CallContext,
    status: Status,
    trailers: HeaderMap,
) {
    let transition = stream.borrow_mut().send_end();
    if transition == Transition::Applied {
        debug!(path = %ctx.path(), code = %status.code, "call completed");
        let _ = outbound.send(ResponsePart::End(status, trailers)).await;
    }
    ctx.mark_completed();
}

/// Outcome of waiting for the request side's opening `Metadata` part.
enum InitialMetadata {
    /// `Metadata` observed; the call proceeds normally.
    Ready,
    /// A transport-originated fault (spec §5, §6 `receive_error`)
    /// arrived before — or instead of — the opening `Metadata`; or the
    /// first part observed was some other illegal part (e.g. a stray
    /// `Message`/`End` before any `Metadata`), a `ProtocolViolation`
    /// per spec §7's own "message before headers" example. Either way
    /// the call still owes the wire exactly one `End` (spec §7's
    /// general propagation rule), so both route through here.
    Aborted(Error),
    /// The inbound channel closed before anything useful arrived (the
    /// transport hung up immediately) — there's no call to drive.
    Closed,
}

/// Await the request side's `Metadata` part (spec §4.5: "Idle +
/// Metadata -> CreatedContext").
async fn await_initial_metadata(
    inbound: &mut InboundReceiver,
    stream: &RefCell<StreamState>,
) -> InitialMetadata {
    match inbound.recv().await {
        Some((RequestPart::Metadata(_), ack)) => {
            let transition = stream.borrow_mut().receive_headers();
            ack.fulfill(match transition {
                Transition::Violation => Err(Error::ProtocolViolation(
                    "duplicate request metadata".into(),
                )),
                _ => Ok(()),
            });
            InitialMetadata::Ready
        }
        Some((RequestPart::Error(err), ack)) => {
            ack.fulfill(Ok(()));
            InitialMetadata::Aborted(err)
        }
        Some((_, ack)) => {
            let err = Error::ProtocolViolation("first request part must be Metadata".into());
            ack.fulfill(Err(err.clone()));
            InitialMetadata::Aborted(err)
        }
        None => InitialMetadata::Closed,
    }
}

/// Shared handling for [`InitialMetadata`]: send response headers, then
/// either return `true` (call should proceed) or drive an aborted/closed
/// call to its terminal `End` (or nothing, if the transport hung up
/// before anything could be said) and return `false`.
async fn open_call(
    outcome: InitialMetadata,
    outbound: &OutboundPort,
    stream: &RefCell<StreamState>,
    ctx: &CallContext,
    error_processor: &ErrorProcessor,
) -> bool {
    match outcome {
        InitialMetadata::Ready => {
            send_initial_metadata(outbound, stream).await;
            true
        }
        InitialMetadata::Aborted(err) => {
            send_initial_metadata(outbound, stream).await;
            let (status, trailers) = resolve_library_error(err, ctx, error_processor).await;
            finish_call(outbound, stream, ctx, status, trailers).await;
            false
        }
        InitialMetadata::Closed => false,
    }
}

/// Drive one unary call: exactly one request message, exactly one
/// response message (spec §4.5.1).
#[tracing::instrument(skip_all, fields(path = %args.ctx.path(), call_type = "unary"))]
pub async fn drive_unary<P: 'static, Q: 'static>(
    func: UnaryFn<P, Q>,
    de: DeserializeFn<P>,
    ser: SerializeFn<Q>,
    mut args: CallDriveArgs,
) {
    let stream = RefCell::new(StreamState::new());
    let metadata_outcome = await_initial_metadata(&mut args.inbound, &stream).await;
    if !open_call(metadata_outcome, &args.outbound, &stream, &args.ctx, &args.error_processor).await {
        return;
    }

    let mut state = HandlerState::CreatedContext;
    let mut invoked: Option<LocalBoxFuture<'static, Result<Q, Error>>> = None;
    let mut message_seen = false;

    loop {
        tokio::select! {
            maybe_part = args.inbound.recv() => {
                match maybe_part {
                    Some((RequestPart::Message(bytes), ack)) => {
                        if state != HandlerState::CreatedContext || message_seen {
                            ack.fulfill(Err(Error::StreamCardinalityViolation(
                                "unary calls accept exactly one request message".into(),
                            )));
                            warn!(path = %args.ctx.path(), "extra message on unary call");
                            let (status, trailers) = resolve_library_error(
                                Error::StreamCardinalityViolation("extra message on unary call".into()),
                                &args.ctx,
                                &args.error_processor,
                            )
                            .await;
                            finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                            return;
                        }
                        if let Err(err) = check_message_size(bytes.len(), args.max_receive_message_length) {
                            warn!(path = %args.ctx.path(), "inbound message over max_receive_message_length");
                            ack.fulfill(Err(Error::ResourceExhausted(err.to_string())));
                            let (status, trailers) =
                                resolve_library_error(err, &args.ctx, &args.error_processor).await;
                            finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                            return;
                        }
                        message_seen = true;
                        stream.borrow_mut().receive_message();
                        match de(bytes) {
                            Ok(msg) => {
                                ack.fulfill(Ok(()));
                                state = HandlerState::Invoked;
                                invoked = Some(func(args.ctx.clone(), msg));
                            }
                            Err(err) => {
                                ack.fulfill(Err(Error::Codec(err.to_string())));
                                let (status, trailers) =
                                    resolve_library_error(err, &args.ctx, &args.error_processor).await;
                                finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                                return;
                            }
                        }
                    }
                    Some((RequestPart::End, ack)) => {
                        let transition = stream.borrow_mut().receive_end();
                        ack.fulfill(Ok(()));
                        if transition == Transition::Applied && !message_seen {
                            warn!(path = %args.ctx.path(), "unary call closed without a message");
                            let (status, trailers) = resolve_library_error(
                                Error::ProtocolViolation("unary call closed without a message".into()),
                                &args.ctx,
                                &args.error_processor,
                            )
                            .await;
                            finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                            return;
                        }
                    }
                    Some((RequestPart::Metadata(_), ack)) => {
                        warn!(path = %args.ctx.path(), "duplicate request metadata");
                        ack.fulfill(Err(Error::ProtocolViolation("duplicate request metadata".into())));
                    }
                    Some((RequestPart::Error(err), ack)) => {
                        ack.fulfill(Ok(()));
                        let (status, trailers) =
                            resolve_library_error(err, &args.ctx, &args.error_processor).await;
                        finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                        return;
                    }
                    None => {
                        if state != HandlerState::Completed {
                            warn!(path = %args.ctx.path(), "transport closed before call completed");
                            finish_call(
                                &args.outbound,
                                &stream,
                                &args.ctx,
                                Status::new(StatusCode::Unavailable, "transport closed"),
                                args.ctx.trailers(),
                            )
                            .await;
                        }
                        return;
                    }
                }
            }
            result = async { invoked.as_mut().unwrap().await }, if invoked.is_some() => {
                invoked = None;
                match result {
                    Ok(value) => {
                        let bytes = match serialize_with(ser, &value) {
                            Ok(b) => b,
                            Err(err) => {
                                let (status, trailers) =
                                    resolve_library_error(err, &args.ctx, &args.error_processor).await;
                                finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                                return;
                            }
                        };
                        stream.borrow_mut().send_message();
                        let _ = args
                            .outbound
                            .send(ResponsePart::Message(bytes, MessageMetadata {
                                compress: args.ctx.effective_compression(),
                                flush: false,
                            }))
                            .await;
                        finish_call(
                            &args.outbound,
                            &stream,
                            &args.ctx,
                            Status::ok(),
                            args.ctx.trailers(),
                        )
                        .await;
                    }
                    Err(err) => {
                        let (status, trailers) =
                            resolve_observer_error(err, &args.ctx, &args.error_processor).await;
                        finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                    }
                }
                state = HandlerState::Completed;
                return;
            }
        }
    }
}

/// Drive one server-streaming call: exactly one request message, zero
/// or more response messages, terminated by the user's future
/// resolving to a [`Status`] (spec §4.5.3).
#[tracing::instrument(skip_all, fields(path = %args.ctx.path(), call_type = "server_streaming"))]
pub async fn drive_server_streaming<P: 'static, Q: 'static>(
    func: ServerStreamingFn<P, Q>,
    de: DeserializeFn<P>,
    ser: SerializeFn<Q>,
    mut args: CallDriveArgs,
) {
    let stream = RefCell::new(StreamState::new());
    let metadata_outcome = await_initial_metadata(&mut args.inbound, &stream).await;
    if !open_call(metadata_outcome, &args.outbound, &stream, &args.ctx, &args.error_processor).await {
        return;
    }

    let sink = ResponseSink::new(args.ctx.clone(), ser);
    let mut state = HandlerState::CreatedContext;
    let mut invoked: Option<LocalBoxFuture<'static, Result<Status, Error>>> = None;
    let mut message_seen = false;
    let mut response_queue = args.response_queue.take();

    loop {
        tokio::select! {
            maybe_msg = async { response_queue.as_mut().unwrap().recv().await }, if response_queue.is_some() => {
                match maybe_msg {
                    Some(msg) => forward_outbound_message(&args.outbound, &stream, msg).await,
                    None => response_queue = None,
                }
            }
            maybe_part = args.inbound.recv() => {
                match maybe_part {
                    Some((RequestPart::Message(bytes), ack)) => {
                        if state != HandlerState::CreatedContext || message_seen {
                            ack.fulfill(Err(Error::StreamCardinalityViolation(
                                "server-streaming calls accept exactly one request message".into(),
                            )));
                            warn!(path = %args.ctx.path(), "extra message on server-streaming call");
                            let (status, trailers) = resolve_library_error(
                                Error::StreamCardinalityViolation("extra message on server-streaming call".into()),
                                &args.ctx,
                                &args.error_processor,
                            )
                            .await;
                            finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                            return;
                        }
                        if let Err(err) = check_message_size(bytes.len(), args.max_receive_message_length) {
                            warn!(path = %args.ctx.path(), "inbound message over max_receive_message_length");
                            ack.fulfill(Err(Error::ResourceExhausted(err.to_string())));
                            let (status, trailers) =
                                resolve_library_error(err, &args.ctx, &args.error_processor).await;
                            finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                            return;
                        }
                        message_seen = true;
                        stream.borrow_mut().receive_message();
                        match de(bytes) {
                            Ok(msg) => {
                                ack.fulfill(Ok(()));
                                state = HandlerState::Invoked;
                                invoked = Some(func(args.ctx.clone(), msg, sink.clone()));
                            }
                            Err(err) => {
                                ack.fulfill(Err(Error::Codec(err.to_string())));
                                let (status, trailers) =
                                    resolve_library_error(err, &args.ctx, &args.error_processor).await;
                                finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                                return;
                            }
                        }
                    }
                    Some((RequestPart::End, ack)) => {
                        let transition = stream.borrow_mut().receive_end();
                        ack.fulfill(Ok(()));
                        if transition == Transition::Applied && !message_seen {
                            warn!(path = %args.ctx.path(), "server-streaming call closed without a message");
                            let (status, trailers) = resolve_library_error(
                                Error::ProtocolViolation("server-streaming call closed without a message".into()),
                                &args.ctx,
                                &args.error_processor,
                            )
                            .await;
                            finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                            return;
                        }
                    }
                    Some((RequestPart::Metadata(_), ack)) => {
                        warn!(path = %args.ctx.path(), "duplicate request metadata");
                        ack.fulfill(Err(Error::ProtocolViolation("duplicate request metadata".into())));
                    }
                    Some((RequestPart::Error(err), ack)) => {
                        ack.fulfill(Ok(()));
                        let (status, trailers) =
                            resolve_library_error(err, &args.ctx, &args.error_processor).await;
                        finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                        return;
                    }
                    None => {
                        if state != HandlerState::Completed {
                            warn!(path = %args.ctx.path(), "transport closed before call completed");
                            finish_call(
                                &args.outbound,
                                &stream,
                                &args.ctx,
                                Status::new(StatusCode::Unavailable, "transport closed"),
                                args.ctx.trailers(),
                            )
                            .await;
                        }
                        return;
                    }
                }
            }
            result = async { invoked.as_mut().unwrap().await }, if invoked.is_some() => {
                let status = match result {
                    Ok(status) => status,
                    Err(err) => resolve_observer_error(err, &args.ctx, &args.error_processor).await.0,
                };
                let trailers = args.ctx.trailers();
                finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
                return;
            }
        }
    }
}

/// Shared request-consumption loop for the two observer-based
/// cardinalities (client-streaming, bidi): buffer inbound messages
/// until the user's factory resolves, then forward every subsequent
/// message straight to the observer (spec §4.5.2/§4.5.4's "pre-observer
/// buffering").
///
/// Returns the observer's `on_end` result, or `Err` if the call was
/// aborted (protocol violation, transport closed, factory failure)
/// before the request side ever closed.
async fn drive_observer_request_side<P: 'static, Out: 'static>(
    inbound: &mut InboundReceiver,
    stream: &RefCell<StreamState>,
    ctx: &CallContext,
    error_processor: &ErrorProcessor,
    factory: LocalBoxFuture<'static, Result<Box<dyn StreamObserver<P, Out>>, Error>>,
    de: DeserializeFn<P>,
    request_buffer_limit: Option<usize>,
    max_receive_message_length: Option<usize>,
) -> Result<Out, (Status, HeaderMap)> {
    let mut factory = Some(factory);
    let mut observer: Option<Box<dyn StreamObserver<P, Out>>> = None;
    let mut pending: Vec<Bytes> = Vec::new();
    let mut request_closed = false;

    loop {
        tokio::select! {
            maybe_part = inbound.recv() => {
                match maybe_part {
                    Some((RequestPart::Message(bytes), ack)) => {
                        let transition = stream.borrow_mut().receive_message();
                        if transition == Transition::Violation {
                            ack.fulfill(Err(Error::ProtocolViolation("message before metadata".into())));
                            warn!(path = %ctx.path(), "message before metadata");
                            return Err(resolve_library_error(
                                Error::ProtocolViolation("message before metadata".into()),
                                ctx,
                                error_processor,
                            ).await);
                        }
                        if let Err(err) = check_message_size(bytes.len(), max_receive_message_length) {
                            warn!(path = %ctx.path(), "inbound message over max_receive_message_length");
                            ack.fulfill(Err(Error::ResourceExhausted(err.to_string())));
                            return Err(resolve_library_error(err, ctx, error_processor).await);
                        }
                        if observer.is_none() {
                            if let Some(limit) = request_buffer_limit {
                                if pending.len() >= limit {
                                    ack.fulfill(Err(Error::ResourceExhausted(
                                        "request buffer limit exceeded".into(),
                                    )));
                                    warn!(path = %ctx.path(), limit, "request buffer limit exceeded");
                                    return Err(resolve_library_error(
                                        Error::ResourceExhausted("request buffer limit exceeded".into()),
                                        ctx,
                                        error_processor,
                                    ).await);
                                }
                            }
                            pending.push(bytes);
                            ack.fulfill(Ok(()));
                        } else {
                            ack.fulfill(Ok(()));
                            match de(bytes) {
                                Ok(msg) => {
                                    if let Err(err) = observer.as_mut().unwrap().on_message(msg).await {
                                        return Err(resolve_observer_error(err, ctx, error_processor).await);
                                    }
                                }
                                Err(err) => {
                                    return Err(resolve_library_error(Error::Codec(err.to_string()), ctx, error_processor).await);
                                }
                            }
                        }
                    }
                    Some((RequestPart::End, ack)) => {
                        stream.borrow_mut().receive_end();
                        ack.fulfill(Ok(()));
                        request_closed = true;
                    }
                    Some((RequestPart::Metadata(_), ack)) => {
                        warn!(path = %ctx.path(), "duplicate request metadata");
                        ack.fulfill(Err(Error::ProtocolViolation("duplicate request metadata".into())));
                    }
                    Some((RequestPart::Error(err), ack)) => {
                        ack.fulfill(Ok(()));
                        return Err(resolve_library_error(err, ctx, error_processor).await);
                    }
                    None => {
                        warn!(path = %ctx.path(), "transport closed before request side completed");
                        return Err((Status::new(StatusCode::Unavailable, "transport closed"), ctx.trailers()));
                    }
                }
                if request_closed && observer.is_some() {
                    break;
                }
            }
            resolved = async { factory.as_mut().unwrap().await }, if factory.is_some() && observer.is_none() => {
                factory = None;
                match resolved {
                    Ok(mut obs) => {
                        for bytes in pending.drain(..) {
                            match de(bytes) {
                                Ok(msg) => {
                                    if let Err(err) = obs.on_message(msg).await {
                                        return Err(resolve_observer_error(err, ctx, error_processor).await);
                                    }
                                }
                                Err(err) => {
                                    return Err(resolve_library_error(Error::Codec(err.to_string()), ctx, error_processor).await);
                                }
                            }
                        }
                        if request_closed {
                            observer = Some(obs);
                            break;
                        }
                        observer = Some(obs);
                    }
                    Err(err) => {
                        return Err(resolve_library_error(err, ctx, error_processor).await);
                    }
                }
            }
        }
    }

    match observer {
        Some(obs) => match obs.on_end().await {
            Ok(out) => Ok(out),
            Err(err) => Err(resolve_observer_error(err, ctx, error_processor).await),
        },
        None => {
            warn!(path = %ctx.path(), "transport closed before observer was ready");
            Err((Status::new(StatusCode::Unavailable, "transport closed before observer was ready"), ctx.trailers()))
        }
    }
}

/// Drive one client-streaming call: zero or more request messages via
/// an observer, exactly one response value once the request side
/// closes (spec §4.5.2).
#[tracing::instrument(skip_all, fields(path = %args.ctx.path(), call_type = "client_streaming"))]
pub async fn drive_client_streaming<P: 'static, Q: 'static>(
    factory: ObserverFactory<P, Q>,
    de: DeserializeFn<P>,
    ser: SerializeFn<Q>,
    mut args: CallDriveArgs,
) {
    let stream = RefCell::new(StreamState::new());
    let metadata_outcome = await_initial_metadata(&mut args.inbound, &stream).await;
    if !open_call(metadata_outcome, &args.outbound, &stream, &args.ctx, &args.error_processor).await {
        return;
    }

    let fut = factory(args.ctx.clone());
    let outcome = drive_observer_request_side(
        &mut args.inbound,
        &stream,
        &args.ctx,
        &args.error_processor,
        fut,
        de,
        args.request_buffer_limit,
        args.max_receive_message_length,
    )
    .await;

    match outcome {
        Ok(value) => match serialize_with(ser, &value) {
            Ok(bytes) => {
                stream.borrow_mut().send_message();
                let _ = args
                    .outbound
                    .send(ResponsePart::Message(bytes, MessageMetadata {
                        compress: args.ctx.effective_compression(),
                        flush: false,
                    }))
                    .await;
                finish_call(&args.outbound, &stream, &args.ctx, Status::ok(), args.ctx.trailers()).await;
            }
            Err(err) => {
                let (status, trailers) =
                    resolve_library_error(err, &args.ctx, &args.error_processor).await;
                finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
            }
        },
        Err((status, trailers)) => {
            finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
        }
    }
}

/// Drive one bidirectional-streaming call: request and response
/// streams proceed independently; terminated once the observer's
/// `on_end` resolves to the terminal [`Status`] (spec §4.5.4).
#[tracing::instrument(skip_all, fields(path = %args.ctx.path(), call_type = "bidirectional_streaming"))]
pub async fn drive_bidirectional_streaming<P: 'static, Q: 'static>(
    factory: BidiFactory<P, Q>,
    de: DeserializeFn<P>,
    ser: SerializeFn<Q>,
    mut args: CallDriveArgs,
) {
    let stream = RefCell::new(StreamState::new());
    let metadata_outcome = await_initial_metadata(&mut args.inbound, &stream).await;
    if !open_call(metadata_outcome, &args.outbound, &stream, &args.ctx, &args.error_processor).await {
        return;
    }

    let sink = ResponseSink::new(args.ctx.clone(), ser);
    let fut = factory(args.ctx.clone(), sink);
    let mut response_queue = args.response_queue.take();
    let mut request_fut = Box::pin(drive_observer_request_side(
        &mut args.inbound,
        &stream,
        &args.ctx,
        &args.error_processor,
        fut,
        de,
        args.request_buffer_limit,
        args.max_receive_message_length,
    ));

    let outcome = loop {
        tokio::select! {
            result = &mut request_fut => break result,
            maybe_msg = async { response_queue.as_mut().unwrap().recv().await }, if response_queue.is_some() => {
                match maybe_msg {
                    Some(msg) => forward_outbound_message(&args.outbound, &stream, msg).await,
                    None => response_queue = None,
                }
            }
        }
    };
    drop(response_queue);
    drop(request_fut);

    let (status, trailers) = match outcome {
        Ok(status) => (status, args.ctx.trailers()),
        Err(pair) => pair,
    };
    finish_call(&args.outbound, &stream, &args.ctx, status, trailers).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::sync::{Arc, Mutex};

    fn echo_ser(value: &String, buf: &mut BytesMut) -> Result<(), Error> {
        buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn echo_de(bytes: Bytes) -> Result<String, Error> {
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    struct RecordingWriter {
        messages: Arc<Mutex<Vec<Bytes>>>,
        ends: Arc<Mutex<Vec<Status>>>,
    }

    #[async_trait::async_trait]
    impl ResponseWriter for RecordingWriter {
        async fn send_metadata(&mut self, _h: HeaderMap, _flush: bool) -> Result<(), Error> {
            Ok(())
        }
        async fn send_message(&mut self, bytes: Bytes, _meta: MessageMetadata) -> Result<(), Error> {
            self.messages.lock().unwrap().push(bytes);
            Ok(())
        }
        async fn send_end(&mut self, status: Status, _trailers: HeaderMap) -> Result<(), Error> {
            self.ends.lock().unwrap().push(status);
            Ok(())
        }
    }

    fn new_ctx() -> CallContext {
        CallContext::new(HeaderMap::new(), "/svc.S/M".into(), None, None, false, None)
    }

    #[tokio::test]
    async fn unary_happy_path_emits_one_message_and_ok_status() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let messages = Arc::new(Mutex::new(Vec::new()));
                let ends = Arc::new(Mutex::new(Vec::new()));
                let writer = RecordingWriter { messages: messages.clone(), ends: ends.clone() };
                let outbound = OutboundPort::new(InterceptorPipeline::empty(), Box::new(writer));
                let (tx, rx): (InboundSender, InboundReceiver) = mpsc::unbounded_channel();

                let func: UnaryFn<String, String> =
                    Rc::new(|_ctx, req| Box::pin(async move { Ok(format!("hello {req}")) }));

                let args = CallDriveArgs {
                    ctx: new_ctx(),
                    inbound: rx,
                    outbound,
                    error_processor: ErrorProcessor::new(None),
                    request_buffer_limit: None,
                    max_receive_message_length: None,
                    response_queue: None,
                };

                let handle = tokio::task::spawn_local(drive_unary(func, echo_de, echo_ser, args));

                let (ack, fut) = PartAck::pair();
                tx.send((RequestPart::Metadata(HeaderMap::new()), ack)).unwrap();
                fut.await.unwrap().unwrap();

                let (ack, fut) = PartAck::pair();
                tx.send((RequestPart::Message(Bytes::from_static(b"world")), ack)).unwrap();
                fut.await.unwrap().unwrap();

                let (ack, fut) = PartAck::pair();
                tx.send((RequestPart::End, ack)).unwrap();
                fut.await.unwrap().unwrap();

                handle.await.unwrap();

                assert_eq!(messages.lock().unwrap().as_slice(), [Bytes::from_static(b"hello world")]);
                assert_eq!(ends.lock().unwrap().len(), 1);
                assert_eq!(ends.lock().unwrap()[0].code, StatusCode::Ok);
            })
            .await;
    }

    #[tokio::test]
    async fn unary_second_message_is_a_cardinality_violation() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let writer = RecordingWriter {
                    messages: Arc::new(Mutex::new(Vec::new())),
                    ends: Arc::new(Mutex::new(Vec::new())),
                };
                let outbound = OutboundPort::new(InterceptorPipeline::empty(), Box::new(writer));
                let (tx, rx): (InboundSender, InboundReceiver) = mpsc::unbounded_channel();

                let func: UnaryFn<String, String> =
                    Rc::new(|_ctx, req| Box::pin(async move { Ok(req) }));
                let args = CallDriveArgs {
                    ctx: new_ctx(),
                    inbound: rx,
                    outbound,
                    error_processor: ErrorProcessor::new(None),
                    request_buffer_limit: None,
                    max_receive_message_length: None,
                    response_queue: None,
                };
                let handle = tokio::task::spawn_local(drive_unary(func, echo_de, echo_ser, args));

                let (ack, fut) = PartAck::pair();
                tx.send((RequestPart::Metadata(HeaderMap::new()), ack)).unwrap();
                fut.await.unwrap().unwrap();

                let (ack, fut) = PartAck::pair();
                tx.send((RequestPart::Message(Bytes::from_static(b"one")), ack)).unwrap();
                fut.await.unwrap().unwrap();

                let (ack, fut) = PartAck::pair();
                tx.send((RequestPart::Message(Bytes::from_static(b"two")), ack)).unwrap();
                assert!(fut.await.unwrap().is_err());

                handle.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn server_streaming_happy_path_emits_messages_then_status() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let messages = Arc::new(Mutex::new(Vec::new()));
                let ends = Arc::new(Mutex::new(Vec::new()));
                let writer = RecordingWriter { messages: messages.clone(), ends: ends.clone() };
                let outbound = OutboundPort::new(InterceptorPipeline::empty(), Box::new(writer));
                let (tx, rx): (InboundSender, InboundReceiver) = mpsc::unbounded_channel();

                let (ctx, response_queue) = CallContext::new_with_streaming_outbound(
                    HeaderMap::new(),
                    "/svc.S/SS".into(),
                    None,
                    None,
                    false,
                );

                let func: ServerStreamingFn<String, String> = Rc::new(|_ctx, req, sink| {
                    Box::pin(async move {
                        sink.send(&format!("{req}-1"), MessageMetadata::default())?
                            .await
                            .ok();
                        sink.send(&format!("{req}-2"), MessageMetadata::default())?
                            .await
                            .ok();
                        Ok(Status::ok())
                    })
                });

                let args = CallDriveArgs {
                    ctx,
                    inbound: rx,
                    outbound,
                    error_processor: ErrorProcessor::new(None),
                    request_buffer_limit: None,
                    max_receive_message_length: None,
                    response_queue: Some(response_queue),
                };

                let handle =
                    tokio::task::spawn_local(drive_server_streaming(func, echo_de, echo_ser, args));

                let (ack, fut) = PartAck::pair();
                tx.send((RequestPart::Metadata(HeaderMap::new()), ack)).unwrap();
                fut.await.unwrap().unwrap();

                let (ack, fut) = PartAck::pair();
                tx.send((RequestPart::Message(Bytes::from_static(b"x")), ack)).unwrap();
                fut.await.unwrap().unwrap();

                handle.await.unwrap();

                assert_eq!(
                    messages.lock().unwrap().as_slice(),
                    [Bytes::from_static(b"x-1"), Bytes::from_static(b"x-2")]
                );
                assert_eq!(ends.lock().unwrap().len(), 1);
                assert_eq!(ends.lock().unwrap()[0].code, StatusCode::Ok);
            })
            .await;
    }
}
