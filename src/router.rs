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

//! `Router` (spec §4.7): maps an inbound call's `:path` to the
//! registered handler for that method, or answers `UNIMPLEMENTED`
//! directly if nothing is registered.
//!
//! Grounded in the teacher's `Server`/`ServiceBuilder` registration
//! idiom (`server_ref.rs`): methods are registered once up front behind
//! a type-erased callback keyed by path, and dispatch is a single
//! `HashMap` lookup. The teacher's callback is `Box<Fn(RpcContext,
//! &[u8])>`, erasing only the request bytes; this router erases the
//! whole per-call setup (`CallDriveArgs` construction included) behind
//! one `Fn(CallDriveArgs) -> LocalBoxFuture<'static, ()>` per route, so
//! that `register` stays generic over `P`/`Q` while `accept` does not
//! need to be.

use std::collections::HashMap;
use std::time::Instant;

use futures::future::LocalBoxFuture;
use tokio::sync::mpsc;

use crate::codec::{DeserializeFn, SerializeFn};
use crate::config::ServerConfig;
use crate::context::CallContext;
use crate::error_processor::ErrorProcessor;
use crate::handler::{
    drive_bidirectional_streaming, drive_client_streaming, drive_server_streaming, drive_unary,
    CallDriveArgs, CallType, InboundItem, InboundSender, OutboundPort, UserCode,
};
use crate::interceptor::InterceptorPipeline;
use crate::metadata::HeaderMap;
use crate::status::{Status, StatusCode};
use crate::transport::{PartAck, RequestPart, ResponseWriter};

type Spawn = Box<dyn Fn(CallDriveArgs) -> LocalBoxFuture<'static, ()>>;

struct RouteEntry {
    call_type: CallType,
    spawn: Spawn,
}

/// Registry of method handlers plus the interceptor chain and config
/// shared by every call the router accepts.
pub struct Router {
    routes: HashMap<String, RouteEntry>,
    interceptors: InterceptorPipeline,
    config: ServerConfig,
}

impl Router {
    pub fn new(interceptors: InterceptorPipeline, config: ServerConfig) -> Router {
        Router {
            routes: HashMap::new(),
            interceptors,
            config,
        }
    }

    /// Register the user code for one method, keyed by its full path
    /// (e.g. `/package.Service/Method`).
    pub fn register<P: 'static, Q: 'static>(
        &mut self,
        path: impl Into<String>,
        de: DeserializeFn<P>,
        ser: SerializeFn<Q>,
        code: UserCode<P, Q>,
    ) {
        let call_type = code.call_type();
        let spawn: Spawn = match code {
            UserCode::Unary(func) => {
                Box::new(move |args| Box::pin(drive_unary(func.clone(), de, ser, args)))
            }
            UserCode::ClientStreaming(factory) => {
                Box::new(move |args| Box::pin(drive_client_streaming(factory.clone(), de, ser, args)))
            }
            UserCode::ServerStreaming(func) => {
                Box::new(move |args| Box::pin(drive_server_streaming(func.clone(), de, ser, args)))
            }
            UserCode::BidirectionalStreaming(factory) => Box::new(move |args| {
                Box::pin(drive_bidirectional_streaming(factory.clone(), de, ser, args))
            }),
        };
        self.routes.insert(path.into(), RouteEntry { call_type, spawn });
    }

    /// Look up `path` and, if registered, build the `CallContext` and
    /// `CallDriveArgs` for a fresh call and hand back an [`AcceptedCall`]
    /// the transport can feed request parts into and drive to
    /// completion.
    ///
    /// An unknown path answers `UNIMPLEMENTED` directly without ever
    /// constructing a context or spawning anything (spec §4.7).
    pub fn accept(
        &self,
        path: &str,
        headers: HeaderMap,
        remote_address: Option<String>,
        deadline: Option<Instant>,
        writer: Box<dyn ResponseWriter>,
    ) -> Result<AcceptedCall, Status> {
        let entry = self
            .routes
            .get(path)
            .ok_or_else(|| Status::with_code(StatusCode::Unimplemented))?;

        let server_compression_enabled = self.config.server_compression_enabled();
        let (ctx, response_queue) = match entry.call_type {
            CallType::ServerStreaming | CallType::BidirectionalStreaming => {
                let (ctx, rx) = CallContext::new_with_streaming_outbound(
                    headers,
                    path.to_string(),
                    remote_address,
                    deadline,
                    server_compression_enabled,
                );
                (ctx, Some(rx))
            }
            CallType::Unary | CallType::ClientStreaming => {
                let ctx = CallContext::new(
                    headers,
                    path.to_string(),
                    remote_address,
                    deadline,
                    server_compression_enabled,
                    None,
                );
                (ctx, None)
            }
        };

        let (inbound_tx, inbound_rx): (InboundSender, _) = mpsc::unbounded_channel();
        let outbound = OutboundPort::new(self.interceptors.clone(), writer);
        let args = CallDriveArgs {
            ctx,
            inbound: inbound_rx,
            outbound,
            error_processor: ErrorProcessor::new(self.config.error_delegate()),
            request_buffer_limit: self.config.request_buffer_limit(),
            max_receive_message_length: self.config.max_receive_message_length(),
            response_queue,
        };
        let drive = (entry.spawn)(args);

        Ok(AcceptedCall {
            handle: CallHandle {
                interceptors: self.interceptors.clone(),
                inbound: inbound_tx,
            },
            drive,
        })
    }
}

/// One accepted call, split into the piece the transport feeds
/// [`RequestPart`]s into (`handle`) and the future that drives the call
/// to `End` (`drive`, spawned onto [`crate::executor`]).
///
/// Kept as two independently-owned fields rather than one type with a
/// `submit` method and an internal future, so the transport can hand
/// `drive` off to the executor while retaining `handle` for the
/// lifetime of the call.
pub struct AcceptedCall {
    pub handle: CallHandle,
    pub drive: LocalBoxFuture<'static, ()>,
}

/// The submission side of an [`AcceptedCall`]: threads inbound parts
/// through the request-side interceptor chain before they reach the
/// handler's channel.
pub struct CallHandle {
    interceptors: InterceptorPipeline,
    inbound: InboundSender,
}

impl CallHandle {
    pub async fn submit(&self, part: RequestPart, ack: PartAck) {
        let sink = ChannelSink { tx: self.inbound.clone() };
        self.interceptors.dispatch_request(part, ack, &sink).await;
    }

    /// Deliver a transport-originated fault — an HTTP/2 stream reset, a
    /// deadline injected by an interceptor, anything that isn't a
    /// legal `Metadata`/`Message`/`End` part — that terminates the call
    /// immediately (spec §5, §6: `receive_error`).
    pub async fn receive_error(&self, err: crate::error::Error) {
        let (ack, _fut) = PartAck::pair();
        self.submit(RequestPart::Error(err), ack).await;
    }

    /// The last signal a transport delivers at call teardown (spec §5,
    /// §6: `finish`). Consumes the handle, closing the inbound channel;
    /// a call not yet `Completed` observes this the same way it would
    /// observe any other transport hangup — `End(UNAVAILABLE)` — via the
    /// `drive_*` loop's `None` branch on `inbound.recv()`. Tolerated if
    /// the call already reached `End` on its own.
    pub fn finish(self) {
        drop(self);
    }
}

struct ChannelSink {
    tx: InboundSender,
}

#[async_trait::async_trait]
impl crate::interceptor::RequestSink for ChannelSink {
    async fn deliver(&self, part: RequestPart, ack: PartAck) {
        let item: InboundItem = (part, ack);
        if let Err(e) = self.tx.send(item) {
            e.0 .1.fulfill_already_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use bytes::{Bytes, BytesMut};
    use std::sync::{Arc, Mutex};

    fn echo_ser(value: &String, buf: &mut BytesMut) -> Result<(), Error> {
        buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn echo_de(bytes: Bytes) -> Result<String, Error> {
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    struct RecordingWriter {
        ends: Arc<Mutex<Vec<crate::status::Status>>>,
    }

    #[async_trait::async_trait]
    impl ResponseWriter for RecordingWriter {
        async fn send_metadata(&mut self, _h: HeaderMap, _flush: bool) -> Result<(), Error> {
            Ok(())
        }
        async fn send_message(&mut self, _bytes: Bytes, _meta: crate::transport::MessageMetadata) -> Result<(), Error> {
            Ok(())
        }
        async fn send_end(&mut self, status: crate::status::Status, _trailers: HeaderMap) -> Result<(), Error> {
            self.ends.lock().unwrap().push(status);
            Ok(())
        }
    }

    #[test]
    fn unknown_path_is_unimplemented_without_invoking_anything() {
        let router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
        let ends = Arc::new(Mutex::new(Vec::new()));
        let writer = Box::new(RecordingWriter { ends });
        let err = router
            .accept("/missing.Service/Method", HeaderMap::new(), None, None, writer)
            .unwrap_err();
        assert_eq!(err.code, StatusCode::Unimplemented);
    }

    #[tokio::test]
    async fn registered_unary_route_drives_to_completion() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
                let func: crate::handler::UnaryFn<String, String> =
                    std::rc::Rc::new(|_ctx, req| Box::pin(async move { Ok(req) }));
                router.register("/svc.S/M", echo_de, echo_ser, UserCode::Unary(func));

                let ends = Arc::new(Mutex::new(Vec::new()));
                let writer = Box::new(RecordingWriter { ends: ends.clone() });
                let accepted = router
                    .accept("/svc.S/M", HeaderMap::new(), None, None, writer)
                    .unwrap();

                let AcceptedCall { handle, drive } = accepted;
                let join = tokio::task::spawn_local(drive);

                let (ack, fut) = PartAck::pair();
                handle.submit(RequestPart::Metadata(HeaderMap::new()), ack).await;
                fut.await.unwrap().unwrap();

                let (ack, fut) = PartAck::pair();
                handle
                    .submit(RequestPart::Message(Bytes::from_static(b"hi")), ack)
                    .await;
                fut.await.unwrap().unwrap();

                let (ack, fut) = PartAck::pair();
                handle.submit(RequestPart::End, ack).await;
                fut.await.unwrap().unwrap();

                join.await.unwrap();
                assert_eq!(ends.lock().unwrap()[0].code, StatusCode::Ok);
            })
            .await;
    }
}
