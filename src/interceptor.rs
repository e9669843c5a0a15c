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

//! `InterceptorPipeline` (spec §4.4): an ordered chain of user
//! interceptors sitting between the transport and the handler.
//!
//! The teacher has no analogous concept — `grpc-sys` hands parts
//! straight to the handler. This is built fresh, but the "don't lose
//! an in-flight ack" discipline is modeled on the teacher's
//! `StreamingBase`/`SinkBase` stale-future guard (`call/mod.rs`): just
//! as a stale `BatchFuture` there must never be polled twice, a
//! `PartAck` here must never be silently dropped — each interceptor
//! either forwards it to `next` or settles it itself, exactly once.

use std::sync::Arc;

use async_trait::async_trait;

use crate::transport::{PartAck, RequestPart, ResponsePart};

/// A user-supplied middleware stage. Default methods simply forward,
/// so an interceptor only needs to override the edge it cares about
/// (spec §9: "model as an interface with default no-op methods").
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn on_request_part(&self, part: RequestPart, ack: PartAck, next: RequestNext<'_>) {
        next.call(part, ack).await
    }

    async fn on_response_part(&self, part: ResponsePart, ack: PartAck, next: ResponseNext<'_>) {
        next.call(part, ack).await
    }
}

/// The continuation passed to an interceptor's request-side edge.
///
/// Calling `next.call(part, ack)` either hands off to the next
/// interceptor in the chain, or — once the chain is exhausted —
/// delivers the part straight to the handler's inbound sink.
pub struct RequestNext<'a> {
    remaining: &'a [Arc<dyn Interceptor>],
    sink: &'a dyn RequestSink,
}

#[async_trait]
pub(crate) trait RequestSink: Send + Sync {
    async fn deliver(&self, part: RequestPart, ack: PartAck);
}

impl<'a> RequestNext<'a> {
    pub async fn call(self, part: RequestPart, ack: PartAck) {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = RequestNext {
                    remaining: rest,
                    sink: self.sink,
                };
                head.on_request_part(part, ack, next).await;
            }
            None => self.sink.deliver(part, ack).await,
        }
    }
}

/// The continuation passed to an interceptor's response-side edge.
pub struct ResponseNext<'a> {
    remaining: &'a [Arc<dyn Interceptor>],
    sink: &'a dyn ResponseSink,
}

#[async_trait]
pub(crate) trait ResponseSink: Send + Sync {
    async fn deliver(&self, part: ResponsePart, ack: PartAck);
}

impl<'a> ResponseNext<'a> {
    pub async fn call(self, part: ResponsePart, ack: PartAck) {
        match self.remaining.split_first() {
            Some((head, rest)) => {
                let next = ResponseNext {
                    remaining: rest,
                    sink: self.sink,
                };
                head.on_response_part(part, ack, next).await;
            }
            None => self.sink.deliver(part, ack).await,
        }
    }
}

/// Ordered chain of interceptors for one call. Dismantled (dropped)
/// once `End` has reached the transport, to break the
/// context↔handler↔interceptors reference cycle the teacher avoids by
/// nulling out raw pointers on completion (spec §3, §4.4, §9).
#[derive(Clone, Default)]
pub struct InterceptorPipeline {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorPipeline {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> InterceptorPipeline {
        InterceptorPipeline { interceptors }
    }

    pub fn empty() -> InterceptorPipeline {
        InterceptorPipeline::default()
    }

    pub(crate) async fn dispatch_request(
        &self,
        part: RequestPart,
        ack: PartAck,
        sink: &dyn RequestSink,
    ) {
        let next = RequestNext {
            remaining: &self.interceptors,
            sink,
        };
        next.call(part, ack).await
    }

    pub(crate) async fn dispatch_response(
        &self,
        part: ResponsePart,
        ack: PartAck,
        sink: &dyn ResponseSink,
    ) {
        let next = ResponseNext {
            remaining: &self.interceptors,
            sink,
        };
        next.call(part, ack).await
    }
}
