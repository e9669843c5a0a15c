// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! A minimal in-process transport driving a unary and a server-streaming
//! call through the call pipeline core, to show how a real transport
//! (HTTP/2 framing, wire codecs, connection management — all out of
//! scope for this crate, see spec §1) is expected to wire up
//! [`grpc_callcore::router::Router`].
//!
//! There is no networking here: `PrintingWriter` stands in for the
//! transport's `ResponseWriter`, and parts are submitted to the
//! accepted call directly instead of being parsed off an HTTP/2 stream.

use std::rc::Rc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use grpc_callcore::{
    CallContext, Error, HeaderMap, InterceptorPipeline, MessageMetadata, RequestPart,
    ResponseWriter, Router, ServerConfig, Status,
};
use grpc_callcore::context::ResponseSink;
use grpc_callcore::handler::{ServerStreamingFn, UnaryFn, UserCode};
use grpc_callcore::router::AcceptedCall;
use grpc_callcore::transport::PartAck;

fn ser_string(value: &String, buf: &mut BytesMut) -> Result<(), Error> {
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn de_string(bytes: Bytes) -> Result<String, Error> {
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Prints every outbound part to stdout, the way a transport would
/// otherwise frame it onto the wire (spec §6, "gRPC over HTTP/2").
struct PrintingWriter {
    label: &'static str,
}

#[async_trait]
impl ResponseWriter for PrintingWriter {
    async fn send_metadata(&mut self, _headers: HeaderMap, _flush: bool) -> Result<(), Error> {
        println!("[{}] -> Metadata({{}})", self.label);
        Ok(())
    }

    async fn send_message(&mut self, bytes: Bytes, meta: MessageMetadata) -> Result<(), Error> {
        println!(
            "[{}] -> Message({:?}, compress={}, flush={})",
            self.label,
            String::from_utf8_lossy(&bytes),
            meta.compress,
            meta.flush
        );
        Ok(())
    }

    async fn send_end(&mut self, status: Status, _trailers: HeaderMap) -> Result<(), Error> {
        println!("[{}] -> End({}, {:?})", self.label, status.code, status.message);
        Ok(())
    }
}

async fn submit(handle: &grpc_callcore::router::CallHandle, part: RequestPart) {
    let (ack, fut) = PartAck::pair();
    handle.submit(part, ack).await;
    fut.await.ok();
}

async fn run_unary_echo(router: &Router) {
    let writer: Box<dyn ResponseWriter> = Box::new(PrintingWriter { label: "unary" });
    let AcceptedCall { handle, drive } = router
        .accept("/demo.Echo/Say", HeaderMap::new(), None, None, writer)
        .expect("route registered below");

    let driver = tokio::task::spawn_local(drive);
    submit(&handle, RequestPart::Metadata(HeaderMap::new())).await;
    submit(&handle, RequestPart::Message(Bytes::from_static(b"hello"))).await;
    submit(&handle, RequestPart::End).await;
    driver.await.unwrap();
}

async fn run_server_streaming_count(router: &Router) {
    let writer: Box<dyn ResponseWriter> = Box::new(PrintingWriter { label: "stream" });
    let AcceptedCall { handle, drive } = router
        .accept("/demo.Echo/CountTo", HeaderMap::new(), None, None, writer)
        .expect("route registered below");

    let driver = tokio::task::spawn_local(drive);
    submit(&handle, RequestPart::Metadata(HeaderMap::new())).await;
    submit(&handle, RequestPart::Message(Bytes::from_static(b"3"))).await;
    submit(&handle, RequestPart::End).await;
    driver.await.unwrap();
}

fn build_router() -> Router {
    let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());

    let say: UnaryFn<String, String> =
        Rc::new(|_ctx: CallContext, req: String| Box::pin(async move { Ok(format!("echo: {req}")) }));
    router.register(
        "/demo.Echo/Say",
        de_string,
        ser_string,
        UserCode::Unary(say),
    );

    let count_to: ServerStreamingFn<String, String> = Rc::new(
        |_ctx: CallContext, req: String, sink: ResponseSink<String>| {
            Box::pin(async move {
                let n: u32 = req.parse().unwrap_or(0);
                for i in 1..=n {
                    if let Ok(fut) = sink.send(&i.to_string(), MessageMetadata::default()) {
                        let _ = fut.await;
                    }
                }
                Ok(Status::ok())
            })
        },
    );
    router.register(
        "/demo.Echo/CountTo",
        de_string,
        ser_string,
        UserCode::ServerStreaming(count_to),
    );

    router
}

fn main() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("build demo runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async {
        let router = build_router();
        run_unary_echo(&router).await;
        run_server_streaming_count(&router).await;
    });
}
