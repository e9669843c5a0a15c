// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! End-to-end scenarios, one per literal case in the call pipeline's
//! acceptance suite: a `Router` is built, a call is driven through its
//! `CallHandle` exactly as a transport would, and the parts a
//! `ResponseWriter` receives are asserted against the expected wire
//! sequence.

use std::rc::Rc;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use grpc_callcore::context::ResponseSink;
use grpc_callcore::handler::{BidiFactory, ServerStreamingFn, StreamObserver, UnaryFn, UserCode};
use grpc_callcore::router::AcceptedCall;
use grpc_callcore::transport::PartAck;
use grpc_callcore::{
    CallContext, Error, HeaderMap, InterceptorPipeline, MessageMetadata, RequestPart,
    ResponsePart, ResponseWriter, Router, ServerConfig, Status, StatusCode,
};

fn ser_string(value: &String, buf: &mut BytesMut) -> Result<(), Error> {
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn de_string(bytes: Bytes) -> Result<String, Error> {
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Default)]
struct Recording {
    parts: Mutex<Vec<ResponsePart>>,
}

struct RecordingWriter {
    recording: Arc<Recording>,
}

#[async_trait]
impl ResponseWriter for RecordingWriter {
    async fn send_metadata(&mut self, headers: HeaderMap, _flush: bool) -> Result<(), Error> {
        self.recording.parts.lock().unwrap().push(ResponsePart::Metadata(headers));
        Ok(())
    }

    async fn send_message(&mut self, bytes: Bytes, meta: MessageMetadata) -> Result<(), Error> {
        self.recording.parts.lock().unwrap().push(ResponsePart::Message(bytes, meta));
        Ok(())
    }

    async fn send_end(&mut self, status: Status, trailers: HeaderMap) -> Result<(), Error> {
        self.recording.parts.lock().unwrap().push(ResponsePart::End(status, trailers));
        Ok(())
    }
}

async fn submit(handle: &grpc_callcore::router::CallHandle, part: RequestPart) {
    let (ack, fut) = PartAck::pair();
    handle.submit(part, ack).await;
    let _ = fut.await;
}

fn messages_and_end(recording: &Recording) -> (Vec<String>, Status) {
    let parts = recording.parts.lock().unwrap();
    let mut messages = Vec::new();
    let mut end = None;
    for part in parts.iter() {
        match part {
            ResponsePart::Message(bytes, _) => messages.push(String::from_utf8_lossy(bytes).into_owned()),
            ResponsePart::End(status, _) => end = Some(status.clone()),
            ResponsePart::Metadata(_) => {}
        }
    }
    (messages, end.expect("every scenario below drives the call to End"))
}

/// S1: unary happy path.
#[tokio::test]
async fn s1_unary_happy_path() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
            let func: UnaryFn<String, String> =
                Rc::new(|_ctx, req| Box::pin(async move { Ok(format!("{req}-ok")) }));
            router.register("/svc.S/U", de_string, ser_string, UserCode::Unary(func));

            let recording = Arc::new(Recording::default());
            let writer = Box::new(RecordingWriter { recording: recording.clone() });
            let AcceptedCall { handle, drive } = router
                .accept("/svc.S/U", HeaderMap::new(), None, None, writer)
                .unwrap();
            let join = tokio::task::spawn_local(drive);

            submit(&handle, RequestPart::Metadata(HeaderMap::new())).await;
            submit(&handle, RequestPart::Message(Bytes::from_static(b"x"))).await;
            submit(&handle, RequestPart::End).await;
            join.await.unwrap();

            let (messages, end) = messages_and_end(&recording);
            assert_eq!(messages, vec!["x-ok".to_string()]);
            assert_eq!(end.code, StatusCode::Ok);
        })
        .await;
}

/// S2: a second message on a unary call is a cardinality violation;
/// the user function runs at most once.
#[tokio::test]
async fn s2_unary_too_many_messages() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let invocations = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            let invocations2 = invocations.clone();
            let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
            let func: UnaryFn<String, String> = Rc::new(move |_ctx, req| {
                invocations2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async move { Ok(req) })
            });
            router.register("/svc.S/U", de_string, ser_string, UserCode::Unary(func));

            let recording = Arc::new(Recording::default());
            let writer = Box::new(RecordingWriter { recording: recording.clone() });
            let AcceptedCall { handle, drive } = router
                .accept("/svc.S/U", HeaderMap::new(), None, None, writer)
                .unwrap();
            let join = tokio::task::spawn_local(drive);

            submit(&handle, RequestPart::Metadata(HeaderMap::new())).await;
            submit(&handle, RequestPart::Message(Bytes::from_static(b"m1"))).await;
            submit(&handle, RequestPart::Message(Bytes::from_static(b"m2"))).await;
            join.await.unwrap();

            let (messages, end) = messages_and_end(&recording);
            assert!(messages.is_empty());
            assert_eq!(end.code, StatusCode::Internal);
            assert_eq!(invocations.load(std::sync::atomic::Ordering::SeqCst), 1);
        })
        .await;
}

/// S3: a unary call that closes without ever sending a message ends
/// `INTERNAL` without invoking user code.
#[tokio::test]
async fn s3_unary_no_message() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let invoked2 = invoked.clone();
            let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
            let func: UnaryFn<String, String> = Rc::new(move |_ctx, req| {
                invoked2.store(true, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async move { Ok(req) })
            });
            router.register("/svc.S/U", de_string, ser_string, UserCode::Unary(func));

            let recording = Arc::new(Recording::default());
            let writer = Box::new(RecordingWriter { recording: recording.clone() });
            let AcceptedCall { handle, drive } = router
                .accept("/svc.S/U", HeaderMap::new(), None, None, writer)
                .unwrap();
            let join = tokio::task::spawn_local(drive);

            submit(&handle, RequestPart::Metadata(HeaderMap::new())).await;
            submit(&handle, RequestPart::End).await;
            join.await.unwrap();

            let (messages, end) = messages_and_end(&recording);
            assert!(messages.is_empty());
            assert_eq!(end.code, StatusCode::Internal);
            assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
        })
        .await;
}

struct SummingObserver {
    sum: i64,
}

#[async_trait::async_trait(?Send)]
impl StreamObserver<String, String> for SummingObserver {
    async fn on_message(&mut self, msg: String) -> Result<(), Error> {
        self.sum += msg.parse::<i64>().unwrap_or(0);
        Ok(())
    }

    async fn on_end(self: Box<Self>) -> Result<String, Error> {
        Ok(self.sum.to_string())
    }
}

/// S4: client-streaming messages that arrive before the observer
/// factory resolves are buffered and delivered in arrival order.
#[tokio::test]
async fn s4_client_streaming_pre_observer_buffering() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
            let factory: grpc_callcore::handler::ObserverFactory<String, String> = Rc::new(|_ctx| {
                Box::pin(async move {
                    // Models an async factory (e.g. authentication) that
                    // resolves only after every inbound part has already
                    // queued up.
                    tokio::task::yield_now().await;
                    tokio::task::yield_now().await;
                    Ok(Box::new(SummingObserver { sum: 0 }) as Box<dyn StreamObserver<String, String>>)
                })
            });
            router.register(
                "/svc.S/C",
                de_string,
                ser_string,
                UserCode::ClientStreaming(factory),
            );

            let recording = Arc::new(Recording::default());
            let writer = Box::new(RecordingWriter { recording: recording.clone() });
            let AcceptedCall { handle, drive } = router
                .accept("/svc.S/C", HeaderMap::new(), None, None, writer)
                .unwrap();
            let join = tokio::task::spawn_local(drive);

            submit(&handle, RequestPart::Metadata(HeaderMap::new())).await;
            submit(&handle, RequestPart::Message(Bytes::from_static(b"1"))).await;
            submit(&handle, RequestPart::Message(Bytes::from_static(b"2"))).await;
            submit(&handle, RequestPart::End).await;
            join.await.unwrap();

            let (messages, end) = messages_and_end(&recording);
            assert_eq!(messages, vec!["3".to_string()]);
            assert_eq!(end.code, StatusCode::Ok);
        })
        .await;
}

/// S5: a server-streaming handler sends two responses then completes
/// with a non-OK status; both responses still reach the wire before
/// `End`.
#[tokio::test]
async fn s5_server_streaming_user_cancels_mid_stream() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
            let func: ServerStreamingFn<String, String> =
                Rc::new(|_ctx, _req, sink: ResponseSink<String>| {
                    Box::pin(async move {
                        sink.send(&"r1".to_string(), MessageMetadata::default())
                            .unwrap()
                            .await
                            .ok();
                        sink.send(&"r2".to_string(), MessageMetadata::default())
                            .unwrap()
                            .await
                            .ok();
                        Ok(Status::new(StatusCode::Cancelled, "user"))
                    })
                });
            router.register(
                "/svc.S/SS",
                de_string,
                ser_string,
                UserCode::ServerStreaming(func),
            );

            let recording = Arc::new(Recording::default());
            let writer = Box::new(RecordingWriter { recording: recording.clone() });
            let AcceptedCall { handle, drive } = router
                .accept("/svc.S/SS", HeaderMap::new(), None, None, writer)
                .unwrap();
            let join = tokio::task::spawn_local(drive);

            submit(&handle, RequestPart::Metadata(HeaderMap::new())).await;
            submit(&handle, RequestPart::Message(Bytes::from_static(b"req"))).await;
            join.await.unwrap();

            let (messages, end) = messages_and_end(&recording);
            assert_eq!(messages, vec!["r1".to_string(), "r2".to_string()]);
            assert_eq!(end.code, StatusCode::Cancelled);
            assert_eq!(end.message.as_deref(), Some("user"));
        })
        .await;
}

struct NeverEndingObserver;

#[async_trait::async_trait(?Send)]
impl StreamObserver<String, Status> for NeverEndingObserver {
    async fn on_message(&mut self, _msg: String) -> Result<(), Error> {
        Ok(())
    }

    async fn on_end(self: Box<Self>) -> Result<Status, Error> {
        // Never actually reached in the S6 scenario: the call handle
        // is dropped (modeling a transport reset) before request End
        // arrives.
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// S6: dropping the call handle models a transport-level reset; the
/// call still reaches exactly one `End`, with `UNAVAILABLE`.
#[tokio::test]
async fn s6_bidi_transport_reset_after_first_response() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
            let factory: BidiFactory<String, String> = Rc::new(|_ctx, sink: ResponseSink<String>| {
                Box::pin(async move {
                    sink.send(&"r1".to_string(), MessageMetadata::default())
                        .unwrap()
                        .await
                        .ok();
                    Ok(Box::new(NeverEndingObserver) as Box<dyn StreamObserver<String, Status>>)
                })
            });
            router.register(
                "/svc.S/BD",
                de_string,
                ser_string,
                UserCode::BidirectionalStreaming(factory),
            );

            let recording = Arc::new(Recording::default());
            let writer = Box::new(RecordingWriter { recording: recording.clone() });
            let AcceptedCall { handle, drive } = router
                .accept("/svc.S/BD", HeaderMap::new(), None, None, writer)
                .unwrap();
            let join = tokio::task::spawn_local(drive);

            submit(&handle, RequestPart::Metadata(HeaderMap::new())).await;
            submit(&handle, RequestPart::Message(Bytes::from_static(b"m1"))).await;
            // Give the observer factory's response a chance to land
            // before simulating the reset.
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;

            // Transport-level stream reset: the inbound side closes
            // without a request End ever arriving.
            drop(handle);
            join.await.unwrap();

            let (messages, end) = messages_and_end(&recording);
            assert_eq!(messages, vec!["r1".to_string()]);
            assert_eq!(end.code, StatusCode::Unavailable);
        })
        .await;
}

/// `CallHandle::receive_error` arriving before `Metadata` ever does:
/// the call never reaches `CreatedContext`, but it still owes the wire
/// exactly one `End`, synthesized from the delivered error (spec §7's
/// general propagation rule; exercises the `InitialMetadata::Aborted`
/// path fed by `RequestPart::Error`, not just a stray illegal part).
#[tokio::test]
async fn s7_receive_error_before_metadata() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let invoked = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let invoked2 = invoked.clone();
            let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
            let func: UnaryFn<String, String> = Rc::new(move |_ctx, req| {
                invoked2.store(true, std::sync::atomic::Ordering::SeqCst);
                Box::pin(async move { Ok(req) })
            });
            router.register("/svc.S/U", de_string, ser_string, UserCode::Unary(func));

            let recording = Arc::new(Recording::default());
            let writer = Box::new(RecordingWriter { recording: recording.clone() });
            let AcceptedCall { handle, drive } = router
                .accept("/svc.S/U", HeaderMap::new(), None, None, writer)
                .unwrap();
            let join = tokio::task::spawn_local(drive);

            handle.receive_error(Error::Library("transport reset before headers".into())).await;
            join.await.unwrap();

            let (messages, end) = messages_and_end(&recording);
            assert!(messages.is_empty());
            assert_eq!(end.code, StatusCode::Internal);
            assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
        })
        .await;
}

/// `CallHandle::receive_error` arriving mid-call, after `Metadata` has
/// already been observed: the in-flight user future's eventual
/// resolution (if any) is dropped, and the call still reaches exactly
/// one `End`, synthesized from the delivered error.
#[tokio::test]
async fn s8_receive_error_mid_call() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
            let func: UnaryFn<String, String> =
                Rc::new(|_ctx, req| Box::pin(async move { Ok(req) }));
            router.register("/svc.S/U", de_string, ser_string, UserCode::Unary(func));

            let recording = Arc::new(Recording::default());
            let writer = Box::new(RecordingWriter { recording: recording.clone() });
            let AcceptedCall { handle, drive } = router
                .accept("/svc.S/U", HeaderMap::new(), None, None, writer)
                .unwrap();
            let join = tokio::task::spawn_local(drive);

            submit(&handle, RequestPart::Metadata(HeaderMap::new())).await;
            handle.receive_error(Error::Library("transport reset mid-call".into())).await;
            join.await.unwrap();

            let (messages, end) = messages_and_end(&recording);
            assert!(messages.is_empty());
            assert_eq!(end.code, StatusCode::Internal);
        })
        .await;
}
