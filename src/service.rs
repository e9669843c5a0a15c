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

//! `RegistrableService` (spec §4.7, §6): the trait a generated (or
//! hand-written) service implementation satisfies so it can be folded
//! into a [`crate::router::Router`] with one call.
//!
//! Grounded in the teacher's `ServiceBuilder::add_unary_handler` /
//! `add_server_streaming_handler` family (`server_ref.rs`): codegen
//! there emits one `add_*_handler` call per method against a builder
//! accumulating into a `Service`. Here codegen (or a hand-written impl)
//! instead emits one `register_methods` body calling
//! `Router::register` per method directly — one trait method instead of
//! N builder calls threaded through an intermediate `ServiceBuilder`
//! type, since `Router` already *is* the accumulator.

use crate::router::Router;

/// Implemented by a service's generated (or hand-written) server-side
/// stub: one method that registers every RPC the service declares onto
/// a [`Router`].
pub trait RegistrableService {
    fn register_methods(self, router: &mut Router);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeserializeFn;
    use crate::config::ServerConfig;
    use crate::error::Error;
    use crate::handler::{UnaryFn, UserCode};
    use crate::interceptor::InterceptorPipeline;
    use crate::metadata::HeaderMap;
    use crate::status::StatusCode;
    use bytes::{Bytes, BytesMut};

    fn echo_ser(value: &String, buf: &mut BytesMut) -> Result<(), Error> {
        buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn echo_de(bytes: Bytes) -> Result<String, Error> {
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    struct Greeter;

    impl RegistrableService for Greeter {
        fn register_methods(self, router: &mut Router) {
            let func: UnaryFn<String, String> =
                std::rc::Rc::new(|_ctx, req| Box::pin(async move { Ok(format!("hello {req}")) }));
            router.register("/greet.Greeter/Hello", echo_de as DeserializeFn<String>, echo_ser, UserCode::Unary(func));
        }
    }

    #[test]
    fn register_methods_populates_the_router() {
        let mut router = Router::new(InterceptorPipeline::empty(), ServerConfig::builder().build());
        Greeter.register_methods(&mut router);

        struct NoopWriter;
        #[async_trait::async_trait]
        impl crate::transport::ResponseWriter for NoopWriter {
            async fn send_metadata(&mut self, _h: HeaderMap, _flush: bool) -> Result<(), Error> {
                Ok(())
            }
            async fn send_message(
                &mut self,
                _bytes: Bytes,
                _meta: crate::transport::MessageMetadata,
            ) -> Result<(), Error> {
                Ok(())
            }
            async fn send_end(
                &mut self,
                _status: crate::status::Status,
                _trailers: HeaderMap,
            ) -> Result<(), Error> {
                Ok(())
            }
        }

        let missing = router
            .accept("/greet.Greeter/Goodbye", HeaderMap::new(), None, None, Box::new(NoopWriter))
            .unwrap_err();
        assert_eq!(missing.code, StatusCode::Unimplemented);

        let accepted = router.accept("/greet.Greeter/Hello", HeaderMap::new(), None, None, Box::new(NoopWriter));
        assert!(accepted.is_ok());
    }
}
