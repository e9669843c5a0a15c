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

//! A transport-agnostic gRPC server-side call pipeline.
//!
//! This crate owns everything between "bytes of one request part
//! arrived on some connection" and "bytes of the matching response
//! parts are ready to write back": request/response framing rules
//! (`state`), typed (de)serialization (`codec`), per-call shared state
//! (`context`), user-pluggable middleware (`interceptor`), routing by
//! method path (`router`), the four call-cardinality drive loops
//! (`handler`), and uniform error-to-status mapping (`error_processor`).
//!
//! It does not open sockets, speak HTTP/2, or choose a wire encoding —
//! a transport wires a [`router::Router`] to its connections by
//! implementing [`transport::ResponseWriter`] and feeding
//! [`transport::RequestPart`]s into the [`router::CallHandle`] an
//! accepted call hands back.

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod error_processor;
pub mod executor;
pub mod handler;
pub mod interceptor;
pub mod metadata;
pub mod router;
pub mod service;
pub mod state;
pub mod status;
pub mod transport;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use context::CallContext;
pub use error::{Error, Result};
pub use error_processor::{ErrorDelegate, ErrorProcessor};
pub use executor::{CallExecutor, CallExecutorPool};
pub use handler::{CallType, UserCode};
pub use interceptor::{Interceptor, InterceptorPipeline};
pub use metadata::HeaderMap;
pub use router::{AcceptedCall, CallHandle, Router};
pub use status::{Status, StatusCode};
pub use transport::{MessageMetadata, RequestPart, ResponsePart, ResponseWriter};
