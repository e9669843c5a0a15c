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

//! `ServerConfig` (spec §6): the small set of knobs a caller can tune
//! before handing a [`crate::router::Router`] to a transport.
//!
//! Mirrors the teacher's `ChannelBuilder`/`ServerBuilder`
//! (`channel_ref.rs`, `server_ref.rs`) consuming fluent-builder idiom —
//! each setter takes `self` by value and returns `Self`, so a config is
//! assembled with a single chained expression and `build()` finalizes
//! it into the immutable value the rest of the core reads from.

use std::sync::Arc;

use crate::error_processor::ErrorDelegate;

/// Immutable, fully-resolved server configuration (spec §6).
#[derive(Clone, Default)]
pub struct ServerConfig {
    server_compression_enabled: bool,
    max_receive_message_length: Option<usize>,
    request_buffer_limit: Option<usize>,
    error_delegate: Option<Arc<dyn ErrorDelegate>>,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn server_compression_enabled(&self) -> bool {
        self.server_compression_enabled
    }

    pub fn max_receive_message_length(&self) -> Option<usize> {
        self.max_receive_message_length
    }

    /// Cap on how many request messages an observer-based handler
    /// (client-streaming / bidi) will buffer before the user's factory
    /// future has resolved (spec §4.5.2/§4.5.4, §9 Open Question:
    /// unbounded buffering is opt-in, not the default — `None` here
    /// means "no cap," which a caller must choose explicitly).
    pub fn request_buffer_limit(&self) -> Option<usize> {
        self.request_buffer_limit
    }

    pub fn error_delegate(&self) -> Option<Arc<dyn ErrorDelegate>> {
        self.error_delegate.clone()
    }
}

/// Consuming builder for [`ServerConfig`] (teacher idiom: see
/// `ChannelBuilder` in `channel_ref.rs`).
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: ServerConfig::default(),
        }
    }

    /// Enable advisory compression of outbound messages. Still requires
    /// the per-call opt-in via `CallContext::set_compression` — both
    /// flags must be set (spec §3).
    pub fn server_compression_enabled(mut self, enabled: bool) -> ServerConfigBuilder {
        self.config.server_compression_enabled = enabled;
        self
    }

    pub fn max_receive_message_length(mut self, bytes: usize) -> ServerConfigBuilder {
        self.config.max_receive_message_length = Some(bytes);
        self
    }

    /// Explicit opt-in to a bounded pre-observer request buffer. Leave
    /// unset to buffer without limit (spec §9 Open Question resolution
    /// — see DESIGN.md).
    pub fn request_buffer_limit(mut self, limit: usize) -> ServerConfigBuilder {
        self.config.request_buffer_limit = Some(limit);
        self
    }

    pub fn error_delegate(mut self, delegate: Arc<dyn ErrorDelegate>) -> ServerConfigBuilder {
        self.config.error_delegate = Some(delegate);
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}
