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

//! `HeaderMap` (spec §3): an ordered multimap of request/response
//! metadata, ASCII case-insensitive by name, with support for binary
//! (`-bin` suffixed) values.
//!
//! Built on top of [`http::HeaderMap`] rather than a hand-rolled
//! association list — the crate already carries HPACK-compatible
//! case-insensitivity and multi-value-per-name semantics, which is
//! exactly what spec §3 asks for.

use http::header::{HeaderName, HeaderValue};
use http::HeaderMap as InnerMap;

use crate::error::Error;

/// Ordered multimap of gRPC metadata.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    inner: InnerMap,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap {
            inner: InnerMap::new(),
        }
    }

    /// Append a text value for `name`. Multiple values for the same
    /// name are preserved in insertion order (HPACK semantics).
    pub fn append(&mut self, name: &str, value: impl Into<String>) -> Result<(), Error> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::ProtocolViolation(format!("invalid metadata name: {e}")))?;
        let value = HeaderValue::from_str(&value.into())
            .map_err(|e| Error::ProtocolViolation(format!("invalid metadata value: {e}")))?;
        self.inner.append(name, value);
        Ok(())
    }

    /// Append a binary value for a `-bin` suffixed name.
    ///
    /// The caller is responsible for passing the already-decoded
    /// bytes; base64 framing on the wire is a transport concern.
    pub fn append_bin(&mut self, name: &str, value: impl Into<Vec<u8>>) -> Result<(), Error> {
        if !name.ends_with("-bin") {
            return Err(Error::ProtocolViolation(format!(
                "binary metadata name must end in -bin: {name}"
            )));
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::ProtocolViolation(format!("invalid metadata name: {e}")))?;
        let value = HeaderValue::from_bytes(&value.into())
            .map_err(|e| Error::ProtocolViolation(format!("invalid metadata value: {e}")))?;
        self.inner.append(name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn get_bin(&self, name: &str) -> Option<&[u8]> {
        self.inner.get(name).map(|v| v.as_bytes())
    }

    pub fn get_all(&self, name: &str) -> impl Iterator<Item = &str> {
        self.inner.get_all(name).iter().filter_map(|v| v.to_str().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Merge `other` into `self`; on a key conflict `self`'s existing
    /// values take precedence (used by the error-processor trailer
    /// merge of spec §4.6).
    pub fn merge_preferring_self(&mut self, other: &HeaderMap) {
        for (name, value) in other.inner.iter() {
            if !self.inner.contains_key(name) {
                self.inner.append(name.clone(), value.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.inner.iter()
    }
}

impl From<InnerMap> for HeaderMap {
    fn from(inner: InnerMap) -> HeaderMap {
        HeaderMap { inner }
    }
}

impl From<HeaderMap> for InnerMap {
    fn from(map: HeaderMap) -> InnerMap {
        map.inner
    }
}
