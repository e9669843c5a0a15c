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

//! `ErrorProcessor` (spec §4.6): maps arbitrary errors to
//! `(Status, trailers)`, optionally via a user-supplied delegate.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::metadata::HeaderMap;
use crate::status::Status;

/// Capability set `{observe_*, transform_*}` a user can plug in to
/// reshape how errors become wire-level statuses (spec §4.6, §9: "the
/// error delegate is a capability set ... model as an interface with
/// default no-op methods").
#[async_trait]
pub trait ErrorDelegate: Send + Sync {
    /// Transform a library-originated error. Returning `None` falls
    /// through to the error's own status projection.
    async fn transform_library_error(&self, _err: &Error) -> Option<(Status, Option<HeaderMap>)> {
        None
    }

    /// Side-channel notification, independent of transformation.
    async fn observe_library_error(&self, _err: &Error) {}

    /// Transform an observer-originated (user code / user future)
    /// error.
    async fn transform_observer_error(&self, _err: &Error) -> Option<(Status, Option<HeaderMap>)> {
        None
    }

    /// Side-channel notification, independent of transformation.
    async fn observe_observer_error(&self, _err: &Error) {}
}

/// Resolves errors to `(Status, HeaderMap)` per the three-step order
/// in spec §4.6.
#[derive(Clone, Default)]
pub struct ErrorProcessor {
    delegate: Option<Arc<dyn ErrorDelegate>>,
}

impl ErrorProcessor {
    pub fn new(delegate: Option<Arc<dyn ErrorDelegate>>) -> ErrorProcessor {
        ErrorProcessor { delegate }
    }

    pub async fn process_library_error(
        &self,
        err: &Error,
        context_trailers: &HeaderMap,
    ) -> (Status, HeaderMap) {
        if let Some(delegate) = &self.delegate {
            delegate.observe_library_error(err).await;
            if let Some((status, trailers)) = delegate.transform_library_error(err).await {
                return (status, Self::merge(context_trailers, trailers));
            }
        }
        // Step 2: every `Error` variant carries its own status
        // projection via `From<&Error> for Status` (step 3, the
        // generic-INTERNAL fallback, is therefore unreachable for this
        // crate's own error type but is the documented behavior a
        // hand-rolled `to_status()`-less error would hit).
        (Status::from(err), context_trailers.clone())
    }

    pub async fn process_observer_error(
        &self,
        err: &Error,
        context_trailers: &HeaderMap,
    ) -> (Status, HeaderMap) {
        if let Some(delegate) = &self.delegate {
            delegate.observe_observer_error(err).await;
            if let Some((status, trailers)) = delegate.transform_observer_error(err).await {
                return (status, Self::merge(context_trailers, trailers));
            }
        }
        (Status::from(err), context_trailers.clone())
    }

    fn merge(context_trailers: &HeaderMap, delegate_trailers: Option<HeaderMap>) -> HeaderMap {
        let mut merged = context_trailers.clone();
        if let Some(delegate_trailers) = delegate_trailers {
            merged.merge_preferring_self(&delegate_trailers);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reclassify;

    #[async_trait]
    impl ErrorDelegate for Reclassify {
        async fn transform_observer_error(
            &self,
            _err: &Error,
        ) -> Option<(Status, Option<HeaderMap>)> {
            let mut trailers = HeaderMap::new();
            trailers.append("x-delegate", "yes").ok();
            Some((Status::new(crate::status::StatusCode::Aborted, "remapped"), Some(trailers)))
        }
    }

    #[tokio::test]
    async fn no_delegate_falls_back_to_error_projection() {
        let processor = ErrorProcessor::new(None);
        let mut trailers = HeaderMap::new();
        trailers.append("x-ctx", "1").ok();
        let (status, out_trailers) = processor
            .process_library_error(&Error::ProtocolViolation("bad".into()), &trailers)
            .await;
        assert_eq!(status.code, crate::status::StatusCode::Internal);
        assert_eq!(out_trailers.get("x-ctx"), Some("1"));
    }

    #[tokio::test]
    async fn delegate_trailers_merge_under_context_precedence() {
        let processor = ErrorProcessor::new(Some(Arc::new(Reclassify)));
        let mut trailers = HeaderMap::new();
        trailers.append("x-delegate", "from-context").ok();
        let (status, out_trailers) = processor
            .process_observer_error(&Error::Observer("boom".into()), &trailers)
            .await;
        assert_eq!(status.code, crate::status::StatusCode::Aborted);
        // context trailers win on conflict.
        assert_eq!(out_trailers.get("x-delegate"), Some("from-context"));
    }
}
