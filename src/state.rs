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

//! `StreamState` (spec §4.1): a pure automaton over two orthogonal
//! axes, duplicated at two layers (transport↔pipeline, pipeline↔
//! handler) because interceptors may buffer or reorder asynchronously.
//!
//! The teacher encodes this same legality check implicitly, as a
//! `stale: bool` flag plus `Option<BatchFuture>` bookkeeping inside
//! `StreamingBase`/`SinkBase` (`call/mod.rs`). Spelling it out as an
//! explicit two-axis enum state machine here makes every transition
//! (and every illegal one) a named, testable fact instead of an
//! emergent property of future polling order.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqSide {
    Idle,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespSide {
    Idle,
    Open,
    Closed,
}

/// The outcome of attempting a `StreamState` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The event was legal; the state advanced (or, for `RespClosed`,
    /// stayed terminal while the event was absorbed).
    Applied,
    /// The event is tolerated in this state (e.g. a late part arriving
    /// after the response side has already closed) and is silently
    /// dropped — not an error, just a no-op.
    Dropped,
    /// The event is illegal in this state and indicates genuine
    /// misuse (e.g. two `Metadata` events on the request side).
    Violation,
}

/// Pure state machine governing legal request/response part orderings
/// for one RPC (spec §4.1). Holds no I/O; callers apply the returned
/// `Transition` themselves.
#[derive(Debug, Clone, Copy)]
pub struct StreamState {
    req: ReqSide,
    resp: RespSide,
}

impl Default for StreamState {
    fn default() -> StreamState {
        StreamState {
            req: ReqSide::Idle,
            resp: RespSide::Idle,
        }
    }
}

impl StreamState {
    pub fn new() -> StreamState {
        StreamState::default()
    }

    pub fn req_side(&self) -> ReqSide {
        self.req
    }

    pub fn resp_side(&self) -> RespSide {
        self.resp
    }

    /// `receive_headers`: (ReqIdle, *) -> (ReqOpen, *).
    pub fn receive_headers(&mut self) -> Transition {
        match self.req {
            ReqSide::Idle => {
                self.req = ReqSide::Open;
                Transition::Applied
            }
            ReqSide::Open => Transition::Violation,
            ReqSide::Closed => Transition::Dropped,
        }
    }

    /// `receive_message`: (ReqOpen, *) -> same.
    pub fn receive_message(&mut self) -> Transition {
        match self.req {
            ReqSide::Open => Transition::Applied,
            ReqSide::Idle => Transition::Violation,
            ReqSide::Closed => Transition::Dropped,
        }
    }

    /// `receive_end`: (ReqOpen, *) -> (ReqClosed, *). Request-side End
    /// is observed at most once (spec §3 invariant).
    pub fn receive_end(&mut self) -> Transition {
        match self.req {
            ReqSide::Open => {
                self.req = ReqSide::Closed;
                Transition::Applied
            }
            ReqSide::Idle => Transition::Violation,
            ReqSide::Closed => Transition::Dropped,
        }
    }

    /// `send_headers`: (*, RespIdle) -> (*, RespOpen).
    pub fn send_headers(&mut self) -> Transition {
        match self.resp {
            RespSide::Idle => {
                self.resp = RespSide::Open;
                Transition::Applied
            }
            RespSide::Open => Transition::Violation,
            RespSide::Closed => Transition::Dropped,
        }
    }

    /// `send_message`: (*, RespOpen) -> same.
    pub fn send_message(&mut self) -> Transition {
        match self.resp {
            RespSide::Open => Transition::Applied,
            RespSide::Idle => Transition::Violation,
            RespSide::Closed => Transition::Dropped,
        }
    }

    /// `send_end`: (*, RespOpen|Idle) -> (*, RespClosed). Terminal —
    /// exactly one `End` is ever sent (spec §8 invariant 1).
    pub fn send_end(&mut self) -> Transition {
        match self.resp {
            RespSide::Open | RespSide::Idle => {
                self.resp = RespSide::Closed;
                Transition::Applied
            }
            RespSide::Closed => Transition::Dropped,
        }
    }

    pub fn is_request_closed(&self) -> bool {
        matches!(self.req, ReqSide::Closed)
    }

    pub fn is_response_closed(&self) -> bool {
        matches!(self.resp, RespSide::Closed)
    }
}
