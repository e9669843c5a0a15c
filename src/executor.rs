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

//! Per-call execution context (spec §5): every call's drive future
//! runs to completion on one single-threaded task, never migrating
//! between threads mid-poll.
//!
//! The teacher's `Environment`/`Executor` (`env_ref.rs`,
//! `task/executor.rs`) are the FFI-bound analogue: `Environment` spawns
//! a fixed pool of OS threads, each polling its own completion queue
//! and driving whatever `SpawnTask` a completed batch wakes. With
//! native async/await and no FFI boundary, the same shape is a fixed
//! pool of OS threads, each running its own `tokio::task::LocalSet` —
//! which is exactly the non-`Send` single-threaded suspension-point
//! guarantee `CallContext`'s `Rc<RefCell<..>>` internals rely on (spec
//! §5).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle as ThreadHandle};

use futures::future::LocalBoxFuture;
use tokio::runtime::Builder as RuntimeBuilder;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

/// One thread running one `LocalSet`: the unit a single call is pinned
/// to for its whole lifetime.
pub struct CallExecutor {
    local: LocalSet,
}

impl CallExecutor {
    pub fn new() -> CallExecutor {
        CallExecutor {
            local: LocalSet::new(),
        }
    }

    /// Spawn a call's drive future (or any other `?Send` future) onto
    /// this executor's `LocalSet`. Must be called from within a
    /// `LocalSet` context (e.g. inside `run_until`).
    pub fn spawn(&self, fut: LocalBoxFuture<'static, ()>) {
        self.local.spawn_local(fut);
    }

    /// Run `fut` to completion, polling every future spawned onto this
    /// executor (via `spawn`) alongside it.
    pub async fn run_until<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.local.run_until(fut).await
    }
}

impl Default for CallExecutor {
    fn default() -> CallExecutor {
        CallExecutor::new()
    }
}

/// A fixed pool of single-threaded executors, each pinned to its own
/// OS thread (teacher analogue: `Environment::new(cq_count)` in
/// `env_ref.rs`, which spawns one poller thread per completion queue).
///
/// Calls are handed to threads round-robin; once assigned, a call
/// never leaves its thread for the rest of its lifetime, satisfying
/// the single-execution-context guarantee without any locking inside
/// the core (spec §5).
pub struct CallExecutorPool {
    senders: Vec<mpsc::UnboundedSender<LocalBoxFuture<'static, ()>>>,
    next: AtomicUsize,
    _threads: Vec<ThreadHandle<()>>,
}

impl CallExecutorPool {
    pub fn new(thread_count: usize) -> CallExecutorPool {
        assert!(thread_count > 0, "thread_count must be positive");
        let mut senders = Vec::with_capacity(thread_count);
        let mut threads = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let (tx, mut rx) = mpsc::unbounded_channel::<LocalBoxFuture<'static, ()>>();
            let handle = thread::Builder::new()
                .name(format!("grpc-call-{i}"))
                .spawn(move || {
                    let runtime = RuntimeBuilder::new_current_thread()
                        .enable_time()
                        .build()
                        .expect("build per-thread tokio runtime");
                    let local = LocalSet::new();
                    local.block_on(&runtime, async move {
                        while let Some(fut) = rx.recv().await {
                            tokio::task::spawn_local(fut);
                        }
                    });
                })
                .expect("spawn call-executor thread");
            senders.push(tx);
            threads.push(handle);
        }
        CallExecutorPool {
            senders,
            next: AtomicUsize::new(0),
            _threads: threads,
        }
    }

    /// Hand one call's drive future to the next thread, round-robin.
    ///
    /// The call runs detached: dropping the pool does not cancel calls
    /// already in flight, it only stops accepting new ones (the
    /// per-thread receiver loop exits once every sender is dropped).
    pub fn spawn(&self, fut: LocalBoxFuture<'static, ()>) {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        // The receiving thread may have panicked; a dropped call is
        // reported upward by the transport's own connection teardown,
        // not by this pool.
        let _ = self.senders[i].send(fut);
    }

    pub fn thread_count(&self) -> usize {
        self.senders.len()
    }
}
