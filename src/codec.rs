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

//! Typed message (de)serialization (spec §4.2).
//!
//! Mirrors the teacher's `codec.rs`: function-pointer-shaped
//! serialize/deserialize pair bundled as a `Marshaller<T>`, kept
//! generic over the wire encoding instead of hard-coding protobuf —
//! the core never chooses an encoding (spec §1 Non-goals).

use bytes::{Bytes, BytesMut};

use crate::error::Error;

/// Serializes a value of type `T` into the outbound byte buffer.
///
/// Returns `Err` on failure; the handler then fails the pending write
/// acknowledgement and drives the call to `End` with `INTERNAL`
/// (spec §4.2).
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T, buf: &mut BytesMut) -> Result<(), Error>;
}

/// Deserializes a value of type `T` from an inbound message payload.
///
/// Returns `Err` on failure; the handler short-circuits to `End` with
/// `INTERNAL` (or `INVALID_ARGUMENT` if the configured error delegate
/// chooses to reclassify it).
pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, bytes: Bytes) -> Result<T, Error>;
}

/// A function-pointer backed `Serializer`, for codecs with no
/// per-message state (the common case — see `Marshaller`).
pub type SerializeFn<T> = fn(&T, &mut BytesMut) -> Result<(), Error>;
pub type DeserializeFn<T> = fn(Bytes) -> Result<T, Error>;

/// Bundles a serialize/deserialize function pair for one message type.
///
/// Function pointers rather than a generic `Serializer`/`Deserializer`
/// pair keep the `Router`'s registration signature simple (one
/// concrete type per method instead of two trait objects per method) —
/// the same rationale the teacher gives in `codec.rs` for using
/// function pointers over a boxed trait.
#[derive(Clone, Copy)]
pub struct Marshaller<T> {
    pub ser: SerializeFn<T>,
    pub de: DeserializeFn<T>,
}

impl<T> Marshaller<T> {
    pub const fn new(ser: SerializeFn<T>, de: DeserializeFn<T>) -> Marshaller<T> {
        Marshaller { ser, de }
    }

    pub fn serialize(&self, value: &T) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        (self.ser)(value, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn deserialize(&self, bytes: Bytes) -> Result<T, Error> {
        (self.de)(bytes)
    }
}
