// amber-snapshot - Snapshot image encoder/decoder for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The snapshot format: a bit-exact, CRC-protected byte image of the VM's
//! post-initialization state.
//!
//! [`encode_snapshot`] packs a [`amber_vm::SnapshotInfo`] - globals, heap,
//! functions, import/export tables, interned strings - into a single
//! relocatable image addressed by a 16-bit logical space. [`decode_snapshot`]
//! reverses it structurally (without executing anything), producing both a
//! byte-accounting [`SnapshotMapping`] for tooling and a `SnapshotInfo` that
//! [`amber_vm::Vm::restore`] can resume from.

pub mod crc;
pub mod decode;
pub mod encode;
pub mod error;
pub mod format;
pub mod mapping;

pub use crc::crc16_ccitt;
pub use decode::decode_snapshot;
pub use encode::encode_snapshot;
pub use error::{EncodeError, InvalidBytecode};
pub use mapping::{Component, ComponentKind, Region, SnapshotMapping};
