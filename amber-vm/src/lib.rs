// amber-vm - Host-side virtual machine for the Amber scripting engine
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Host-side virtual machine for Amber.
//!
//! This VM exists to run module-initialization code on the host, settle all
//! top-level side effects, and expose the resulting object graph to the
//! snapshot encoder. It is not the on-device interpreter; it favours
//! clarity over footprint and executes the IL block graph directly.

pub mod error;
pub mod frame;
pub mod heap;
pub mod interp;
pub mod machine;
pub mod ops;
pub mod snapshot_info;
pub mod stack;

pub use error::{Result, RuntimeError};
pub use frame::CallFrame;
pub use heap::{Allocation, Heap};
pub use machine::{HostFn, ImportResolver, VM_EXPORT_HOST_ID, Vm};
pub use snapshot_info::SnapshotInfo;
pub use stack::ValueStack;
