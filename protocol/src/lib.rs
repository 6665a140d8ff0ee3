//! SCSI wire-level definitions.
//!
//! This crate holds the protocol vocabulary shared by the target engine:
//! command opcodes, status and sense constants, the bus phase model, and the
//! fixed-layout response structures a target serializes onto the wire. It is
//! deliberately free of I/O and dependencies.

pub mod defs;
pub mod phase;
pub mod wire;

pub use defs::*;
pub use phase::Phase;
