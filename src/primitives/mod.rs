//! Low-level primitives the engine builds on.
//!
//! Currently only positioned device I/O: real image files, an in-memory
//! device, and a fault-injecting wrapper used to exercise abort paths.

/// Device I/O abstractions.
pub mod io;
