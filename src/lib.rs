//! plcvm host toolchain
//!
//! Host-side tools for the PLCVM stack-based control-logic virtual
//! machine: a two-pass assembler, the PLCM module container, and the
//! serial device link used to load, run, and inspect programs on the
//! target.

pub mod asm;
pub mod compiler;
pub mod config;
pub mod isa;
pub mod module;
pub mod transport;
