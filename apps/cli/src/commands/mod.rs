//! Command implementations for the `kiln` binary.

pub mod gate;
pub mod run;
pub mod service;
