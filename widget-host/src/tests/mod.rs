//! Integration tests for the cell host
//!
//! `recovery_flow` drives the host with a scripted engine so every failure
//! path is deterministic. `python_end_to_end` runs real widget code through
//! the RustPython engine.

pub mod python_end_to_end;
pub mod support;
