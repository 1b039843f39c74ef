//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod anchor_defaults;
pub mod chord;
pub mod frame;
pub mod invariants;
pub mod mapper;
pub mod matcher;
pub mod modal;
pub mod op_state;
pub mod plan;
pub mod regions;
pub mod types;
pub mod wire;
