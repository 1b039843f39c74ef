//! Verified UI plan execution.
//!
//! A plan is an ordered list of operations against a desktop app. Each
//! operation is actuated through a serial input device or OS synthetic input,
//! then verified on screen before the next one runs. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (plan model, wire codec, text
//!   matching, region mapping, invariants). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (serial device, synthetic input,
//!   screen capture, OCR, run outputs). Each sits behind a trait so tests can
//!   script it.
//!
//! [`engine`] drives a plan through those collaborators; [`apply`] wires the
//! real ones together for the `uiplan apply` command.

pub mod apply;
pub mod core;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
