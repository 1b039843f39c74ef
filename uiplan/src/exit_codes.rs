//! Stable exit codes for uiplan CLI commands.

/// Plan succeeded, or the command finished without problems.
pub const OK: i32 = 0;
/// At least one op failed (or a non-apply command hit an error).
pub const FAILED: i32 = 1;
/// The run was interrupted, lost its actuator, or could not start.
pub const ABORTED: i32 = 2;
/// Invalid invocation, config, plan or regions.
pub const INVALID: i32 = 3;
