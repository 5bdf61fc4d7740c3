//! Stable exit codes for analyzer CLI commands.

/// Run completed (validation warnings included).
pub const OK: i32 = 0;
/// A run was created and failed: fatal provider error, exhausted retries,
/// timeout, turn limit, or any other error after the run directory existed.
pub const RUN_FAILED: i32 = 1;
/// Missing or invalid credentials, backend settings, or config file. No run
/// directory was created.
pub const CONFIG_ERROR: i32 = 2;
