//! Stable exit codes for blocks CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid arguments, config, or an engine error.
pub const INVALID: i32 = 1;
/// A generation cycle exhausted its retry budget.
pub const EXHAUSTED: i32 = 2;
/// `blocks refresh` ran but the active version failed.
pub const REFRESH_FAILED: i32 = 3;
