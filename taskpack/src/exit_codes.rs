//! Stable exit codes for taskpack CLI commands.

/// Command succeeded (plan written, handoff emitted, runner succeeded, record written).
pub const OK: i32 = 0;
/// Unexpected error: I/O failure, unreachable tooling, invariant violation,
/// or a runner that exited non-zero.
pub const ERROR: i32 = 1;
/// Refusal: packet format, routing policy, or repository state.
pub const REFUSED: i32 = 2;
