//! Stable exit codes for depfix CLI commands.

use crate::core::session::TerminalState;

/// Session succeeded (or a non-session command completed).
pub const OK: i32 = 0;
/// Invalid input, configuration, or an internal error.
pub const INVALID: i32 = 1;
/// Attempt budget spent without a passing candidate.
pub const EXHAUSTED: i32 = 2;
/// Non-recoverable failure: generation error, non-retryable outcome, or no further coordination.
pub const ABORTED: i32 = 3;

pub fn for_state(state: TerminalState) -> i32 {
    match state {
        TerminalState::Succeeded => OK,
        TerminalState::Exhausted => EXHAUSTED,
        TerminalState::Aborted => ABORTED,
    }
}

/// Batch exit code: the worst of its sessions (aborted over exhausted over ok).
pub fn worst(states: impl IntoIterator<Item = TerminalState>) -> i32 {
    states.into_iter().fold(OK, |acc, state| match (acc, for_state(state)) {
        (ABORTED, _) | (_, ABORTED) => ABORTED,
        (EXHAUSTED, _) | (_, EXHAUSTED) => EXHAUSTED,
        _ => OK,
    })
}
