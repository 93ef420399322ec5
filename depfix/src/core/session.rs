//! Refinement session state machine.
//!
//! `Init -> Generating -> Validating -> {Succeeded | Refining | Exhausted | Aborted}`,
//! with `Refining -> Generating` looping back. Transitions are pure; the
//! orchestrator drives them and owns all I/O.

use serde::Serialize;

use crate::core::types::ValidationOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Generating,
    Validating,
    Refining,
    Succeeded,
    Exhausted,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Exhausted | SessionState::Aborted
        )
    }
}

/// The three observable end states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Succeeded,
    Exhausted,
    Aborted,
}

impl TerminalState {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalState::Succeeded => "succeeded",
            TerminalState::Exhausted => "exhausted",
            TerminalState::Aborted => "aborted",
        }
    }
}

/// Next state after validating attempt `attempt` of `budget`.
///
/// A non-retryable failure aborts even on the last attempt.
pub fn after_validation(outcome: &ValidationOutcome, attempt: u32, budget: u32) -> SessionState {
    if outcome.passed {
        SessionState::Succeeded
    } else if !outcome.diagnostics.retryable {
        SessionState::Aborted
    } else if attempt >= budget {
        SessionState::Exhausted
    } else {
        SessionState::Refining
    }
}

/// Per-finding session bookkeeping. Owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinementSession {
    state: SessionState,
    attempt: u32,
    budget: u32,
    validations: u32,
}

impl RefinementSession {
    pub fn new(budget: u32) -> Self {
        Self {
            state: SessionState::Init,
            attempt: 0,
            budget: budget.max(1),
            validations: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current attempt number (1-based once started).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn budget(&self) -> u32 {
        self.budget
    }

    /// Number of candidates that reached the validator.
    pub fn validations(&self) -> u32 {
        self.validations
    }

    /// `Init -> Generating` with the attempt counter set to 1.
    pub fn begin(&mut self) -> Result<(), String> {
        self.expect(SessionState::Init, "begin")?;
        self.attempt = 1;
        self.state = SessionState::Generating;
        Ok(())
    }

    /// `Generating -> Validating`.
    pub fn candidate_ready(&mut self) -> Result<(), String> {
        self.expect(SessionState::Generating, "candidate_ready")?;
        self.state = SessionState::Validating;
        Ok(())
    }

    /// `Validating -> {Succeeded | Refining | Exhausted | Aborted}`.
    pub fn record_outcome(&mut self, outcome: &ValidationOutcome) -> Result<SessionState, String> {
        self.expect(SessionState::Validating, "record_outcome")?;
        self.validations += 1;
        self.state = after_validation(outcome, self.attempt, self.budget);
        Ok(self.state)
    }

    /// `Refining -> Generating` with the attempt counter incremented.
    pub fn advance(&mut self) -> Result<u32, String> {
        self.expect(SessionState::Refining, "advance")?;
        if self.attempt >= self.budget {
            return Err(format!(
                "attempt budget {} already spent",
                self.budget
            ));
        }
        self.attempt += 1;
        self.state = SessionState::Generating;
        Ok(self.attempt)
    }

    /// Generation failed or no new candidate exists: straight to `Aborted`.
    pub fn abort(&mut self) -> Result<(), String> {
        if self.state.is_terminal() {
            return Err(format!("cannot abort from terminal state {:?}", self.state));
        }
        self.state = SessionState::Aborted;
        Ok(())
    }

    pub fn terminal(&self) -> Option<TerminalState> {
        match self.state {
            SessionState::Succeeded => Some(TerminalState::Succeeded),
            SessionState::Exhausted => Some(TerminalState::Exhausted),
            SessionState::Aborted => Some(TerminalState::Aborted),
            _ => None,
        }
    }

    fn expect(&self, want: SessionState, op: &str) -> Result<(), String> {
        if self.state == want {
            Ok(())
        } else {
            Err(format!("{op} requires state {want:?}, session is {:?}", self.state))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureKind;

    fn conflict() -> ValidationOutcome {
        ValidationOutcome::conflict("conflict", "", vec!["werkzeug".to_string()])
    }

    #[test]
    fn pass_on_first_attempt_succeeds() {
        let mut session = RefinementSession::new(3);
        session.begin().unwrap();
        assert_eq!(session.attempt(), 1);
        session.candidate_ready().unwrap();
        let state = session.record_outcome(&ValidationOutcome::pass("ok")).unwrap();
        assert_eq!(state, SessionState::Succeeded);
        assert_eq!(session.terminal(), Some(TerminalState::Succeeded));
    }

    #[test]
    fn retryable_failures_refine_until_budget() {
        let mut session = RefinementSession::new(2);
        session.begin().unwrap();
        session.candidate_ready().unwrap();
        assert_eq!(session.record_outcome(&conflict()).unwrap(), SessionState::Refining);
        assert_eq!(session.advance().unwrap(), 2);
        session.candidate_ready().unwrap();
        assert_eq!(session.record_outcome(&conflict()).unwrap(), SessionState::Exhausted);
        assert_eq!(session.validations(), 2);
        assert!(session.advance().is_err());
    }

    #[test]
    fn non_retryable_failure_aborts_even_on_last_attempt() {
        let failure = ValidationOutcome::failure(FailureKind::BuildFailure, "build", "");
        assert_eq!(after_validation(&failure, 1, 3), SessionState::Aborted);
        assert_eq!(after_validation(&failure, 3, 3), SessionState::Aborted);
        assert_eq!(after_validation(&conflict(), 3, 3), SessionState::Exhausted);
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut session = RefinementSession::new(3);
        assert!(session.candidate_ready().is_err());
        session.begin().unwrap();
        assert!(session.begin().is_err());
        session.abort().unwrap();
        assert!(session.abort().is_err());
        assert_eq!(session.validations(), 0);
    }

    #[test]
    fn zero_budget_is_clamped_to_one_attempt() {
        assert_eq!(RefinementSession::new(0).budget(), 1);
    }
}
