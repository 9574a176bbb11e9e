//! Circuit breaker over consecutive identical tool failures.
//!
//! A failure is identified by its signature, `tool_name:error`. Repeating the
//! same signature back to back counts up; any other failure restarts the
//! count at one, and any success resets it to zero. Once the count exceeds
//! `max_retries` the breaker trips and clears itself.
//!
//! The breaker is shared by every tool of an agent, so the model may try as
//! many *different* approaches as it likes; only identical repeats are bounded.
//! The agent starts every turn with a clean breaker.

use tracing::debug;

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the failure back to the model.
    Retry { consecutive_errors: u32 },
    /// Give up on the turn.
    Tripped { consecutive_errors: u32 },
}

/// Bounds identical consecutive failures.
///
/// `max_retries` is the number of identical failures tolerated in a row: the
/// failure that pushes the count past it trips the breaker. With the default
/// of 1 the first failure is handed back to the model and an immediate
/// repeat ends the turn.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    max_retries: u32,
    last_signature: Option<String>,
    consecutive_errors: u32,
}

impl CircuitBreaker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            last_signature: None,
            consecutive_errors: 0,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn record_success(&mut self) {
        self.reset();
    }

    pub fn record_failure(&mut self, tool_name: &str, error: &str) -> Verdict {
        let signature = format!("{tool_name}:{error}");
        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.consecutive_errors += 1;
        } else {
            self.consecutive_errors = 1;
            self.last_signature = Some(signature);
        }

        let consecutive_errors = self.consecutive_errors;
        debug!(
            tool = tool_name,
            consecutive_errors,
            max_retries = self.max_retries,
            "Tool failure recorded"
        );

        if consecutive_errors > self.max_retries {
            self.reset();
            Verdict::Tripped { consecutive_errors }
        } else {
            Verdict::Retry { consecutive_errors }
        }
    }

    pub fn reset(&mut self) {
        self.last_signature = None;
        self.consecutive_errors = 0;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_failure_trips_after_max_retries() {
        let mut breaker = CircuitBreaker::new(1);
        assert_eq!(
            breaker.record_failure("create_file", "disk full"),
            Verdict::Retry {
                consecutive_errors: 1
            }
        );
        assert_eq!(
            breaker.record_failure("create_file", "disk full"),
            Verdict::Tripped {
                consecutive_errors: 2
            }
        );
        // Tripping clears the state
        assert_eq!(breaker.consecutive_errors(), 0);
    }

    #[test]
    fn different_error_restarts_count() {
        let mut breaker = CircuitBreaker::new(1);
        breaker.record_failure("create_file", "disk full");
        assert_eq!(
            breaker.record_failure("create_file", "permission denied"),
            Verdict::Retry {
                consecutive_errors: 1
            }
        );
    }

    #[test]
    fn same_error_on_another_tool_is_a_new_signature() {
        let mut breaker = CircuitBreaker::new(1);
        breaker.record_failure("read_file", "not found");
        assert!(matches!(
            breaker.record_failure("delete_file", "not found"),
            Verdict::Retry { .. }
        ));
    }

    #[test]
    fn success_resets() {
        let mut breaker = CircuitBreaker::new(1);
        breaker.record_failure("t", "boom");
        breaker.record_success();
        assert_eq!(breaker.consecutive_errors(), 0);
        assert!(matches!(
            breaker.record_failure("t", "boom"),
            Verdict::Retry { .. }
        ));
    }

    #[test]
    fn higher_limit_allows_more_repeats() {
        let mut breaker = CircuitBreaker::new(3);
        for expected in 1..=3 {
            assert_eq!(
                breaker.record_failure("t", "boom"),
                Verdict::Retry {
                    consecutive_errors: expected
                }
            );
        }
        assert!(matches!(
            breaker.record_failure("t", "boom"),
            Verdict::Tripped { .. }
        ));
    }
}
