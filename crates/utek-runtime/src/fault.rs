//! Interpreter fault taxonomy.
//!
//! Every fault maps to exactly one audit outcome. Retry only makes sense
//! for faults caused by the world (handler I/O, transport, timeouts);
//! program-shaped faults (decode, policy, assertions, stack discipline)
//! fail the same way every attempt and are never retried.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Fault {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("assertion failure: {0}")]
    AssertionFailure(String),
    #[error("stack fault: {0}")]
    StackFault(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),
    #[error("invalid label: {0}")]
    InvalidLabel(String),
    #[error("arithmetic fault: {0}")]
    Arithmetic(String),
    #[error("{0}")]
    Handler(String),
}

impl Fault {
    pub fn outcome(&self) -> Outcome {
        match self {
            Fault::Decode(_) => Outcome::DecodeError,
            Fault::PolicyViolation(_) => Outcome::PolicyViolation,
            Fault::Timeout(_) => Outcome::Timeout,
            Fault::AssertionFailure(_) => Outcome::AssertionFailure,
            Fault::StackFault(_) => Outcome::StackFault,
            Fault::ResourceLimitExceeded(_) => Outcome::ResourceLimitExceeded,
            Fault::InvalidLabel(_) => Outcome::InvalidLabel,
            Fault::Arithmetic(_) => Outcome::Failed,
            Fault::Handler(_) => Outcome::Failed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Fault::Handler(_) | Fault::Timeout(_))
    }
}

/// Audit outcome token for one instruction cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Skipped,
    DryRun,
    Halted,
    Failed,
    DecodeError,
    PolicyViolation,
    Timeout,
    AssertionFailure,
    StackFault,
    ResourceLimitExceeded,
    InvalidLabel,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Skipped => "SKIPPED",
            Outcome::DryRun => "DRY_RUN",
            Outcome::Halted => "HALTED",
            Outcome::Failed => "FAILED",
            Outcome::DecodeError => "DECODE_ERROR",
            Outcome::PolicyViolation => "POLICY_VIOLATION",
            Outcome::Timeout => "TIMEOUT",
            Outcome::AssertionFailure => "ASSERTION_FAILURE",
            Outcome::StackFault => "STACK_FAULT",
            Outcome::ResourceLimitExceeded => "RESOURCE_LIMIT_EXCEEDED",
            Outcome::InvalidLabel => "INVALID_LABEL",
        }
    }

    /// True if the cycle leaves the unit able to continue.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Success | Outcome::Skipped | Outcome::DryRun)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_shaped_faults_never_retry() {
        assert!(!Fault::Decode("x".into()).is_retryable());
        assert!(!Fault::PolicyViolation("x".into()).is_retryable());
        assert!(!Fault::AssertionFailure("x".into()).is_retryable());
        assert!(!Fault::StackFault("x".into()).is_retryable());
        assert!(!Fault::ResourceLimitExceeded("x".into()).is_retryable());
        assert!(!Fault::InvalidLabel("x".into()).is_retryable());
        assert!(Fault::Handler("io".into()).is_retryable());
        assert!(Fault::Timeout("slow".into()).is_retryable());
    }

    #[test]
    fn outcome_terminality() {
        assert!(!Outcome::Success.is_terminal());
        assert!(!Outcome::Skipped.is_terminal());
        assert!(!Outcome::DryRun.is_terminal());
        assert!(Outcome::Halted.is_terminal());
        assert!(Outcome::PolicyViolation.is_terminal());
    }
}
