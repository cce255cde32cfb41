//! Run reports: the caller-facing result of one execution-unit run.

use serde::Serialize;
use serde_json::Value;

use utek_contracts::UTEK_RUN_REPORT_SCHEMA_VERSION;

use crate::context::ResourceUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStatus {
    Idle,
    Initializing,
    Running,
    Completed,
    Failed,
    Halted,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Idle => "idle",
            UnitStatus::Initializing => "initializing",
            UnitStatus::Running => "running",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
            UnitStatus::Halted => "halted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitStatus::Completed | UnitStatus::Failed | UnitStatus::Halted
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureInfo {
    pub opcode: String,
    pub outcome: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub schema_version: String,
    pub unit_id: u32,
    pub program_hash: String,
    pub status: UnitStatus,
    pub instructions_executed: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    pub usage: ResourceUsage,
    /// Events emitted by EMIT_EVENT, in program order.
    pub events: Vec<Value>,
    /// Subtrees exported inline (EXPORT without a host target).
    pub exports: Vec<Value>,
    /// The unit's slice of the audit trail, in append order.
    pub audit_trail: Vec<String>,
}

impl RunReport {
    pub fn new(unit_id: u32, program_hash: &str) -> Self {
        RunReport {
            schema_version: UTEK_RUN_REPORT_SCHEMA_VERSION.to_string(),
            unit_id,
            program_hash: program_hash.to_string(),
            status: UnitStatus::Initializing,
            instructions_executed: 0,
            duration_ms: 0,
            failure: None,
            usage: ResourceUsage::default(),
            events: Vec::new(),
            exports: Vec::new(),
            audit_trail: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, UnitStatus::Completed | UnitStatus::Halted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(UnitStatus::Completed.is_terminal());
        assert!(UnitStatus::Failed.is_terminal());
        assert!(UnitStatus::Halted.is_terminal());
        assert!(!UnitStatus::Idle.is_terminal());
        assert!(!UnitStatus::Running.is_terminal());
    }

    #[test]
    fn report_serializes_without_failure_when_clean() {
        let mut report = RunReport::new(1, "hash");
        report.status = UnitStatus::Completed;
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("failure").is_none());
        assert_eq!(json["status"], "completed");
        assert_eq!(json["schema_version"], UTEK_RUN_REPORT_SCHEMA_VERSION);
    }
}
