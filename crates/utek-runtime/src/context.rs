//! Per-run execution context: environment variables, working directory,
//! security posture, and resource accounting. Mutated only by instruction
//! handlers within the owning unit.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use utek_pkg::PackageHeader;
use utek_policy::{ExecutionMode, NetworkMode, SecurityFlags};

/// Env var consulted in `restricted-outbound` mode: comma-separated host
/// allow-list.
pub const ALLOWED_HOSTS_ENV: &str = "UTEK_ALLOWED_HOSTS";

pub const DEFAULT_MAX_INSTRUCTIONS: u64 = 100_000;
pub const DEFAULT_MAX_NETWORK_OPS: u64 = 64;
pub const DEFAULT_MAX_SUBPROCESSES: u64 = 16;
pub const DEFAULT_MAX_VFS_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_INSTRUCTION_TIMEOUT_SECONDS: f64 = 60.0;

#[derive(Debug, Clone, Serialize)]
pub struct ResourceLimits {
    /// Global wall-clock budget; `None` means unbounded.
    pub max_exec_seconds: Option<f64>,
    /// Instruction-cycle ceiling guaranteeing termination of jump loops.
    pub max_instructions: u64,
    pub max_network_ops: u64,
    pub max_subprocesses: u64,
    pub max_vfs_bytes: u64,
    /// Cap applied over each instruction's own `timeout_seconds`.
    pub max_instruction_timeout: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            max_exec_seconds: None,
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            max_network_ops: DEFAULT_MAX_NETWORK_OPS,
            max_subprocesses: DEFAULT_MAX_SUBPROCESSES,
            max_vfs_bytes: DEFAULT_MAX_VFS_BYTES,
            max_instruction_timeout: DEFAULT_MAX_INSTRUCTION_TIMEOUT_SECONDS,
        }
    }
}

impl ResourceLimits {
    /// Apply `SET_CONTEXT {"resource_limits": {...}}` overrides. Unknown
    /// keys are ignored; a program may narrow its own budget, never widen
    /// it beyond the header-derived values.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, Value>) {
        for (key, value) in overrides {
            match (key.as_str(), value.as_u64()) {
                ("max_instructions", Some(v)) => {
                    self.max_instructions = self.max_instructions.min(v)
                }
                ("max_network_ops", Some(v)) => {
                    self.max_network_ops = self.max_network_ops.min(v)
                }
                ("max_subprocesses", Some(v)) => {
                    self.max_subprocesses = self.max_subprocesses.min(v)
                }
                ("max_vfs_bytes", Some(v)) => self.max_vfs_bytes = self.max_vfs_bytes.min(v),
                ("max_exec_seconds", _) => {
                    if let Some(v) = value.as_f64() {
                        self.max_exec_seconds = Some(
                            self.max_exec_seconds.map_or(v, |cur| cur.min(v)),
                        );
                    }
                }
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceUsage {
    pub instructions: u64,
    pub network_ops: u64,
    pub subprocesses: u64,
}

#[derive(Debug)]
pub struct ExecutionContext {
    pub env: BTreeMap<String, String>,
    /// Must always name an existing IVFS directory.
    pub working_directory: String,
    pub role: Option<String>,
    pub namespace: String,
    pub current_user: Option<String>,
    pub flags: SecurityFlags,
    pub network_mode: NetworkMode,
    pub execution_mode: ExecutionMode,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    /// DELEGATE_TO nesting depth of the owning unit's current run.
    pub delegation_depth: u32,
}

impl ExecutionContext {
    pub fn from_header(header: &PackageHeader, base_limits: &ResourceLimits) -> Self {
        let mut limits = base_limits.clone();
        match (header.max_exec_seconds(), limits.max_exec_seconds) {
            (Some(h), Some(b)) => limits.max_exec_seconds = Some(h.min(b)),
            (Some(h), None) => limits.max_exec_seconds = Some(h),
            _ => {}
        }
        ExecutionContext {
            env: BTreeMap::new(),
            working_directory: "/".to_string(),
            role: None,
            namespace: "default".to_string(),
            current_user: None,
            flags: header.security_flags(),
            network_mode: header.networking_mode,
            execution_mode: header.execution_mode,
            limits,
            usage: ResourceUsage::default(),
            delegation_depth: 0,
        }
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Hosts permitted in `restricted-outbound` mode.
    pub fn allowed_hosts(&self) -> Vec<String> {
        self.env(ALLOWED_HOSTS_ENV)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn effective_timeout(&self, instruction_timeout: f64) -> f64 {
        instruction_timeout.min(self.limits.max_instruction_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_budget_narrows_base_limits() {
        let header = PackageHeader::default(); // max-exec-time=60s
        let base = ResourceLimits {
            max_exec_seconds: Some(120.0),
            ..ResourceLimits::default()
        };
        let ctx = ExecutionContext::from_header(&header, &base);
        assert_eq!(ctx.limits.max_exec_seconds, Some(60.0));
    }

    #[test]
    fn overrides_only_narrow() {
        let mut limits = ResourceLimits::default();
        let mut overrides = BTreeMap::new();
        overrides.insert("max_network_ops".to_string(), json!(4));
        overrides.insert("max_instructions".to_string(), json!(10_000_000u64));
        limits.apply_overrides(&overrides);
        assert_eq!(limits.max_network_ops, 4);
        assert_eq!(limits.max_instructions, DEFAULT_MAX_INSTRUCTIONS);
    }

    #[test]
    fn allowed_hosts_parse_from_env() {
        let header = PackageHeader::default();
        let mut ctx = ExecutionContext::from_header(&header, &ResourceLimits::default());
        assert!(ctx.allowed_hosts().is_empty());
        ctx.set_env(ALLOWED_HOSTS_ENV, "example.com, mirror.internal ,");
        assert_eq!(
            ctx.allowed_hosts(),
            vec!["example.com".to_string(), "mirror.internal".to_string()]
        );
    }

    #[test]
    fn effective_timeout_is_capped() {
        let header = PackageHeader::default();
        let ctx = ExecutionContext::from_header(&header, &ResourceLimits::default());
        assert_eq!(ctx.effective_timeout(30.0), 30.0);
        assert_eq!(ctx.effective_timeout(900.0), 60.0);
    }
}
