//! Execution unit: one isolated interpreter instance.
//!
//! A unit owns its register/stack storage, IVFS, execution context, and a
//! crypto-engine handle, and drives the five-stage pipeline (fetch,
//! decode, execute, storage access, commit) over one program package at a
//! time. Nothing in here is shared between units except the handles in
//! [`UnitShared`], which the scheduler owns and synchronizes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use utek_crypto::CryptoEngine;
use utek_pkg::{Instruction, Opcode, ProgramPackage};

use crate::audit::{AuditRecord, AuditSink};
use crate::context::{ExecutionContext, ResourceLimits};
use crate::fault::{Fault, Outcome};
use crate::ivfs::Ivfs;
use crate::net::RemoteTransport;
use crate::regs::RegisterFile;
use crate::report::{FailureInfo, RunReport, UnitStatus};
use crate::sched::LockSet;

const RETRY_BACKOFF_BASE_MS: u64 = 100;
pub const MAX_DELEGATION_DEPTH: u32 = 1;

/// Handles shared across every unit in a scheduler pool.
#[derive(Clone)]
pub struct UnitShared {
    pub audit: Arc<AuditSink>,
    pub locks: Arc<LockSet>,
    pub transport: Arc<dyn RemoteTransport>,
    pub shutdown: Arc<AtomicBool>,
}

impl UnitShared {
    /// Standalone handles for a unit outside a scheduler pool (tests,
    /// one-shot runs).
    pub fn standalone(transport: Arc<dyn RemoteTransport>) -> Self {
        UnitShared {
            audit: Arc::new(AuditSink::new()),
            locks: Arc::new(LockSet::new()),
            transport,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// The five stages one instruction passes through in a pipeline cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Idle,
    Fetching,
    Decoding,
    Executing,
    AccessingStorage,
    Committing,
}

/// Where the program counter goes after a cycle commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PcNext {
    Advance,
    Jump(usize),
    Terminate(UnitStatus),
}

/// The committed result of one execute stage.
#[derive(Debug, Clone)]
pub(crate) struct Effect {
    pub next: PcNext,
    pub outcome: Outcome,
    pub detail: String,
    pub requests_shutdown: bool,
}

impl Effect {
    pub fn ok(detail: impl Into<String>) -> Self {
        Effect {
            next: PcNext::Advance,
            outcome: Outcome::Success,
            detail: detail.into(),
            requests_shutdown: false,
        }
    }

    pub fn jump(target: usize, detail: impl Into<String>) -> Self {
        Effect {
            next: PcNext::Jump(target),
            outcome: Outcome::Success,
            detail: detail.into(),
            requests_shutdown: false,
        }
    }

    pub fn skip(target: usize, detail: impl Into<String>) -> Self {
        Effect {
            next: PcNext::Jump(target),
            outcome: Outcome::Skipped,
            detail: detail.into(),
            requests_shutdown: false,
        }
    }

    pub fn dry_run(detail: impl Into<String>) -> Self {
        Effect {
            next: PcNext::Advance,
            outcome: Outcome::DryRun,
            detail: detail.into(),
            requests_shutdown: false,
        }
    }

    pub fn halt(reason: impl Into<String>) -> Self {
        Effect {
            next: PcNext::Terminate(UnitStatus::Halted),
            outcome: Outcome::Halted,
            detail: reason.into(),
            requests_shutdown: false,
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Effect {
            requests_shutdown: true,
            ..Effect::halt(reason)
        }
    }
}

pub struct ExecutionUnit {
    id: u32,
    status: UnitStatus,
    stage: PipelineStage,
    pub(crate) regs: RegisterFile,
    pub(crate) vfs: Ivfs,
    pub(crate) ctx: ExecutionContext,
    pub(crate) crypto: CryptoEngine,
    pub(crate) shared: UnitShared,
    base_limits: ResourceLimits,
    base_delegation_depth: u32,
    // Per-run state, reset by `begin_run`.
    pub(crate) program: Vec<Instruction>,
    pub(crate) labels: BTreeMap<String, usize>,
    pub(crate) program_hash: String,
    pub(crate) events: Vec<Value>,
    pub(crate) exports: Vec<Value>,
    /// Open structured-conditional frames (IF blocks entered).
    pub(crate) open_conditionals: usize,
    pub(crate) holds_lock: bool,
    run_started: Instant,
}

impl ExecutionUnit {
    pub fn new(id: u32, shared: UnitShared, crypto: CryptoEngine) -> Self {
        Self::with_limits(id, shared, crypto, ResourceLimits::default())
    }

    pub fn with_limits(
        id: u32,
        shared: UnitShared,
        crypto: CryptoEngine,
        base_limits: ResourceLimits,
    ) -> Self {
        let header = utek_pkg::PackageHeader::default();
        ExecutionUnit {
            id,
            status: UnitStatus::Idle,
            stage: PipelineStage::Idle,
            regs: RegisterFile::default(),
            vfs: Ivfs::new(),
            ctx: ExecutionContext::from_header(&header, &base_limits),
            crypto,
            shared,
            base_limits,
            base_delegation_depth: 0,
            program: Vec::new(),
            labels: BTreeMap::new(),
            program_hash: String::new(),
            events: Vec::new(),
            exports: Vec::new(),
            open_conditionals: 0,
            holds_lock: false,
            run_started: Instant::now(),
        }
    }

    pub(crate) fn delegated(mut self, depth: u32) -> Self {
        self.base_delegation_depth = depth;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn base_limits(&self) -> &ResourceLimits {
        &self.base_limits
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Run one program package to completion, failure, or halt.
    pub fn run(&mut self, package: &ProgramPackage) -> RunReport {
        self.status = UnitStatus::Initializing;
        let audit_before = self.shared.audit.len();
        self.run_started = Instant::now();

        let mut report = match self.begin_run(package) {
            Ok(report) => report,
            Err(fault) => {
                let mut report = RunReport::new(self.id, "");
                self.fail_report(&mut report, "INIT", &fault);
                self.finish(&mut report, audit_before);
                return report;
            }
        };

        self.status = UnitStatus::Running;
        loop {
            // External shutdown is observed between cycles; in-flight
            // instructions always finish.
            if self.shared.shutdown.load(Ordering::SeqCst) && self.status == UnitStatus::Running {
                self.status = UnitStatus::Halted;
                break;
            }

            // Fetch. Falling off the end of the stream completes the run.
            self.stage = PipelineStage::Fetching;
            let pc = self.regs.pc;
            let Some(instruction) = self.program.get(pc).cloned() else {
                self.status = UnitStatus::Completed;
                break;
            };

            let cycle_started = Instant::now();
            let opcode = instruction.opcode;

            // Budget checks ride on the fetched instruction so the audit
            // record names a real opcode.
            let fault = self
                .check_global_budget(report.instructions_executed)
                .err();

            // Decode.
            self.stage = PipelineStage::Decoding;
            let fault = fault.or_else(|| {
                opcode
                    .validate_params(&instruction.params)
                    .map_err(|e| Fault::Decode(format!("{e:#}")))
                    .err()
            });

            // Execute, with retry/backoff for world-shaped faults.
            self.stage = PipelineStage::Executing;
            let result = match fault {
                Some(fault) => Err(fault),
                None => self.execute_with_retries(&instruction),
            };

            // Storage access + commit: settle the program counter and
            // finalize this cycle's audit record.
            self.stage = PipelineStage::AccessingStorage;
            let duration_ms = cycle_started.elapsed().as_millis() as u64;
            report.instructions_executed += 1;
            self.ctx.usage.instructions += 1;

            self.stage = PipelineStage::Committing;
            match result {
                Ok(effect) => {
                    self.append_audit(opcode.as_str(), effect.outcome, duration_ms, &effect.detail);
                    if effect.requests_shutdown {
                        self.shared.shutdown.store(true, Ordering::SeqCst);
                    }
                    match effect.next {
                        PcNext::Advance => self.regs.pc = pc + 1,
                        PcNext::Jump(target) => self.regs.pc = target,
                        PcNext::Terminate(status) => {
                            self.status = status;
                            break;
                        }
                    }
                }
                Err(fault) => {
                    self.append_audit(
                        opcode.as_str(),
                        fault.outcome(),
                        duration_ms,
                        &fault.to_string(),
                    );
                    self.fail_report(&mut report, opcode.as_str(), &fault);
                    break;
                }
            }
        }

        if self.status == UnitStatus::Running {
            self.status = UnitStatus::Completed;
        }
        self.stage = PipelineStage::Idle;
        report.status = self.status;
        self.finish(&mut report, audit_before);
        report
    }

    fn begin_run(&mut self, package: &ProgramPackage) -> Result<RunReport, Fault> {
        self.regs.reset();
        self.vfs.reset();
        self.events.clear();
        self.exports.clear();
        self.open_conditionals = 0;
        self.holds_lock = false;

        self.ctx = ExecutionContext::from_header(&package.header, &self.base_limits);
        self.ctx.delegation_depth = self.base_delegation_depth;

        self.program = package.instructions.clone();
        self.labels = package
            .build_label_map()
            .map_err(|e| Fault::Decode(format!("{e:#}")))?;
        self.program_hash = package
            .content_hash()
            .map_err(|e| Fault::Handler(format!("content hash: {e:#}")))?;
        self.vfs
            .populate_from_seed("/", &package.vfs_seed)
            .map_err(|e| Fault::Decode(format!("vfs seed: {e:#}")))?;

        Ok(RunReport::new(self.id, &self.program_hash))
    }

    fn check_global_budget(&self, executed: u64) -> Result<(), Fault> {
        if let Some(budget) = self.ctx.limits.max_exec_seconds {
            let elapsed = self.run_started.elapsed().as_secs_f64();
            if elapsed > budget {
                return Err(Fault::Timeout(format!(
                    "global time budget of {budget}s exhausted after {elapsed:.1}s"
                )));
            }
        }
        if executed >= self.ctx.limits.max_instructions {
            return Err(Fault::ResourceLimitExceeded(format!(
                "instruction-cycle ceiling of {} reached",
                self.ctx.limits.max_instructions
            )));
        }
        Ok(())
    }

    fn execute_with_retries(&mut self, instruction: &Instruction) -> Result<Effect, Fault> {
        let timeout = self.ctx.effective_timeout(instruction.timeout_seconds);
        let mut last = None;
        for attempt in 0..=instruction.retry_attempts {
            let started = Instant::now();
            let result = self.dispatch(instruction, timeout);
            let elapsed = started.elapsed().as_secs_f64();

            let result = match result {
                Ok(_) if elapsed > timeout => Err(Fault::Timeout(format!(
                    "{} took {elapsed:.1}s, budget {timeout:.1}s",
                    instruction.opcode
                ))),
                other => other,
            };

            match result {
                Ok(effect) => return Ok(effect),
                Err(fault) if fault.is_retryable() && attempt < instruction.retry_attempts => {
                    let backoff = RETRY_BACKOFF_BASE_MS * (1u64 << attempt.min(6));
                    tracing::debug!(
                        opcode = %instruction.opcode,
                        attempt,
                        "retrying after fault: {fault}"
                    );
                    std::thread::sleep(Duration::from_millis(backoff));
                    last = Some(fault);
                }
                Err(fault) => return Err(fault),
            }
        }
        Err(last.unwrap_or_else(|| Fault::Handler("retries exhausted".to_string())))
    }

    pub(crate) fn append_audit(
        &self,
        opcode: &str,
        outcome: Outcome,
        duration_ms: u64,
        detail: &str,
    ) {
        self.shared.audit.append(AuditRecord::new(
            self.id,
            opcode,
            outcome,
            duration_ms,
            &self.program_hash,
            detail,
        ));
    }

    fn fail_report(&mut self, report: &mut RunReport, opcode: &str, fault: &Fault) {
        self.status = UnitStatus::Failed;
        report.status = UnitStatus::Failed;
        report.failure = Some(FailureInfo {
            opcode: opcode.to_string(),
            outcome: fault.outcome().as_str().to_string(),
            detail: fault.to_string(),
        });
    }

    fn finish(&mut self, report: &mut RunReport, audit_before: usize) {
        if self.holds_lock {
            self.shared.locks.unlock(&self.program_hash);
            self.holds_lock = false;
        }
        report.duration_ms = self.run_started.elapsed().as_millis() as u64;
        report.usage = self.ctx.usage;
        report.events = std::mem::take(&mut self.events);
        report.exports = std::mem::take(&mut self.exports);
        report.audit_trail = self
            .shared
            .audit
            .records(None)
            .into_iter()
            .skip(audit_before)
            .filter(|r| r.unit_id == self.id)
            .map(|r| r.line())
            .collect();
        // The unit returns to the pool ready for the next program.
        self.status = report.status;
    }

    /// Resolve a label or fault with `InvalidLabel`.
    pub(crate) fn resolve_label(&self, label: &str) -> Result<usize, Fault> {
        self.labels
            .get(label)
            .copied()
            .ok_or_else(|| Fault::InvalidLabel(format!("label {label:?} is not defined")))
    }
}

/// What a forward scan for the matching branch terminator found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchTarget {
    Else(usize),
    Endif(usize),
}

/// Scan forward from the instruction after `from` for the matching ELSE
/// (when `accept_else`) or ENDIF at the same nesting depth.
pub(crate) fn scan_branch(
    program: &[Instruction],
    from: usize,
    accept_else: bool,
) -> Result<BranchTarget, Fault> {
    let mut depth = 0usize;
    for (index, instruction) in program.iter().enumerate().skip(from + 1) {
        match instruction.opcode {
            Opcode::If => depth += 1,
            Opcode::Else if depth == 0 => {
                if accept_else {
                    return Ok(BranchTarget::Else(index));
                }
                return Err(Fault::Decode(format!(
                    "unexpected second ELSE at instruction {index}"
                )));
            }
            Opcode::Endif => {
                if depth == 0 {
                    return Ok(BranchTarget::Endif(index));
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    Err(Fault::Decode(format!(
        "conditional opened at instruction {from} has no matching ENDIF"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use utek_pkg::Instruction;

    fn instr(opcode: Opcode) -> Instruction {
        Instruction::new(opcode)
    }

    #[test]
    fn scan_finds_matching_else_at_same_depth() {
        // IF / IF / ELSE / ENDIF / ELSE / ENDIF
        let program = vec![
            instr(Opcode::If),
            instr(Opcode::If),
            instr(Opcode::Else),
            instr(Opcode::Endif),
            instr(Opcode::Else),
            instr(Opcode::Endif),
        ];
        assert_eq!(
            scan_branch(&program, 0, true).unwrap(),
            BranchTarget::Else(4)
        );
        assert_eq!(
            scan_branch(&program, 1, true).unwrap(),
            BranchTarget::Else(2)
        );
        assert_eq!(
            scan_branch(&program, 4, false).unwrap(),
            BranchTarget::Endif(5)
        );
    }

    #[test]
    fn scan_faults_on_unterminated_conditional() {
        let program = vec![instr(Opcode::If), instr(Opcode::Log)];
        assert!(matches!(
            scan_branch(&program, 0, true),
            Err(Fault::Decode(_))
        ));
    }
}
