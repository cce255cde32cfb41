//! UTEK execution runtime.
//!
//! The pieces compose leaf-to-root: register/stack storage, an isolated
//! virtual filesystem, and an execution context are owned by an execution
//! unit; the unit drives the instruction pipeline; the scheduler
//! multiplexes program packages over a bounded pool of units and owns the
//! two pieces of genuinely shared state (the audit sink and the
//! locked-hash set).

mod audit;
mod context;
mod expr;
mod fault;
mod guard;
mod handlers;
mod ivfs;
mod net;
mod regs;
mod report;
mod sched;
mod unit;

pub use audit::{AuditRecord, AuditSink, AUDIT_FIELD_SEPARATOR};
pub use context::{
    ExecutionContext, ResourceLimits, ResourceUsage, ALLOWED_HOSTS_ENV, DEFAULT_MAX_INSTRUCTIONS,
};
pub use expr::{eval_condition, Condition};
pub use fault::{Fault, Outcome};
pub use guard::{
    check_execute, check_host_export, check_mount, check_network, check_vfs_remove,
    check_vfs_write, DENY_COMMAND_SUBSTRINGS,
};
pub use ivfs::{normalize, resolve, Ivfs, MountEntry, NodeKind, NodeStat};
pub use net::{FetchedTree, RemoteTransport, SimulatedTransport};
pub use regs::{Flags, RegisterFile, Slot, DEFAULT_CALL_DEPTH, GENERAL_SLOTS};
pub use report::{FailureInfo, RunReport, UnitStatus};
pub use sched::{
    JobHandle, LockSet, RuntimeConfig, Scheduler, StatusReport, SubmitError, UnitSnapshot,
    DEFAULT_POOL_SIZE,
};
pub use unit::{ExecutionUnit, PipelineStage, UnitShared, MAX_DELEGATION_DEPTH};
