//! End-to-end pipeline behavior on a single execution unit.

use std::sync::Arc;

use serde_json::json;

use utek_crypto::CryptoEngine;
use utek_pkg::{Instruction, Opcode, PackageHeader, ProgramPackage};
use utek_policy::{ExecutionMode, NetworkMode};
use utek_runtime::{
    ExecutionUnit, ResourceLimits, SimulatedTransport, UnitShared, UnitStatus, ALLOWED_HOSTS_ENV,
};

fn unit() -> ExecutionUnit {
    ExecutionUnit::new(
        0,
        UnitShared::standalone(Arc::new(SimulatedTransport)),
        CryptoEngine::new(),
    )
}

fn unit_with_limits(limits: ResourceLimits) -> ExecutionUnit {
    ExecutionUnit::with_limits(
        0,
        UnitShared::standalone(Arc::new(SimulatedTransport)),
        CryptoEngine::new(),
        limits,
    )
}

fn package(header: PackageHeader, instructions: Vec<Instruction>) -> ProgramPackage {
    ProgramPackage::new(header, instructions)
}

fn instr(opcode: Opcode) -> Instruction {
    Instruction::new(opcode)
}

#[test]
fn offline_fetch_repo_is_a_policy_violation() {
    let header = PackageHeader {
        networking_mode: NetworkMode::Offline,
        ..PackageHeader::default()
    };
    let program = package(
        header,
        vec![instr(Opcode::FetchRepo).with_param("url", json!("https://example.com/repo.git"))],
    );

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    let failure = report.failure.expect("failure info");
    assert_eq!(failure.opcode, "FETCH_REPO");
    assert_eq!(failure.outcome, "POLICY_VIOLATION");
    assert!(report
        .audit_trail
        .iter()
        .any(|line| line.contains("POLICY_VIOLATION")));
}

#[test]
fn if_else_takes_exactly_one_branch() {
    let program = package(
        PackageHeader::default(),
        vec![
            instr(Opcode::SetEnv).with_param("X", json!("1")),
            instr(Opcode::If).with_param("condition", json!("env.X == '1'")),
            instr(Opcode::Log).with_param("message", json!("yes")),
            instr(Opcode::Else),
            instr(Opcode::Log).with_param("message", json!("no")),
            instr(Opcode::Endif),
            instr(Opcode::Halt),
        ],
    );

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Halted);
    let trail = report.audit_trail.join("\n");
    assert!(trail.contains("yes"), "trail: {trail}");
    assert!(!trail.contains("| no"), "trail: {trail}");
}

#[test]
fn false_condition_runs_only_the_else_branch() {
    let program = package(
        PackageHeader::default(),
        vec![
            instr(Opcode::If).with_param("condition", json!("env.MISSING == 'set'")),
            instr(Opcode::Log).with_param("message", json!("then-branch")),
            instr(Opcode::Else),
            instr(Opcode::Log).with_param("message", json!("else-branch")),
            instr(Opcode::Endif),
            instr(Opcode::Halt),
        ],
    );

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Halted);
    let trail = report.audit_trail.join("\n");
    assert!(trail.contains("else-branch"));
    assert!(!trail.contains("then-branch"));
}

#[test]
fn call_returns_to_the_instruction_after_call() {
    let program = package(
        PackageHeader::default(),
        vec![
            instr(Opcode::Call).with_param("target_label", json!("sub")),
            instr(Opcode::Halt).with_param("reason", json!("after subroutine")),
            instr(Opcode::Log)
                .with_label("sub")
                .with_param("message", json!("inside sub")),
            instr(Opcode::Ret),
        ],
    );

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Halted);
    let opcodes: Vec<&str> = report
        .audit_trail
        .iter()
        .map(|line| line.split(" | ").nth(2).unwrap())
        .collect();
    assert_eq!(opcodes, vec!["CALL", "LOG", "RET", "HALT"]);
    // RET resumed at the index immediately following the CALL.
    assert!(report.audit_trail[2].contains("return -> 1"));
}

#[test]
fn unmatched_ret_is_a_stack_fault() {
    let program = package(PackageHeader::default(), vec![instr(Opcode::Ret)]);
    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    assert_eq!(report.failure.unwrap().outcome, "STACK_FAULT");
}

#[test]
fn jump_to_unknown_label_is_fatal() {
    let program = package(
        PackageHeader::default(),
        vec![instr(Opcode::Jump).with_param("target_label", json!("nowhere"))],
    );
    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    assert_eq!(report.failure.unwrap().outcome, "INVALID_LABEL");
}

#[test]
fn network_quota_fails_the_exceeding_call() {
    let limits = ResourceLimits {
        max_network_ops: 2,
        ..ResourceLimits::default()
    };
    let header = PackageHeader {
        networking_mode: NetworkMode::Full,
        ..PackageHeader::default()
    };
    let program = package(
        header,
        vec![
            instr(Opcode::InvokeRemote).with_param("endpoint", json!("https://api.example.com/1")),
            instr(Opcode::InvokeRemote).with_param("endpoint", json!("https://api.example.com/2")),
            instr(Opcode::InvokeRemote).with_param("endpoint", json!("https://api.example.com/3")),
        ],
    );

    let report = unit_with_limits(limits).run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    assert_eq!(report.usage.network_ops, 2);
    let failure = report.failure.unwrap();
    assert_eq!(failure.outcome, "RESOURCE_LIMIT_EXCEEDED");
    // The first two calls succeeded.
    let successes = report
        .audit_trail
        .iter()
        .filter(|line| line.contains("INVOKE_REMOTE | SUCCESS"))
        .count();
    assert_eq!(successes, 2);
}

#[test]
fn restricted_outbound_consults_the_allow_list() {
    let header = PackageHeader {
        networking_mode: NetworkMode::RestrictedOutbound,
        ..PackageHeader::default()
    };
    let program = package(
        header,
        vec![
            instr(Opcode::SetEnv).with_param(ALLOWED_HOSTS_ENV, json!("api.example.com")),
            instr(Opcode::InvokeRemote).with_param("endpoint", json!("https://api.example.com/v1")),
            instr(Opcode::InvokeRemote).with_param("endpoint", json!("https://blocked.example.org/")),
        ],
    );

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    let failure = report.failure.unwrap();
    assert_eq!(failure.outcome, "POLICY_VIOLATION");
    assert!(failure.detail.contains("blocked.example.org"));
}

#[test]
fn jump_loops_hit_the_instruction_ceiling() {
    let limits = ResourceLimits {
        max_instructions: 25,
        ..ResourceLimits::default()
    };
    let program = package(
        PackageHeader::default(),
        vec![instr(Opcode::Jump)
            .with_label("spin")
            .with_param("target_label", json!("spin"))],
    );

    let report = unit_with_limits(limits).run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    assert_eq!(report.failure.unwrap().outcome, "RESOURCE_LIMIT_EXCEEDED");
    assert_eq!(report.instructions_executed, 26);
}

#[test]
fn assert_failure_is_fatal_with_message() {
    let program = package(
        PackageHeader::default(),
        vec![
            instr(Opcode::SetEnv).with_param("STAGE", json!("prod")),
            instr(Opcode::Assert)
                .with_param("condition", json!("env.STAGE == 'dev'"))
                .with_param("message", json!("expected a dev stage")),
            instr(Opcode::Log).with_param("message", json!("unreachable")),
        ],
    );

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    let failure = report.failure.unwrap();
    assert_eq!(failure.outcome, "ASSERTION_FAILURE");
    assert_eq!(failure.detail, "assertion failure: expected a dev stage");
    assert!(!report.audit_trail.join("\n").contains("unreachable"));
}

#[test]
fn readonly_vfs_rejects_inject() {
    let header = PackageHeader {
        security_flags: "sandboxed,vfs-readonly".to_string(),
        ..PackageHeader::default()
    };
    let program = package(
        header,
        vec![instr(Opcode::Inject)
            .with_param("path", json!("/data.txt"))
            .with_param("content", json!("payload"))],
    );

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    assert_eq!(report.failure.unwrap().outcome, "POLICY_VIOLATION");
}

#[test]
fn vfs_byte_quota_rejects_oversized_writes() {
    let limits = ResourceLimits {
        max_vfs_bytes: 16,
        ..ResourceLimits::default()
    };
    let program = package(
        PackageHeader::default(),
        vec![instr(Opcode::Inject)
            .with_param("path", json!("/big.txt"))
            .with_param("content", json!("this content is longer than sixteen bytes"))],
    );

    let report = unit_with_limits(limits).run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    assert_eq!(report.failure.unwrap().outcome, "RESOURCE_LIMIT_EXCEEDED");
}

#[test]
fn alu_ops_set_flags_and_branch() {
    let program = package(
        PackageHeader::default(),
        vec![
            instr(Opcode::Add)
                .with_param("dest", json!(0))
                .with_param("val1", json!(2))
                .with_param("val2", json!(3)),
            instr(Opcode::Sub)
                .with_param("dest", json!(1))
                .with_param("src1", json!(0))
                .with_param("val2", json!(5)),
            // r1 == 0, so JZ takes the branch over the failing assert.
            instr(Opcode::Jz).with_param("target_label", json!("done")),
            instr(Opcode::Assert).with_param("condition", json!("false")),
            instr(Opcode::Halt).with_label("done").with_param("reason", json!("flags ok")),
        ],
    );

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Halted, "{:?}", report.failure);
}

#[test]
fn division_by_zero_is_an_arithmetic_fault() {
    let program = package(
        PackageHeader::default(),
        vec![instr(Opcode::Div)
            .with_param("dest", json!(0))
            .with_param("val1", json!(10))
            .with_param("val2", json!(0))],
    );
    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    assert!(report.failure.unwrap().detail.contains("division by zero"));
}

#[test]
fn dry_run_simulates_effectful_instructions() {
    let header = PackageHeader {
        execution_mode: ExecutionMode::DryRun,
        ..PackageHeader::default()
    };
    let program = package(
        header,
        vec![
            instr(Opcode::Inject)
                .with_param("path", json!("/out.txt"))
                .with_param("content", json!("data")),
            instr(Opcode::VerifyHash)
                .with_param("path", json!("/out.txt"))
                .with_param("expected_hash", json!("irrelevant")),
        ],
    );

    let report = unit().run(&program);
    // The write was simulated, so the hash check cannot find the file.
    assert_eq!(report.status, UnitStatus::Failed);
    let trail = report.audit_trail.join("\n");
    assert!(trail.contains("INJECT | DRY_RUN"), "trail: {trail}");
}

#[test]
fn vfs_seed_is_visible_to_instructions() {
    let mut program = package(
        PackageHeader::default(),
        vec![instr(Opcode::VerifyHash)
            .with_param("path", json!("/etc/motd"))
            .with_param("expected_hash", json!(utek_crypto::sha256_hex(b"hello\n")))],
    );
    program.vfs_seed = json!({ "etc": { "motd": "hello\n" } });

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Completed, "{:?}", report.failure);
}

#[test]
fn encrypt_decrypt_round_trip_in_vfs() {
    let key = "11".repeat(32);
    let mut program = package(
        PackageHeader::default(),
        vec![
            instr(Opcode::Encrypt)
                .with_param("path", json!("/secret.txt"))
                .with_param("key_hex", json!(key)),
            instr(Opcode::Decrypt)
                .with_param("path", json!("/secret.txt.enc"))
                .with_param("key_hex", json!(key))
                .with_param("output_path", json!("/roundtrip.txt")),
            instr(Opcode::VerifyHash)
                .with_param("path", json!("/roundtrip.txt"))
                .with_param("expected_hash", json!(utek_crypto::sha256_hex(b"attack at dawn"))),
        ],
    );
    program.vfs_seed = json!({ "secret.txt": "attack at dawn" });

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Completed, "{:?}", report.failure);
}

#[test]
fn export_lands_in_the_report() {
    let mut program = package(
        PackageHeader::default(),
        vec![instr(Opcode::Export).with_param("source_path", json!("/data"))],
    );
    program.vfs_seed = json!({ "data": { "a.txt": "alpha" } });

    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Completed);
    assert_eq!(report.exports.len(), 1);
    assert_eq!(report.exports[0]["tree"]["a.txt"], "alpha");
}

#[test]
fn wait_beyond_budget_times_out() {
    let program = package(
        PackageHeader::default(),
        vec![{
            let mut i = instr(Opcode::Wait).with_param("duration_seconds", json!(5.0));
            i.timeout_seconds = 0.05;
            i
        }],
    );
    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    assert_eq!(report.failure.unwrap().outcome, "TIMEOUT");
}

#[test]
fn retries_follow_failures_before_giving_up() {
    // The simulated transport always succeeds, so drive retries with a
    // missing-file handler fault instead.
    let program = package(
        PackageHeader::default(),
        vec![{
            let mut i = instr(Opcode::Compile).with_param("source_path", json!("/absent.src"));
            i.retry_attempts = 2;
            i.timeout_seconds = 5.0;
            i
        }],
    );
    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    // One audit record for the instruction regardless of attempts.
    assert_eq!(report.audit_trail.len(), 1);
}

#[test]
fn global_time_budget_is_fatal() {
    let header = PackageHeader {
        time_budget: "max-exec-time=0s".to_string(),
        ..PackageHeader::default()
    };
    let program = package(
        header,
        vec![
            instr(Opcode::Wait).with_param("duration_seconds", json!(0.05)),
            instr(Opcode::Log).with_param("message", json!("late")),
        ],
    );
    let report = unit().run(&program);
    assert_eq!(report.status, UnitStatus::Failed);
    assert_eq!(report.failure.unwrap().outcome, "TIMEOUT");
}
