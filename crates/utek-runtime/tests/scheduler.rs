//! Scheduler-level behavior: concurrency, isolation, locks, shutdown.

use std::time::Duration;

use serde_json::json;

use utek_pkg::{Instruction, Opcode, PackageHeader, ProgramPackage};
use utek_runtime::{RuntimeConfig, Scheduler, SubmitError, UnitStatus};

fn instr(opcode: Opcode) -> Instruction {
    Instruction::new(opcode)
}

/// A program that writes a marker file and then verifies it still holds
/// its own content. If two units shared a VFS, concurrent runs with
/// different markers would trip each other's hash check.
fn isolation_program(marker: &str) -> ProgramPackage {
    ProgramPackage::new(
        PackageHeader::default(),
        vec![
            instr(Opcode::Inject)
                .with_param("path", json!("/x"))
                .with_param("content", json!(marker)),
            instr(Opcode::Wait).with_param("duration_seconds", json!(0.01)),
            instr(Opcode::VerifyHash)
                .with_param("path", json!("/x"))
                .with_param("expected_hash", json!(utek_crypto::sha256_hex(marker.as_bytes()))),
        ],
    )
}

#[test]
fn concurrent_units_do_not_observe_each_other() {
    let scheduler = Scheduler::new(RuntimeConfig {
        pool_size: 4,
        ..RuntimeConfig::default()
    });

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let marker = format!("unit-marker-{i}");
            scheduler.submit(isolation_program(&marker)).unwrap()
        })
        .collect();

    for handle in handles {
        let report = handle.wait().unwrap();
        assert_eq!(report.status, UnitStatus::Completed, "{:?}", report.failure);
    }
    scheduler.drain();
}

#[test]
fn pool_processes_more_jobs_than_units() {
    let scheduler = Scheduler::new(RuntimeConfig {
        pool_size: 2,
        ..RuntimeConfig::default()
    });
    let program = ProgramPackage::new(
        PackageHeader::default(),
        vec![instr(Opcode::Log).with_param("message", json!("tick"))],
    );

    let handles: Vec<_> = (0..10)
        .map(|_| scheduler.submit(program.clone()).unwrap())
        .collect();
    for handle in handles {
        // Poll until the worker delivers the report.
        let report = loop {
            match handle.try_report() {
                Some(report) => break report,
                None => std::thread::sleep(Duration::from_millis(5)),
            }
        };
        assert!(report.succeeded());
    }

    let audit = scheduler.audit();
    assert_eq!(audit.len(), 10);
    scheduler.drain();
}

#[test]
fn lock_exec_blocks_resubmission_of_the_same_hash() {
    let scheduler = Scheduler::new(RuntimeConfig {
        pool_size: 1,
        ..RuntimeConfig::default()
    });
    // Lock, then linger long enough for a second submit to race the lock.
    let program = ProgramPackage::new(
        PackageHeader::default(),
        vec![
            instr(Opcode::LockExec),
            instr(Opcode::Wait).with_param("duration_seconds", json!(0.3)),
        ],
    );

    let first = scheduler.submit(program.clone()).unwrap();
    // Give the worker time to reach LOCK_EXEC.
    std::thread::sleep(Duration::from_millis(100));
    match scheduler.submit(program.clone()) {
        Err(SubmitError::HashLocked(hash)) => assert_eq!(hash, first.program_hash()),
        other => panic!("expected HashLocked, got {other:?}", other = other.map(|_| ())),
    }

    assert!(first.wait().unwrap().succeeded());
    // The lock is released when the run finishes.
    let again = scheduler.submit(program).unwrap();
    assert!(again.wait().unwrap().succeeded());
    scheduler.drain();
}

#[test]
fn shutdown_instruction_signals_the_scheduler() {
    let scheduler = Scheduler::new(RuntimeConfig {
        pool_size: 2,
        ..RuntimeConfig::default()
    });
    let program = ProgramPackage::new(
        PackageHeader::default(),
        vec![instr(Opcode::Shutdown).with_param("reason", json!("test teardown"))],
    );

    let handle = scheduler.submit(program).unwrap();
    let report = handle.wait().unwrap();
    assert_eq!(report.status, UnitStatus::Halted);
    assert!(scheduler.is_shutting_down());

    let late = ProgramPackage::new(
        PackageHeader::default(),
        vec![instr(Opcode::Log).with_param("message", json!("late"))],
    );
    assert!(matches!(
        scheduler.submit(late),
        Err(SubmitError::ShuttingDown)
    ));
    scheduler.shutdown(Duration::from_secs(1));
}

#[test]
fn status_reports_pool_shape() {
    let scheduler = Scheduler::new(RuntimeConfig {
        pool_size: 3,
        ..RuntimeConfig::default()
    });
    let status = scheduler.status();
    assert_eq!(status.pool_size, 3);
    assert_eq!(status.units.len(), 3);
    assert!(!status.shutting_down);
    scheduler.drain();
}

#[test]
fn audit_trail_interleaves_but_never_reorders_per_unit() {
    let scheduler = Scheduler::new(RuntimeConfig {
        pool_size: 4,
        ..RuntimeConfig::default()
    });
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let program = ProgramPackage::new(
                PackageHeader::default(),
                vec![
                    instr(Opcode::Log).with_param("message", json!(format!("first-{i}"))),
                    instr(Opcode::Log).with_param("message", json!(format!("second-{i}"))),
                ],
            );
            scheduler.submit(program).unwrap()
        })
        .collect();
    for handle in handles {
        assert!(handle.wait().unwrap().succeeded());
    }

    // Within each submitted program's trail, `first` precedes `second`.
    for record in scheduler.audit().records(None) {
        if let Some(suffix) = record.details.strip_prefix("second-") {
            let earlier = scheduler
                .audit()
                .records(None)
                .iter()
                .position(|r| r.details == format!("first-{suffix}"))
                .expect("matching first record");
            let later = scheduler
                .audit()
                .records(None)
                .iter()
                .position(|r| r.details == format!("second-{suffix}"))
                .unwrap();
            assert!(earlier < later);
        }
    }
    scheduler.drain();
}
