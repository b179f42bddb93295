//! Compilation and execution from several threads
//!
//! One compiler context serves every thread. A routine is claimed by exactly
//! one compiler, and interpreters running the routine while it is compiled
//! see either the original image or the complete patched one.

#![cfg(feature = "jit")]

use std::sync::Arc;
use std::thread;

use dvm_engine::jit::{CompilerContext, JitConfig, JitDriver, JitError};
use dvm_engine::vm::{Instruction, Interpreter, JitState, Namespace, Opcode, Routine, Value, ValueTag, ValueType};

// =============================================================================
// HELPERS
// =============================================================================

const INT: i32 = ValueTag::Int as i32;

fn ins(op: Opcode, a: i32, b: i32, c: i32) -> Instruction {
    Instruction::new(op, a, b, c)
}

fn context() -> CompilerContext {
    CompilerContext::new(JitConfig {
        min_segment_len: 1,
        ..JitConfig::default()
    })
    .unwrap()
}

/// Sum of 1..=n in a loop, printed and returned
fn sum_routine(name: &str, n: i32) -> Routine {
    Routine::new(
        name,
        vec![
            ins(Opcode::Data, INT, 0, 0),
            ins(Opcode::Data, INT, 1, 1),
            ins(Opcode::Data, INT, n, 2),
            ins(Opcode::Data, INT, 1, 4),
            ins(Opcode::LeBII, 1, 2, 3),
            ins(Opcode::TestB, 3, 9, 0),
            ins(Opcode::AddIII, 0, 1, 0),
            ins(Opcode::AddIII, 1, 4, 1),
            ins(Opcode::Goto, 0, 4, 0),
            ins(Opcode::Print, 0, 0, 0),
            ins(Opcode::Return, 0, 1, 0),
        ],
        vec![ValueType::Int, ValueType::Int, ValueType::Int, ValueType::Bool, ValueType::Int],
        vec![],
    )
    .unwrap()
}

fn expected_sum(n: i64) -> i64 {
    n * (n + 1) / 2
}

// =============================================================================
// TESTS
// =============================================================================

#[test]
fn test_threads_compile_distinct_routines() {
    let ctx = context();
    let routines: Vec<Routine> = (0..8).map(|i| sum_routine(&format!("sum{}", i), 10 + i)).collect();

    thread::scope(|s| {
        for routine in &routines {
            let ctx = &ctx;
            s.spawn(move || {
                let report = JitDriver::new(ctx).compile(routine).unwrap();
                assert!(report.is_installed());
            });
        }
    });

    for (i, routine) in routines.iter().enumerate() {
        assert_eq!(routine.jit_state(), JitState::Installed);
        let mut interp = Interpreter::new(Namespace::default());
        let n = 10 + i as i64;
        assert_eq!(interp.run(routine), Ok(Value::int(expected_sum(n))));
        assert_eq!(interp.output(), format!("{}\n", expected_sum(n)));
    }
}

#[test]
fn test_routine_is_claimed_once() {
    let ctx = context();
    let routine = sum_routine("shared", 100);

    let results: Vec<Result<bool, JitError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (ctx, routine) = (&ctx, &routine);
                s.spawn(move || JitDriver::new(ctx).compile(routine).map(|r| r.is_installed()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let installed = results.iter().filter(|r| matches!(r, Ok(true))).count();
    let refused = results.iter().filter(|r| matches!(r, Err(JitError::AlreadyAnalyzed(_)))).count();
    assert_eq!(installed, 1);
    assert_eq!(refused, 7);
    assert_eq!(routine.jit_state(), JitState::Installed);
}

#[test]
fn test_execution_during_compilation() {
    let ctx = context();
    let driver = JitDriver::new(&ctx);
    let routine = Arc::new(sum_routine("busy", 1000));
    let expected = Value::int(expected_sum(1000));

    thread::scope(|s| {
        for _ in 0..4 {
            let routine = Arc::clone(&routine);
            let expected = expected.clone();
            let driver = &driver;
            s.spawn(move || {
                // The first run on each thread may trigger compilation
                let mut interp = Interpreter::new(Namespace::default()).with_hook(driver);
                for _ in 0..50 {
                    assert_eq!(interp.run(&routine), Ok(expected.clone()));
                }
            });
        }
    });

    assert_eq!(routine.jit_state(), JitState::Installed);
    assert!(routine.image().is_compiled());
}

#[test]
fn test_discard_while_running() {
    let ctx = context();
    let routine = sum_routine("discarded", 500);
    JitDriver::new(&ctx).compile(&routine).unwrap();
    let expected = Value::int(expected_sum(500));

    thread::scope(|s| {
        for _ in 0..4 {
            let (routine, expected) = (&routine, expected.clone());
            s.spawn(move || {
                let mut interp = Interpreter::new(Namespace::default());
                for _ in 0..50 {
                    assert_eq!(interp.run(routine), Ok(expected.clone()));
                }
            });
        }
        s.spawn(|| routine.discard_native_code());
    });

    assert_eq!(routine.jit_state(), JitState::Interpreted);
    assert!(!routine.image().is_compiled());
}
