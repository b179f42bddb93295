//! Segment finder invariants over randomized routines
//!
//! Soundness, disjointness and idempotence of the finder's output, plus a
//! compile pass over every generated routine to make sure each segment is
//! either installed or cleanly abandoned.

#![cfg(feature = "jit")]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dvm_engine::jit::{Classifier, CompilerContext, JitConfig, JitDriver, SegmentFinder};
use dvm_engine::vm::{IndexRange, Instruction, Opcode, Routine, ValueTag, ValueType};

// =============================================================================
// GENERATOR
// =============================================================================

const INT: i32 = ValueTag::Int as i32;
const BOOL_REG: i32 = 3;

fn types() -> Vec<ValueType> {
    vec![ValueType::Int, ValueType::Int, ValueType::Int, ValueType::Bool]
}

/// A random routine over int registers r0-r2 and bool register r3, with
/// arbitrary forward and backward branches
fn random_routine(rng: &mut StdRng, len: usize) -> Vec<Instruction> {
    (0..len)
        .map(|_| {
            let reg = |rng: &mut StdRng| rng.gen_range(0..3);
            let target = rng.gen_range(0..len) as i32;
            match rng.gen_range(0..10) {
                0 => Instruction::new(Opcode::Data, INT, rng.gen_range(-5..5), reg(rng)),
                1 => Instruction::new(Opcode::AddIII, reg(rng), reg(rng), reg(rng)),
                2 => Instruction::new(Opcode::SubIII, reg(rng), reg(rng), reg(rng)),
                3 => Instruction::new(Opcode::LtBII, reg(rng), reg(rng), BOOL_REG),
                4 => Instruction::new(Opcode::TestB, BOOL_REG, target, 0),
                5 => Instruction::new(Opcode::TestI, reg(rng), target, 0),
                6 => Instruction::new(Opcode::Goto, 0, target, 0),
                7 => Instruction::new(Opcode::Print, reg(rng), 0, 0),
                8 => Instruction::new(Opcode::Return, reg(rng), 1, 0),
                _ => Instruction::new(Opcode::MulIII, reg(rng), reg(rng), reg(rng)),
            }
        })
        .collect()
}

fn branch_target(ins: &Instruction) -> Option<usize> {
    ins.opcode.is_jump().then(|| ins.target())
}

fn bounds(ranges: &[IndexRange]) -> Vec<(usize, usize)> {
    ranges.iter().map(|r| (r.start, r.end)).collect()
}

fn check_invariants(classifier: &Classifier, code: &[Instruction], segments: &[IndexRange], min_len: usize) {
    let types = types();
    for pair in segments.windows(2) {
        assert!(pair[0].end < pair[1].start, "segments overlap or are unordered: {:?}", bounds(segments));
    }
    for seg in segments {
        assert!(seg.start <= seg.end && seg.end < code.len());
        assert!(seg.len() >= min_len);
        for i in seg.indices() {
            assert!(classifier.is_eligible(&code[i], &types), "ineligible {} in {}", i, seg);
            if let Some(t) = branch_target(&code[i]) {
                assert!(seg.admits_target(t), "branch at {} leaves {} for {}", i, seg, t);
            }
        }
    }
    // Single entry: nothing outside a segment branches into its interior
    for (i, ins) in code.iter().enumerate() {
        let Some(t) = branch_target(ins) else {
            continue;
        };
        for seg in segments {
            if !seg.contains(i) {
                assert!(!(t > seg.start && t <= seg.end), "branch {} -> {} enters {}", i, t, seg);
            }
        }
    }
}

// =============================================================================
// PROPERTIES
// =============================================================================

#[test]
fn test_random_routines_segment_soundly() {
    let classifier = Classifier::new();
    let mut rng = StdRng::seed_from_u64(0x5EC7);
    for min_len in [1, 3] {
        let finder = SegmentFinder::new(&classifier, min_len);
        for _ in 0..300 {
            let len = rng.gen_range(1..40);
            let code = random_routine(&mut rng, len);
            let segments = finder.find_in(&code, &types());
            check_invariants(&classifier, &code, &segments, min_len);
        }
    }
}

#[test]
fn test_refine_is_idempotent() {
    let classifier = Classifier::new();
    let finder = SegmentFinder::new(&classifier, 2);
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..300 {
        let len = rng.gen_range(1..40);
        let code = random_routine(&mut rng, len);
        let segments = finder.find_in(&code, &types());
        let again = finder.refine(&code, &types(), &segments);
        assert_eq!(bounds(&again), bounds(&segments));
    }
}

#[test]
fn test_nested_branch_chain_terminates() {
    // Every branch lands one past the previous one, so each split creates
    // a new entry for the next
    let classifier = Classifier::new();
    let finder = SegmentFinder::new(&classifier, 1);
    let n = 64;
    let mut code: Vec<Instruction> = (0..n).map(|i| Instruction::new(Opcode::Goto, 0, (i + 2) % n, 0)).collect();
    code.push(Instruction::new(Opcode::Print, 0, 0, 0));
    let mut types = types();
    types.truncate(1);
    let segments = finder.find_in(&code, &types);
    for pair in segments.windows(2) {
        assert!(pair[0].end < pair[1].start);
    }
    assert!(segments.iter().all(|s| s.end < n as usize));
}

#[test]
fn test_random_routines_compile_or_abandon() {
    let config = JitConfig {
        min_segment_len: 1,
        ..JitConfig::default()
    };
    let ctx = CompilerContext::new(config).unwrap();
    let driver = JitDriver::new(&ctx);
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..60 {
        let len = rng.gen_range(1..30);
        let code = random_routine(&mut rng, len);
        let routine = Routine::new("fuzz", code, types(), vec![]).unwrap();
        let report = driver.compile(&routine).unwrap();
        assert_eq!(report.installed.len() + report.abandoned.len(), report.segments.len());
        assert_eq!(routine.image().is_compiled(), report.is_installed());
    }
}
