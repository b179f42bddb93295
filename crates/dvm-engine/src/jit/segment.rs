//! Segment finder
//!
//! Partitions a routine into disjoint runs of compilable instructions:
//!
//! 1. Group maximal runs of classifier-eligible instructions. A `Case` joins
//!    a run only while it belongs to the case group of an eligible `Switch`.
//! 2. Inside each run, cut out every branch-family instruction whose targets
//!    leave the run, and every switch group that is not wholly inside it or
//!    dispatches on a non-integral register.
//! 3. Split a run wherever a branch from outside it lands strictly inside.
//! 4. Drop runs shorter than the minimum length.
//!
//! Steps 2 and 3 repeat until nothing changes. Each excision removes covered
//! instructions and each split adds a run, so
//! `covered * (n + 2) + (n - runs)` strictly decreases and the loop ends.

use std::collections::BTreeSet;

use tracing::trace;

use crate::jit::classify::Classifier;
use crate::vm::{IndexRange, Instruction, Opcode, Routine, ValueType};

/// Finds compilable segments under a classifier
#[derive(Debug, Clone)]
pub struct SegmentFinder<'c> {
    classifier: &'c Classifier,
    min_len: usize,
}

impl<'c> SegmentFinder<'c> {
    pub fn new(classifier: &'c Classifier, min_len: usize) -> Self {
        SegmentFinder { classifier, min_len }
    }

    /// Segments of a routine, in index order
    pub fn find(&self, routine: &Routine) -> Vec<IndexRange> {
        self.find_in(routine.instructions(), routine.types())
    }

    /// Segments of a bare instruction array under the given register types
    pub fn find_in(&self, code: &[Instruction], types: &[ValueType]) -> Vec<IndexRange> {
        let runs = self.group(code, types);
        self.settle(code, types, runs)
    }

    /// Re-run the validation, splitting, and length filter over candidate
    /// ranges. Applied to this finder's own output it changes nothing.
    pub fn refine(&self, code: &[Instruction], types: &[ValueType], ranges: &[IndexRange]) -> Vec<IndexRange> {
        let runs = ranges.iter().copied().filter(|r| !r.is_empty() && r.end < code.len()).collect();
        self.settle(code, types, runs)
    }

    fn group(&self, code: &[Instruction], types: &[ValueType]) -> BTreeSet<IndexRange> {
        let mut runs = BTreeSet::new();
        let mut start = None;
        let mut cases_left = 0usize;
        for (i, ins) in code.iter().enumerate() {
            let eligible = if ins.opcode == Opcode::Case {
                let in_group = cases_left > 0;
                cases_left = cases_left.saturating_sub(1);
                in_group
            } else {
                let eligible = self.classifier.is_eligible(ins, types);
                cases_left = if eligible && ins.opcode == Opcode::Switch { ins.c.max(0) as usize } else { 0 };
                eligible
            };
            match (eligible, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    runs.insert(IndexRange::new(s, i - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.insert(IndexRange::new(s, code.len() - 1));
        }
        runs
    }

    fn settle(&self, code: &[Instruction], types: &[ValueType], mut runs: BTreeSet<IndexRange>) -> Vec<IndexRange> {
        loop {
            let excised = excise_offenders(code, types, &mut runs);
            let split = split_at_entries(code, &mut runs);
            if !excised && !split {
                break;
            }
        }
        runs.into_iter().filter(|r| !r.is_empty() && r.len() >= self.min_len).collect()
    }
}

/// A branch target usable from inside `run`: inside it or right after it,
/// and never a case entry
fn target_ok(code: &[Instruction], run: IndexRange, target: usize) -> bool {
    run.admits_target(target) && code.get(target).map_or(true, |t| t.opcode != Opcode::Case)
}

/// Whether the case at `j` belongs to a switch inside `run`
fn case_in_group(code: &[Instruction], run: IndexRange, j: usize) -> bool {
    let mut k = j;
    while k > run.start && code[k - 1].opcode == Opcode::Case {
        k -= 1;
    }
    k > run.start && code[k - 1].opcode == Opcode::Switch && k - 1 + code[k - 1].c.max(0) as usize >= j
}

/// The first instruction span inside `run` that must not be compiled as
/// part of it
fn first_offender(code: &[Instruction], types: &[ValueType], run: IndexRange) -> Option<IndexRange> {
    for j in run.indices() {
        let ins = &code[j];
        match ins.opcode {
            Opcode::Case => {
                if j == run.start || !case_in_group(code, run, j) {
                    return Some(IndexRange::point(j));
                }
            }
            op if op.is_jump() => {
                if !target_ok(code, run, ins.target()) {
                    return Some(IndexRange::point(j));
                }
            }
            Opcode::Switch => {
                let group_end = j + ins.c.max(0) as usize;
                let integral = types.get(ins.ra() as usize).is_some_and(ValueType::is_integral);
                let targets_ok = target_ok(code, run, ins.target())
                    && code[j + 1..=group_end.min(code.len() - 1)]
                        .iter()
                        .all(|case| target_ok(code, run, case.target()));
                if group_end > run.end || !integral || !targets_ok {
                    return Some(IndexRange::new(j, group_end.min(run.end)));
                }
            }
            _ => {}
        }
    }
    None
}

fn excise_offenders(code: &[Instruction], types: &[ValueType], runs: &mut BTreeSet<IndexRange>) -> bool {
    let snapshot: Vec<IndexRange> = runs.iter().copied().collect();
    let mut changed = false;
    for run in snapshot {
        let Some(cut) = first_offender(code, types, run) else {
            continue;
        };
        trace!("excise {} from segment {}: {}", cut, run, code[cut.start].opcode);
        runs.remove(&run);
        if cut.start > run.start {
            runs.insert(IndexRange::new(run.start, cut.start - 1));
        }
        if cut.end < run.end {
            runs.insert(IndexRange::new(cut.end + 1, run.end));
        }
        changed = true;
    }
    changed
}

/// Explicit branch targets of instruction `i`
fn branch_targets(code: &[Instruction], i: usize) -> Vec<usize> {
    let ins = &code[i];
    match ins.opcode {
        op if op.is_jump() => vec![ins.target()],
        Opcode::Switch => {
            let mut targets = vec![ins.target()];
            targets.extend(code.iter().skip(i + 1).take(ins.c.max(0) as usize).map(Instruction::target));
            targets
        }
        _ => vec![],
    }
}

fn split_at_entries(code: &[Instruction], runs: &mut BTreeSet<IndexRange>) -> bool {
    let mut cuts: Vec<(IndexRange, usize)> = Vec::new();
    for i in 0..code.len() {
        for target in branch_targets(code, i) {
            if let Some(run) = runs.get(&IndexRange::point(target)) {
                if target > run.start && !run.contains(i) {
                    cuts.push((*run, target));
                }
            }
        }
    }
    if cuts.is_empty() {
        return false;
    }
    cuts.sort_by_key(|&(run, at)| (run.start, at));
    cuts.dedup_by_key(|&mut (run, at)| (run.start, at));

    let mut k = 0;
    while k < cuts.len() {
        let run = cuts[k].0;
        runs.remove(&run);
        let mut start = run.start;
        while k < cuts.len() && cuts[k].0.start == run.start {
            let at = cuts[k].1;
            trace!("split segment {} at entry {}", run, at);
            runs.insert(IndexRange::new(start, at - 1));
            start = at;
            k += 1;
        }
        runs.insert(IndexRange::new(start, run.end));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ValueTag;

    fn ins(op: Opcode, a: i32, b: i32, c: i32) -> Instruction {
        Instruction::new(op, a, b, c)
    }

    fn bounds(ranges: &[IndexRange]) -> Vec<(usize, usize)> {
        ranges.iter().map(|r| (r.start, r.end)).collect()
    }

    const INT: i32 = ValueTag::Int as i32;

    #[test]
    fn test_groups_around_ineligible() {
        let classifier = Classifier::new();
        let finder = SegmentFinder::new(&classifier, 1);
        let code = vec![
            ins(Opcode::Data, INT, 1, 0),
            ins(Opcode::AddIII, 0, 0, 1),
            ins(Opcode::Print, 1, 0, 0),
            ins(Opcode::SubIII, 1, 0, 2),
        ];
        let types = vec![ValueType::Int; 3];
        assert_eq!(bounds(&finder.find_in(&code, &types)), vec![(0, 1), (3, 3)]);
    }

    #[test]
    fn test_min_length_filter() {
        let classifier = Classifier::new();
        let finder = SegmentFinder::new(&classifier, 2);
        let code = vec![
            ins(Opcode::Data, INT, 1, 0),
            ins(Opcode::AddIII, 0, 0, 1),
            ins(Opcode::Print, 1, 0, 0),
            ins(Opcode::SubIII, 1, 0, 2),
        ];
        assert_eq!(bounds(&finder.find_in(&code, &vec![ValueType::Int; 3])), vec![(0, 1)]);
    }

    #[test]
    fn test_branch_leaving_run_is_excised() {
        let classifier = Classifier::new();
        let finder = SegmentFinder::new(&classifier, 1);
        // The goto at 1 leaves the run [0, 2] for index 4
        let code = vec![
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Goto, 0, 4, 0),
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Print, 0, 0, 0),
            ins(Opcode::Nop, 0, 0, 0),
        ];
        assert_eq!(bounds(&finder.find_in(&code, &[ValueType::Any])), vec![(0, 0), (2, 2), (4, 4)]);
    }

    #[test]
    fn test_outside_entry_splits() {
        let classifier = Classifier::new();
        let finder = SegmentFinder::new(&classifier, 1);
        let code = vec![
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Test, 0, 1, 0),
        ];
        // Test is never eligible; its jump into index 1 splits [0, 2]
        assert_eq!(bounds(&finder.find_in(&code, &[ValueType::Any])), vec![(0, 0), (1, 2)]);
    }

    #[test]
    fn test_switch_group_kept_whole() {
        let classifier = Classifier::new();
        let finder = SegmentFinder::new(&classifier, 1);
        let code = vec![
            ins(Opcode::Data, INT, 1, 0),
            ins(Opcode::Switch, 0, 5, 2),
            ins(Opcode::Case, 0, 4, 0),
            ins(Opcode::Case, 1, 5, 0),
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Nop, 0, 0, 0),
        ];
        assert_eq!(bounds(&finder.find_in(&code, &[ValueType::Int])), vec![(0, 5)]);
    }

    #[test]
    fn test_switch_on_float_is_excised_with_cases() {
        let classifier = Classifier::new();
        let finder = SegmentFinder::new(&classifier, 1);
        let code = vec![
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Switch, 0, 4, 2),
            ins(Opcode::Case, 0, 4, 0),
            ins(Opcode::Case, 1, 4, 0),
            ins(Opcode::Nop, 0, 0, 0),
        ];
        assert_eq!(bounds(&finder.find_in(&code, &[ValueType::Float])), vec![(0, 0), (4, 4)]);
    }

    #[test]
    fn test_self_loop_is_one_segment() {
        let classifier = Classifier::new();
        let finder = SegmentFinder::new(&classifier, 1);
        let code = vec![ins(Opcode::Goto, 0, 0, 0)];
        assert_eq!(bounds(&finder.find_in(&code, &[])), vec![(0, 0)]);
    }

    #[test]
    fn test_refine_is_idempotent() {
        let classifier = Classifier::new();
        let finder = SegmentFinder::new(&classifier, 1);
        let code = vec![
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::TestI, 0, 4, 0),
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Print, 0, 0, 0),
            ins(Opcode::Goto, 0, 2, 0),
        ];
        let types = [ValueType::Int];
        let found = finder.find_in(&code, &types);
        assert_eq!(bounds(&finder.refine(&code, &types, &found)), bounds(&found));
    }
}
