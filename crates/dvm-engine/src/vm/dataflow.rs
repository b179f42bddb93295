//! Register dataflow over a routine's instruction array
//!
//! Every instruction is its own CFG node. [`DataflowAnalysis`] computes
//! per-instruction definition and use sets, successors and predecessors, and
//! live-in register sets (iterated to a fixed point). Reaching definitions
//! are answered on demand by a backward walk from the use.
//!
//! The code generator only sees the [`DefUseFacts`] trait, so a front end
//! with its own analysis can supply the facts instead.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::vm::instruction::Instruction;
use crate::vm::opcode::{Layout, Opcode};
use crate::vm::range::IndexRange;
use crate::vm::routine::Routine;

/// Liveness and definition-chain queries used by the code generator
pub trait DefUseFacts {
    /// Whether the instruction at `def` is the only definition of `reg`
    /// reaching the use at `use_at` (the routine entry counts as a definition)
    fn is_unique_reaching_def(&self, reg: u16, def: usize, use_at: usize) -> bool;

    /// Whether `reg` is live at some point where control leaves `range`
    /// normally: the index after the range, or a return inside it
    fn is_live_out(&self, reg: u16, range: IndexRange) -> bool;

    /// Whether `reg` is live on entry to instruction `index`
    fn is_live_in(&self, reg: u16, index: usize) -> bool;
}

/// A definition reaching a use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Def {
    /// The value the register holds when the routine starts
    Entry,
    /// The instruction at this index
    At(usize),
}

/// Fixed-size register bitset
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegSet {
    words: Vec<u64>,
}

impl RegSet {
    pub fn with_capacity(nregs: usize) -> Self {
        RegSet {
            words: vec![0; nregs.div_ceil(64)],
        }
    }

    pub fn insert(&mut self, reg: u16) {
        let (w, b) = (reg as usize / 64, reg as usize % 64);
        if w >= self.words.len() {
            self.words.resize(w + 1, 0);
        }
        self.words[w] |= 1 << b;
    }

    pub fn remove(&mut self, reg: u16) {
        let (w, b) = (reg as usize / 64, reg as usize % 64);
        if let Some(word) = self.words.get_mut(w) {
            *word &= !(1 << b);
        }
    }

    pub fn contains(&self, reg: u16) -> bool {
        let (w, b) = (reg as usize / 64, reg as usize % 64);
        self.words.get(w).is_some_and(|word| word & (1 << b) != 0)
    }

    /// Add every register of `other`; returns whether anything changed
    pub fn union_with(&mut self, other: &RegSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut changed = false;
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            let merged = *mine | theirs;
            changed |= merged != *mine;
            *mine = merged;
        }
        changed
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            (0..64).filter(move |b| word & (1 << b) != 0).map(move |b| (w * 64 + b) as u16)
        })
    }
}

/// Registers written and read by one instruction
pub fn operand_roles(ins: &Instruction) -> (Vec<u16>, Vec<u16>) {
    let (a, b, c) = (ins.ra(), ins.rb(), ins.rc());
    let span = |base: u16, count: i32| (1..=count.max(0) as u16).map(move |k| base + k);
    match ins.opcode.layout() {
        Layout::Empty | Layout::Case => (vec![], vec![]),
        Layout::LoadC => (vec![c], vec![]),
        Layout::UnaryAC | Layout::StaticGet => (vec![c], vec![a]),
        Layout::UnaryBC => (vec![c], vec![b]),
        Layout::BinaryABC => (vec![c], vec![a, b]),
        Layout::StaticSet => (vec![], vec![a, c]),
        Layout::IndexSet => (vec![], vec![a, b, c]),
        Layout::IndexUpdate => (vec![c], vec![a, b, c]),
        Layout::MultiGet => (vec![c], std::iter::once(a).chain(span(a, ins.b)).collect()),
        Layout::MultiSet => (vec![], [a, c].into_iter().chain(span(c, ins.b)).collect()),
        Layout::ReadA | Layout::StoreA | Layout::TestA | Layout::Switch => (vec![], vec![a]),
        Layout::Return => (vec![], if ins.b != 0 { vec![a] } else { vec![] }),
    }
}

/// Control-flow successors of instruction `i` in a routine of `n` instructions.
///
/// Targets equal to `n` (routine end) produce no successor.
pub fn successors(code: &[Instruction], i: usize) -> Vec<usize> {
    let n = code.len();
    let ins = &code[i];
    let mut out = match ins.opcode {
        Opcode::Goto => vec![ins.target()],
        op if op.is_test() => vec![i + 1, ins.target()],
        Opcode::Switch => {
            let mut targets = vec![ins.target()];
            let count = ins.c.max(0) as usize;
            targets.extend(code.iter().skip(i + 1).take(count).map(Instruction::target));
            targets
        }
        Opcode::Case | Opcode::Return => vec![],
        _ => vec![i + 1],
    };
    out.retain(|&t| t < n);
    out.sort_unstable();
    out.dedup();
    out
}

/// Whether every path from `range.start` to `target` that stays inside
/// `range` passes through `def`
pub fn dominates_within(code: &[Instruction], range: IndexRange, def: usize, target: usize) -> bool {
    if def == range.start || def == target {
        return true;
    }
    let mut seen = vec![false; code.len()];
    let mut queue = VecDeque::from([range.start]);
    while let Some(i) = queue.pop_front() {
        if i == target {
            return false;
        }
        if i == def || std::mem::replace(&mut seen[i], true) {
            continue;
        }
        queue.extend(successors(code, i).into_iter().filter(|&s| range.contains(s)));
    }
    true
}

/// The single in-range definition of `reg` whose value can be carried as a
/// plain SSA value through compiled code, if the register qualifies.
///
/// Requires exactly one definition `d` in the range, `d` being the only
/// reaching definition at every in-range use, every use coming after `d` in
/// index order, and `d` dominating every use inside the range.
pub fn direct_value_def(
    facts: &(impl DefUseFacts + ?Sized),
    code: &[Instruction],
    reg: u16,
    range: IndexRange,
) -> Option<usize> {
    let mut defs = range.indices().filter(|&i| operand_roles(&code[i]).0.contains(&reg));
    let def = defs.next()?;
    if defs.next().is_some() {
        return None;
    }
    range
        .indices()
        .filter(|&i| operand_roles(&code[i]).1.contains(&reg))
        .all(|u| u > def && facts.is_unique_reaching_def(reg, def, u) && dominates_within(code, range, def, u))
        .then_some(def)
}

/// Bundled def/use, liveness, and reaching-definition analysis
#[derive(Debug, Clone)]
pub struct DataflowAnalysis {
    code: Arc<[Instruction]>,
    defs: Vec<Vec<u16>>,
    uses: Vec<Vec<u16>>,
    succs: Vec<Vec<usize>>,
    preds: Vec<Vec<usize>>,
    live_in: Vec<RegSet>,
    empty: RegSet,
}

impl DataflowAnalysis {
    pub fn new(routine: &Routine) -> Self {
        Self::from_code(routine.shared_instructions(), routine.register_count())
    }

    pub fn from_code(code: Arc<[Instruction]>, nregs: usize) -> Self {
        let n = code.len();
        let (defs, uses): (Vec<_>, Vec<_>) = code.iter().map(operand_roles).unzip();
        let succs: Vec<Vec<usize>> = (0..n).map(|i| successors(&code, i)).collect();
        let mut preds = vec![Vec::new(); n];
        for (i, out) in succs.iter().enumerate() {
            for &s in out {
                preds[s].push(i);
            }
        }

        let mut analysis = DataflowAnalysis {
            code,
            defs,
            uses,
            succs,
            preds,
            live_in: vec![RegSet::with_capacity(nregs); n],
            empty: RegSet::with_capacity(nregs),
        };
        analysis.solve_liveness(nregs);
        analysis
    }

    fn solve_liveness(&mut self, nregs: usize) {
        let n = self.code.len();
        let mut changed = true;
        while changed {
            changed = false;
            for i in (0..n).rev() {
                let mut live = RegSet::with_capacity(nregs);
                for &s in &self.succs[i] {
                    live.union_with(&self.live_in[s]);
                }
                for &d in &self.defs[i] {
                    live.remove(d);
                }
                for &u in &self.uses[i] {
                    live.insert(u);
                }
                changed |= self.live_in[i].union_with(&live);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn defs(&self, i: usize) -> &[u16] {
        &self.defs[i]
    }

    pub fn uses(&self, i: usize) -> &[u16] {
        &self.uses[i]
    }

    pub fn successors(&self, i: usize) -> &[usize] {
        &self.succs[i]
    }

    pub fn predecessors(&self, i: usize) -> &[usize] {
        &self.preds[i]
    }

    /// Registers live on entry to instruction `i` (empty past the end)
    pub fn live_in(&self, i: usize) -> &RegSet {
        self.live_in.get(i).unwrap_or(&self.empty)
    }

    /// Whether `reg` is live right after instruction `i` executes
    pub fn is_live_after(&self, reg: u16, i: usize) -> bool {
        self.succs[i].iter().any(|&s| self.is_live_in(reg, s))
    }

    /// All definitions of `reg` reaching the use at `use_at`
    pub fn reaching_defs(&self, reg: u16, use_at: usize) -> Vec<Def> {
        let mut found = Vec::new();
        if use_at == 0 {
            found.push(Def::Entry);
        }
        let mut seen = vec![false; self.len()];
        let mut queue: VecDeque<usize> = self.preds[use_at].iter().copied().collect();
        while let Some(p) = queue.pop_front() {
            if std::mem::replace(&mut seen[p], true) {
                continue;
            }
            if self.defs[p].contains(&reg) {
                found.push(Def::At(p));
                continue;
            }
            if p == 0 {
                found.push(Def::Entry);
            }
            queue.extend(self.preds[p].iter().copied());
        }
        found.sort_unstable();
        found.dedup();
        found
    }

    /// Points where control leaves `range` normally: the index after it
    /// (when inside the routine) and every return inside it
    pub fn exit_points(&self, range: IndexRange) -> Vec<usize> {
        let mut exits: Vec<usize> = range
            .indices()
            .filter(|&i| self.code[i].opcode == Opcode::Return)
            .collect();
        if range.end + 1 < self.len() {
            exits.push(range.end + 1);
        }
        exits
    }

    /// Instructions in `range` that define `reg`
    pub fn defs_in(&self, reg: u16, range: IndexRange) -> Vec<usize> {
        range.indices().filter(|&i| self.defs[i].contains(&reg)).collect()
    }

    /// Instructions in `range` that read `reg`
    pub fn uses_in(&self, reg: u16, range: IndexRange) -> Vec<usize> {
        range.indices().filter(|&i| self.uses[i].contains(&reg)).collect()
    }

    /// See [`direct_value_def`]
    pub fn direct_value_def(&self, reg: u16, range: IndexRange) -> Option<usize> {
        direct_value_def(self, &self.code, reg, range)
    }
}

impl DefUseFacts for DataflowAnalysis {
    fn is_unique_reaching_def(&self, reg: u16, def: usize, use_at: usize) -> bool {
        self.reaching_defs(reg, use_at) == [Def::At(def)]
    }

    fn is_live_out(&self, reg: u16, range: IndexRange) -> bool {
        self.exit_points(range).into_iter().any(|p| self.live_in(p).contains(reg))
    }

    fn is_live_in(&self, reg: u16, index: usize) -> bool {
        self.live_in(index).contains(reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(op: Opcode, a: i32, b: i32, c: i32) -> Instruction {
        Instruction::new(op, a, b, c)
    }

    fn analyze(code: Vec<Instruction>, nregs: usize) -> DataflowAnalysis {
        DataflowAnalysis::from_code(code.into(), nregs)
    }

    #[test]
    fn test_roles() {
        let (d, u) = operand_roles(&ins(Opcode::AddIII, 0, 1, 2));
        assert_eq!((d, u), (vec![2], vec![0, 1]));
        let (d, u) = operand_roles(&ins(Opcode::ArrayGetMultiI, 3, 2, 0));
        assert_eq!((d, u), (vec![0], vec![3, 4, 5]));
        let (d, u) = operand_roles(&ins(Opcode::ArraySetMultiF, 1, 2, 4));
        assert_eq!((d, u), (vec![], vec![1, 4, 5, 6]));
        let (d, u) = operand_roles(&ins(Opcode::Return, 7, 0, 0));
        assert!(d.is_empty() && u.is_empty());
    }

    #[test]
    fn test_successors() {
        let code = vec![
            ins(Opcode::TestB, 0, 3, 0),
            ins(Opcode::Switch, 1, 4, 1),
            ins(Opcode::Case, 0, 0, 0),
            ins(Opcode::Goto, 0, 5, 0),
            ins(Opcode::Return, 0, 0, 0),
        ];
        assert_eq!(successors(&code, 0), vec![1, 3]);
        assert_eq!(successors(&code, 1), vec![0, 4]);
        assert!(successors(&code, 2).is_empty());
        assert!(successors(&code, 3).is_empty());
        assert!(successors(&code, 4).is_empty());
    }

    #[test]
    fn test_liveness_through_loop() {
        // r0 = 0; loop: r0 = r0 + r1; if r2 goto loop; return r0
        let df = analyze(
            vec![
                ins(Opcode::GetConstI, 0, 0, 0),
                ins(Opcode::AddIII, 0, 1, 0),
                ins(Opcode::TestB, 2, 4, 0),
                ins(Opcode::Goto, 0, 1, 0),
                ins(Opcode::Return, 0, 1, 0),
            ],
            3,
        );
        assert!(!df.is_live_in(0, 0));
        assert!(df.is_live_in(1, 0));
        assert!(df.is_live_in(0, 1));
        assert!(df.is_live_in(2, 3));
        assert!(df.is_live_after(0, 2));
        assert_eq!(df.live_in(4).iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_reaching_defs() {
        let df = analyze(
            vec![
                ins(Opcode::TestB, 0, 3, 0),
                ins(Opcode::GetConstI, 0, 0, 1),
                ins(Opcode::Goto, 0, 4, 0),
                ins(Opcode::GetConstI, 0, 1, 1),
                ins(Opcode::Return, 1, 1, 0),
            ],
            2,
        );
        assert_eq!(df.reaching_defs(1, 4), vec![Def::At(1), Def::At(3)]);
        assert_eq!(df.reaching_defs(0, 0), vec![Def::Entry]);
        assert!(!df.is_unique_reaching_def(1, 1, 4));
    }

    #[test]
    fn test_entry_reaches_past_conditional_def() {
        let df = analyze(
            vec![
                ins(Opcode::TestB, 0, 2, 0),
                ins(Opcode::GetConstI, 0, 0, 1),
                ins(Opcode::Return, 1, 1, 0),
            ],
            2,
        );
        assert_eq!(df.reaching_defs(1, 2), vec![Def::Entry, Def::At(1)]);
    }

    #[test]
    fn test_direct_value_rules() {
        let code = vec![
            ins(Opcode::GetConstI, 0, 0, 0),
            ins(Opcode::AddIII, 0, 0, 1),
            ins(Opcode::TestB, 2, 4, 0),
            ins(Opcode::GetConstI, 0, 0, 3),
            ins(Opcode::MoveII, 3, 0, 4),
            ins(Opcode::Return, 1, 1, 0),
        ];
        let df = analyze(code, 5);
        let all = IndexRange::new(0, 5);
        assert_eq!(df.direct_value_def(0, all), Some(0));
        assert_eq!(df.direct_value_def(1, all), Some(1));
        // r3 defined at 3 but read at 4 which is also reachable around it
        assert_eq!(df.direct_value_def(3, all), None);
        // Not defined inside the range
        assert_eq!(df.direct_value_def(2, all), None);
        // Definition just before the range start does not count
        assert_eq!(df.direct_value_def(0, IndexRange::new(1, 5)), None);
    }

    #[test]
    fn test_self_redefinition_is_not_direct() {
        let df = analyze(
            vec![
                ins(Opcode::GetConstI, 0, 0, 0),
                ins(Opcode::AddIII, 0, 0, 0),
                ins(Opcode::Return, 0, 1, 0),
            ],
            1,
        );
        assert_eq!(df.direct_value_def(0, IndexRange::new(0, 2)), None);
    }

    #[test]
    fn test_live_out_counts_returns() {
        let df = analyze(
            vec![ins(Opcode::AddIII, 0, 1, 2), ins(Opcode::Return, 2, 1, 0), ins(Opcode::Return, 0, 1, 0)],
            3,
        );
        let first = IndexRange::new(0, 1);
        assert_eq!(df.exit_points(first), vec![1, 2]);
        assert!(df.is_live_out(2, first));
        assert!(df.is_live_out(0, first));
        assert!(!df.is_live_out(1, first));
    }
}
