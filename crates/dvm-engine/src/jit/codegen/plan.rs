//! Segment plan: everything translation needs to know before emitting IR
//!
//! The plan maps every block leader of a segment to an opaque [`BlockId`],
//! picks a storage class for each scalar register the segment touches,
//! records which compares fuse into the following test, and which
//! [`CallData`](crate::vm::CallData) pointers the entry block must load.
//! Building it emits no code, so translation only ever resolves branch
//! targets through [`BlockPlan::target`].

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::jit::codegen::{is_translatable, CodegenError};
use crate::jit::context::JitConfig;
use crate::vm::dataflow::{direct_value_def, operand_roles};
use crate::vm::{DefUseFacts, IndexRange, Instruction, Opcode, Routine, ScalarKind};

/// Index of a native block in the plan's block arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a branch inside the segment lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Block(BlockId),
    /// The instruction right after the segment: leave through the success exit
    Exit,
}

/// How a scalar register is carried through compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// A plain SSA value defined once at `def`; stored to the register file
    /// at the definition when `write_through` is set
    Direct { def: usize, write_through: bool },
    /// A frontend variable loaded at entry; stored back at both exits when
    /// `flush` is set
    Stack { defined: bool, flush: bool },
}

/// Storage decision for one scalar register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegPlan {
    pub kind: ScalarKind,
    pub storage: Storage,
}

/// Call data pointers the segment dereferences besides the register file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallDataNeeds {
    pub constants: bool,
    pub object_fields: bool,
    pub class_statics: bool,
    pub globals: bool,
    pub outer_frames: bool,
}

impl CallDataNeeds {
    fn note(&mut self, op: Opcode) {
        use Opcode::*;
        match op {
            GetConst | GetConstS => self.constants = true,
            GetVarOB | GetVarOI | GetVarOF | GetVarOC | SetVarOB | SetVarOI | SetVarOF | SetVarOC => {
                self.object_fields = true
            }
            GetVarKB | GetVarKI | GetVarKF | GetVarKC | SetVarKB | SetVarKI | SetVarKF | SetVarKC => {
                self.class_statics = true
            }
            GetVarGB | GetVarGI | GetVarGF | GetVarGC | SetVarGB | SetVarGI | SetVarGF | SetVarGC => {
                self.globals = true
            }
            GetVarHB | GetVarHI | GetVarHF | GetVarHC | SetVarHB | SetVarHI | SetVarHF | SetVarHC => {
                self.outer_frames = true
            }
            _ => {}
        }
    }
}

/// Phase-one result for one segment
#[derive(Debug, Clone)]
pub struct BlockPlan {
    range: IndexRange,
    leaders: Vec<usize>,
    block_of: FxHashMap<usize, BlockId>,
    registers: BTreeMap<u16, RegPlan>,
    fused: FxHashSet<usize>,
    exits: Vec<usize>,
    needs: CallDataNeeds,
}

impl BlockPlan {
    pub fn build(
        routine: &Routine,
        facts: &dyn DefUseFacts,
        range: IndexRange,
        config: &JitConfig,
    ) -> Result<Self, CodegenError> {
        let code = routine.instructions();
        let malformed = |reason| CodegenError::Malformed { range, reason };
        if range.is_empty() || range.end >= code.len() {
            return Err(malformed("range outside the routine"));
        }

        let mut needs = CallDataNeeds::default();
        for i in range.indices() {
            let op = code[i].opcode;
            if !is_translatable(op) {
                return Err(CodegenError::Unsupported(op));
            }
            needs.note(op);
        }

        let leaders = find_leaders(code, range)?;
        let block_of = leaders
            .iter()
            .enumerate()
            .map(|(id, &leader)| (leader, BlockId(id as u32)))
            .collect::<FxHashMap<_, _>>();

        let mut exits: Vec<usize> = range.indices().filter(|&i| code[i].opcode == Opcode::Return).collect();
        if range.end + 1 < code.len() {
            exits.push(range.end + 1);
        }

        let registers = plan_registers(routine, facts, range, config);

        let mut fused = FxHashSet::default();
        if config.fuse_compares {
            for i in range.indices() {
                if fuses_with_test(code, facts, range, &block_of, i) {
                    fused.insert(i);
                }
            }
        }

        Ok(BlockPlan {
            range,
            leaders,
            block_of,
            registers,
            fused,
            exits,
            needs,
        })
    }

    pub fn range(&self) -> IndexRange {
        self.range
    }

    /// Number of blocks; block 0 starts at the segment start
    pub fn block_count(&self) -> usize {
        self.leaders.len()
    }

    /// Leader indices in ascending order
    pub fn leaders(&self) -> &[usize] {
        &self.leaders
    }

    /// Block starting at `index`, if `index` is a leader
    pub fn block_at(&self, index: usize) -> Option<BlockId> {
        self.block_of.get(&index).copied()
    }

    /// Resolve a branch destination
    pub fn target(&self, index: usize) -> Result<Target, CodegenError> {
        if index == self.range.end + 1 {
            return Ok(Target::Exit);
        }
        self.block_at(index).map(Target::Block).ok_or(CodegenError::Malformed {
            range: self.range,
            reason: "branch target is not a block leader",
        })
    }

    pub fn register(&self, reg: u16) -> Option<RegPlan> {
        self.registers.get(&reg).copied()
    }

    /// Every scalar register the segment touches, in register order
    pub fn registers(&self) -> impl Iterator<Item = (u16, RegPlan)> + '_ {
        self.registers.iter().map(|(&reg, &plan)| (reg, plan))
    }

    /// Whether the compare at `index` feeds the next test without being stored
    pub fn is_fused(&self, index: usize) -> bool {
        self.fused.contains(&index)
    }

    /// Indices where control leaves the segment normally: every `Return`
    /// and the instruction after the end
    pub fn exit_points(&self) -> &[usize] {
        &self.exits
    }

    pub fn needs(&self) -> CallDataNeeds {
        self.needs
    }
}

fn find_leaders(code: &[Instruction], range: IndexRange) -> Result<Vec<usize>, CodegenError> {
    let mut leaders = vec![range.start];
    let branch_to = |target: usize, leaders: &mut Vec<usize>| {
        if !range.admits_target(target) {
            return Err(CodegenError::Malformed {
                range,
                reason: "branch leaves the segment",
            });
        }
        if target <= range.end {
            if code[target].opcode == Opcode::Case {
                return Err(CodegenError::Malformed {
                    range,
                    reason: "branch into a case table",
                });
            }
            leaders.push(target);
        }
        Ok(())
    };

    for i in range.indices() {
        let ins = &code[i];
        match ins.opcode {
            Opcode::Goto | Opcode::TestB | Opcode::TestI | Opcode::TestF => {
                branch_to(ins.target(), &mut leaders)?;
                leaders.push(i + 1);
            }
            Opcode::Switch => {
                let group_end = i + ins.c.max(0) as usize;
                if group_end > range.end {
                    return Err(CodegenError::Malformed {
                        range,
                        reason: "switch table crosses the segment end",
                    });
                }
                branch_to(ins.target(), &mut leaders)?;
                for case in &code[i + 1..=group_end] {
                    branch_to(case.target(), &mut leaders)?;
                }
                leaders.push(group_end + 1);
            }
            Opcode::Return => leaders.push(i + 1),
            _ => {}
        }
    }

    leaders.retain(|&l| l <= range.end);
    leaders.sort_unstable();
    leaders.dedup();
    Ok(leaders)
}

fn plan_registers(
    routine: &Routine,
    facts: &dyn DefUseFacts,
    range: IndexRange,
    config: &JitConfig,
) -> BTreeMap<u16, RegPlan> {
    let code = routine.instructions();
    let mut defined = FxHashSet::default();
    let mut touched = FxHashSet::default();
    for i in range.indices() {
        let (defs, uses) = operand_roles(&code[i]);
        defined.extend(defs.iter().copied());
        touched.extend(defs.into_iter().chain(uses));
    }

    touched
        .into_iter()
        .filter_map(|reg| {
            let kind = routine.types().get(reg as usize)?.scalar_kind()?;
            let live_out = facts.is_live_out(reg, range);
            let direct = config
                .direct_values
                .then(|| direct_value_def(facts, code, reg, range))
                .flatten();
            let storage = match direct {
                Some(def) => Storage::Direct {
                    def,
                    write_through: live_out,
                },
                None => {
                    let defined = defined.contains(&reg);
                    Storage::Stack {
                        defined,
                        flush: defined && live_out,
                    }
                }
            };
            Some((reg, RegPlan { kind, storage }))
        })
        .collect()
}

/// A compare at `i` whose result only feeds the `TestB` right after it
fn fuses_with_test(
    code: &[Instruction],
    facts: &dyn DefUseFacts,
    range: IndexRange,
    block_of: &FxHashMap<usize, BlockId>,
    i: usize,
) -> bool {
    let cmp = &code[i];
    if !cmp.opcode.is_comparison() || i + 1 > range.end || block_of.contains_key(&(i + 1)) {
        return false;
    }
    let test = &code[i + 1];
    if test.opcode != Opcode::TestB || test.a != cmp.c {
        return false;
    }
    let reg = cmp.rc();
    let live_at = |index: usize| index < code.len() && facts.is_live_in(reg, index);
    !live_at(i + 2) && !live_at(test.target())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{DataflowAnalysis, Value, ValueType};

    fn ins(op: Opcode, a: i32, b: i32, c: i32) -> Instruction {
        Instruction::new(op, a, b, c)
    }

    fn routine(code: Vec<Instruction>, types: Vec<ValueType>) -> Routine {
        Routine::new("plan", code, types, vec![Value::int(1)]).unwrap()
    }

    fn plan(routine: &Routine, range: IndexRange, config: &JitConfig) -> Result<BlockPlan, CodegenError> {
        let facts = DataflowAnalysis::new(routine);
        BlockPlan::build(routine, &facts, range, config)
    }

    #[test]
    fn test_leaders_of_a_loop() {
        // 0: r0 = 0; 1: r0 += r1; 2: if r0 == 0 goto 4; 3: goto 1; 4: return
        let r = routine(
            vec![
                ins(Opcode::Data, 2, 0, 0),
                ins(Opcode::AddIII, 0, 1, 0),
                ins(Opcode::TestI, 0, 4, 0),
                ins(Opcode::Goto, 0, 1, 0),
                ins(Opcode::Return, 0, 1, 0),
            ],
            vec![ValueType::Int; 2],
        );
        let p = plan(&r, IndexRange::new(0, 4), &JitConfig::default()).unwrap();
        assert_eq!(p.leaders(), &[0, 1, 3, 4]);
        assert_eq!(p.target(5).unwrap(), Target::Exit);
        assert!(p.target(2).is_err());
        assert_eq!(p.exit_points(), &[4]);
    }

    #[test]
    fn test_switch_group_leaders() {
        let r = routine(
            vec![
                ins(Opcode::Switch, 0, 4, 2),
                ins(Opcode::Case, 0, 3, 0),
                ins(Opcode::Case, 0, 4, 0),
                ins(Opcode::Nop, 0, 0, 0),
                ins(Opcode::Nop, 0, 0, 0),
            ],
            vec![ValueType::Int],
        );
        let p = plan(&r, IndexRange::new(0, 4), &JitConfig::default()).unwrap();
        assert_eq!(p.leaders(), &[0, 3, 4]);
    }

    #[test]
    fn test_unsupported_opcode() {
        let r = routine(
            vec![ins(Opcode::Data, 2, 1, 0), ins(Opcode::Print, 0, 0, 0)],
            vec![ValueType::Int],
        );
        let err = plan(&r, IndexRange::new(0, 1), &JitConfig::default()).unwrap_err();
        assert!(matches!(err, CodegenError::Unsupported(Opcode::Print)));
    }

    #[test]
    fn test_branch_outside_is_malformed() {
        let r = routine(
            vec![ins(Opcode::Goto, 0, 3, 0), ins(Opcode::Nop, 0, 0, 0), ins(Opcode::Nop, 0, 0, 0), ins(Opcode::Nop, 0, 0, 0)],
            vec![ValueType::Int],
        );
        let err = plan(&r, IndexRange::new(0, 1), &JitConfig::default()).unwrap_err();
        assert!(matches!(err, CodegenError::Malformed { .. }));
    }

    #[test]
    fn test_storage_classes() {
        // r0 defined once and returned; r1 defined twice; r2 only read
        let r = routine(
            vec![
                ins(Opcode::AddIII, 2, 2, 0),
                ins(Opcode::Data, 2, 1, 1),
                ins(Opcode::AddIII, 1, 0, 1),
                ins(Opcode::Return, 0, 1, 0),
            ],
            vec![ValueType::Int; 3],
        );
        let p = plan(&r, IndexRange::new(0, 3), &JitConfig::default()).unwrap();
        assert_eq!(
            p.register(0).unwrap().storage,
            Storage::Direct {
                def: 0,
                write_through: true
            }
        );
        // r1 is dead after the segment
        assert_eq!(
            p.register(1).unwrap().storage,
            Storage::Stack {
                defined: true,
                flush: false
            }
        );
        assert_eq!(
            p.register(2).unwrap().storage,
            Storage::Stack {
                defined: false,
                flush: false
            }
        );

        let config = JitConfig {
            direct_values: false,
            ..JitConfig::default()
        };
        let p = plan(&r, IndexRange::new(0, 3), &config).unwrap();
        assert_eq!(
            p.register(0).unwrap().storage,
            Storage::Stack {
                defined: true,
                flush: true
            }
        );
    }

    #[test]
    fn test_boxed_registers_have_no_plan() {
        let r = routine(
            vec![ins(Opcode::GetConstS, 0, 0, 0), ins(Opcode::SizeIS, 0, 0, 1)],
            vec![ValueType::String, ValueType::Int],
        );
        let p = plan(&r, IndexRange::new(0, 1), &JitConfig::default()).unwrap();
        assert!(p.register(0).is_none());
        assert_eq!(p.register(1).unwrap().kind, ScalarKind::Int);
        assert!(p.needs().constants);
        assert!(!p.needs().globals);
    }

    #[test]
    fn test_compare_fusion() {
        // 0: r2 = r0 < r1; 1: if !r2 goto 3; 2: nop; 3: return r0
        let code = vec![
            ins(Opcode::LtBII, 0, 1, 2),
            ins(Opcode::TestB, 2, 3, 0),
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Return, 0, 1, 0),
        ];
        let types = vec![ValueType::Int, ValueType::Int, ValueType::Bool];
        let r = routine(code.clone(), types.clone());
        let p = plan(&r, IndexRange::new(0, 3), &JitConfig::default()).unwrap();
        assert!(p.is_fused(0));

        let config = JitConfig {
            fuse_compares: false,
            ..JitConfig::default()
        };
        assert!(!plan(&r, IndexRange::new(0, 3), &config).unwrap().is_fused(0));

        // Reading the flag after the test keeps the compare materialized
        let mut code = code;
        code[3] = ins(Opcode::Return, 2, 1, 0);
        let r = routine(code, types);
        let p = plan(&r, IndexRange::new(0, 3), &JitConfig::default()).unwrap();
        assert!(!p.is_fused(0));
    }
}
