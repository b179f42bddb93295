//! Instruction classifier
//!
//! Decides, per instruction, whether the code generator can translate it.
//! The decision has two layers: a per-opcode table (the structural layer,
//! overridable for testing) and operand-type predicates over the routine's
//! register types. `Case` entries are eligible only as part of a switch
//! group; the segment finder applies that rule.

use crate::jit::codegen::is_translatable;
use crate::vm::{ElementKind, Instruction, MathFn, Opcode, ScalarKind, ValueTag, ValueType};

/// Scalar kind selected by the suffix of a family laid out B, I, F, C
pub(crate) fn family_kind(op: Opcode, first: Opcode) -> ScalarKind {
    match op.to_u16().wrapping_sub(first.to_u16()) % 4 {
        0 => ScalarKind::Bool,
        1 => ScalarKind::Int,
        2 => ScalarKind::Float,
        _ => ScalarKind::Complex,
    }
}

/// Element kind selected by the suffix of a family laid out I, F, C
pub(crate) fn numeric_kind(op: Opcode, first: Opcode) -> ElementKind {
    match op.to_u16().wrapping_sub(first.to_u16()) % 3 {
        0 => ElementKind::Int,
        1 => ElementKind::Float,
        _ => ElementKind::Complex,
    }
}

/// Static type a register operand must have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    Scalar(ScalarKind),
    String,
    Array(ElementKind),
    AnyArray,
    /// A numeric array or an unboxed scalar
    Numeric,
    List,
    Object,
    NoneType,
    /// Not an unboxed scalar
    Boxed,
    /// A tuple with an item at this index
    TupleItem(usize),
    /// A tuple whose item at this index has this scalar kind
    TupleScalar(usize, ScalarKind),
}

impl Want {
    fn admits(self, ty: &ValueType) -> bool {
        match self {
            Want::Scalar(kind) => ty.scalar_kind() == Some(kind),
            Want::String => *ty == ValueType::String,
            Want::Array(kind) => *ty == ValueType::Array(kind),
            Want::AnyArray => ty.is_numeric_array(),
            Want::Numeric => ty.is_numeric_array() || ty.scalar_kind().is_some(),
            Want::List => matches!(ty, ValueType::List(_)),
            Want::Object => matches!(ty, ValueType::Object(_)),
            Want::NoneType => *ty == ValueType::None,
            Want::Boxed => ty.scalar_kind().is_none(),
            Want::TupleItem(index) => matches!(ty, ValueType::Tuple(items) if index < items.len()),
            Want::TupleScalar(index, kind) => match ty {
                ValueType::Tuple(items) => items.get(index).is_some_and(|item| Want::Scalar(kind).admits(item)),
                _ => false,
            },
        }
    }
}

/// Per-opcode eligibility plus operand-type predicates
#[derive(Debug, Clone)]
pub struct Classifier {
    table: Vec<bool>,
}

impl Classifier {
    /// The default table: everything the code generator translates
    pub fn new() -> Self {
        let mut table = vec![false; 0x100];
        for &op in Opcode::ALL {
            table[op.to_u16() as usize] = is_translatable(op);
        }
        Classifier { table }
    }

    /// Force the structural verdict for one opcode. Operand predicates still
    /// apply to opcodes that have them.
    pub fn with_override(mut self, op: Opcode, eligible: bool) -> Self {
        let index = op.to_u16() as usize;
        if index >= self.table.len() {
            self.table.resize(index + 1, false);
        }
        self.table[index] = eligible;
        self
    }

    /// Structural verdict for an opcode, ignoring operands
    pub fn is_structurally_eligible(&self, op: Opcode) -> bool {
        self.table.get(op.to_u16() as usize).copied().unwrap_or(false)
    }

    /// Whether `ins` is compilable given the routine's register types
    pub fn is_eligible(&self, ins: &Instruction, types: &[ValueType]) -> bool {
        if !self.is_structurally_eligible(ins.opcode) {
            return false;
        }
        let Some(wants) = operand_wants(ins) else {
            return false;
        };
        if ins.opcode.is_generic_arith() && !has_array_operand(ins, types) {
            return false;
        }
        wants.iter().all(|&(reg, want)| {
            usize::try_from(reg).ok().and_then(|r| types.get(r)).is_some_and(|ty| want.admits(ty))
        })
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Register operands and the types they need, or `None` when an immediate
/// operand already rules the instruction out
fn operand_wants(ins: &Instruction) -> Option<Vec<(i64, Want)>> {
    use Opcode::*;
    use ScalarKind::{Bool as B, Complex as C, Float as F, Int as I};

    let op = ins.opcode;
    let (a, b, c) = (ins.a as i64, ins.b as i64, ins.c as i64);
    let s = Want::Scalar;
    let span = |base: i64, count: i64| (1..=count).map(move |k| (base + k, s(I)));

    Some(match op {
        Data => {
            let kind = match ValueTag::from_u32(ins.a as u32)? {
                ValueTag::Bool => B,
                ValueTag::Int => I,
                ValueTag::Float => F,
                _ => return None,
            };
            vec![(c, s(kind))]
        }
        GetConst | Move => {
            let mut wants = vec![(c, Want::Boxed)];
            if op == Move {
                wants.push((a, Want::Boxed));
            }
            wants
        }
        GetConstB => vec![(c, s(B))],
        GetConstI => vec![(c, s(I))],
        GetConstF => vec![(c, s(F))],
        GetConstC => vec![(c, s(C))],
        GetConstS => vec![(c, Want::String)],

        MoveBB | NotB => vec![(c, s(B)), (a, s(B))],
        MoveII | NotI | NegI | BitNotI => vec![(c, s(I)), (a, s(I))],
        MoveFF | NegF => vec![(c, s(F)), (a, s(F))],
        MoveCC | NegC => vec![(c, s(C)), (a, s(C))],
        MoveIF => vec![(c, s(I)), (a, s(F))],
        MoveFI => vec![(c, s(F)), (a, s(I))],
        MoveIB => vec![(c, s(I)), (a, s(B))],
        MoveBI => vec![(c, s(B)), (a, s(I))],
        MoveCI => vec![(c, s(C)), (a, s(I))],
        MoveCF => vec![(c, s(C)), (a, s(F))],
        MoveSS => vec![(c, Want::String), (a, Want::String)],

        AddIII | SubIII | MulIII | DivIII | ModIII | PowIII | BitAndIII | BitOrIII | BitXorIII | ShlIII
        | ShrIII => vec![(c, s(I)), (a, s(I)), (b, s(I))],
        AndBBB | OrBBB => vec![(c, s(B)), (a, s(B)), (b, s(B))],
        AddFFF | SubFFF | MulFFF | DivFFF | ModFFF | PowFFF => vec![(c, s(F)), (a, s(F)), (b, s(F))],
        MathF => {
            MathFn::from_i32(ins.a)?;
            vec![(c, s(F)), (b, s(F))]
        }
        AddCCC | SubCCC | MulCCC | DivCCC => vec![(c, s(C)), (a, s(C)), (b, s(C))],

        LtBII | LeBII | EqBII | NeBII => vec![(c, s(B)), (a, s(I)), (b, s(I))],
        LtBFF | LeBFF | EqBFF | NeBFF => vec![(c, s(B)), (a, s(F)), (b, s(F))],
        EqBCC | NeBCC => vec![(c, s(B)), (a, s(C)), (b, s(C))],
        LtBSS | LeBSS | EqBSS | NeBSS => vec![(c, s(B)), (a, Want::String), (b, Want::String)],

        // Generic arithmetic compiles only as array arithmetic; see `has_array_operand`
        Add | Sub | Mul | Div | Mod | Pow => vec![(c, Want::Boxed), (a, Want::Numeric), (b, Want::Numeric)],
        SetIndex => vec![(c, Want::AnyArray), (b, Want::NoneType), (a, Want::Numeric)],

        AddSSS => vec![(c, Want::String), (a, Want::String), (b, Want::String)],
        StringGetChar => vec![(c, s(I)), (a, Want::String), (b, s(I))],
        StringSetChar => vec![(c, Want::String), (a, s(I)), (b, s(I))],
        SizeIS => vec![(c, s(I)), (a, Want::String)],
        SizeIA => vec![(c, s(I)), (a, Want::AnyArray)],
        SizeIL => vec![(c, s(I)), (a, Want::List)],

        ArrayGetI | ArrayGetF | ArrayGetC => {
            let kind = numeric_kind(op, ArrayGetI);
            vec![(c, s(kind.scalar())), (a, Want::Array(kind)), (b, s(I))]
        }
        ArraySetI | ArraySetF | ArraySetC => {
            let kind = numeric_kind(op, ArraySetI);
            vec![(c, Want::Array(kind)), (b, s(I)), (a, s(kind.scalar()))]
        }
        ArrayGetMultiI | ArrayGetMultiF | ArrayGetMultiC => {
            if b < 1 {
                return None;
            }
            let kind = numeric_kind(op, ArrayGetMultiI);
            let mut wants = vec![(c, s(kind.scalar())), (a, Want::Array(kind))];
            wants.extend(span(a, b));
            wants
        }
        ArraySetMultiI | ArraySetMultiF | ArraySetMultiC => {
            if b < 1 {
                return None;
            }
            let kind = numeric_kind(op, ArraySetMultiI);
            let mut wants = vec![(c, Want::Array(kind)), (a, s(kind.scalar()))];
            wants.extend(span(c, b));
            wants
        }

        ListGetI | ListGetF | ListGetC => {
            let kind = numeric_kind(op, ListGetI);
            vec![(c, s(kind.scalar())), (a, Want::List), (b, s(I))]
        }
        ListSetI | ListSetF | ListSetC => {
            let kind = numeric_kind(op, ListSetI);
            vec![(c, Want::List), (b, s(I)), (a, s(kind.scalar()))]
        }

        TupleGet => vec![(a, Want::TupleItem(usize::try_from(b).ok()?))],
        TupleGetB | TupleGetI | TupleGetF | TupleGetC => {
            let kind = family_kind(op, TupleGetB);
            vec![(c, s(kind)), (a, Want::TupleScalar(usize::try_from(b).ok()?, kind))]
        }
        TupleSet => vec![(c, Want::TupleItem(usize::try_from(b).ok()?))],
        TupleSetB | TupleSetI | TupleSetF | TupleSetC => {
            let kind = family_kind(op, TupleSetB);
            vec![(c, Want::TupleScalar(usize::try_from(b).ok()?, kind)), (a, s(kind))]
        }

        GetVarOB | GetVarOI | GetVarOF | GetVarOC => storage_get(ins, GetVarOB)?,
        GetVarKB | GetVarKI | GetVarKF | GetVarKC => storage_get(ins, GetVarKB)?,
        GetVarGB | GetVarGI | GetVarGF | GetVarGC => storage_get(ins, GetVarGB)?,
        GetVarHB | GetVarHI | GetVarHF | GetVarHC => {
            if a < 0 {
                return None;
            }
            storage_get(ins, GetVarHB)?
        }
        SetVarOB | SetVarOI | SetVarOF | SetVarOC => storage_set(ins, SetVarOB, c)?,
        SetVarKB | SetVarKI | SetVarKF | SetVarKC => storage_set(ins, SetVarKB, c)?,
        SetVarGB | SetVarGI | SetVarGF | SetVarGC => storage_set(ins, SetVarGB, c)?,
        SetVarHB | SetVarHI | SetVarHF | SetVarHC => {
            if b < 0 {
                return None;
            }
            storage_set(ins, SetVarHB, c)?
        }

        GetFieldB | GetFieldI | GetFieldF | GetFieldC => {
            if b < 0 {
                return None;
            }
            vec![(c, s(family_kind(op, GetFieldB))), (a, Want::Object)]
        }
        SetFieldB | SetFieldI | SetFieldF | SetFieldC => {
            if b < 0 {
                return None;
            }
            vec![(c, Want::Object), (a, s(family_kind(op, SetFieldB)))]
        }

        TestB => vec![(a, s(B))],
        TestI => vec![(a, s(I))],
        TestF => vec![(a, s(F))],

        // Structural-only opcodes (and any opcode a test forced eligible)
        _ => vec![],
    })
}

/// Generic arithmetic is compiled only when an operand is statically a
/// numeric array
fn has_array_operand(ins: &Instruction, types: &[ValueType]) -> bool {
    [ins.a, ins.b]
        .iter()
        .any(|&r| usize::try_from(r).ok().and_then(|r| types.get(r)).is_some_and(ValueType::is_numeric_array))
}

fn storage_get(ins: &Instruction, first: Opcode) -> Option<Vec<(i64, Want)>> {
    if ins.b < 0 {
        return None;
    }
    Some(vec![(ins.c as i64, Want::Scalar(family_kind(ins.opcode, first)))])
}

fn storage_set(ins: &Instruction, first: Opcode, index: i64) -> Option<Vec<(i64, Want)>> {
    if index < 0 {
        return None;
    }
    Some(vec![(ins.a as i64, Want::Scalar(family_kind(ins.opcode, first)))])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(op: Opcode, a: i32, b: i32, c: i32) -> Instruction {
        Instruction::new(op, a, b, c)
    }

    #[test]
    fn test_typed_arithmetic() {
        let classifier = Classifier::new();
        let ints = vec![ValueType::Int; 3];
        assert!(classifier.is_eligible(&ins(Opcode::AddIII, 0, 1, 2), &ints));
        // Enum registers are integer scalars
        let mixed = vec![ValueType::Int, ValueType::Enum, ValueType::Int];
        assert!(classifier.is_eligible(&ins(Opcode::SubIII, 0, 1, 2), &mixed));
        let floats = vec![ValueType::Float; 3];
        assert!(!classifier.is_eligible(&ins(Opcode::AddIII, 0, 1, 2), &floats));
        assert!(classifier.is_eligible(&ins(Opcode::AddFFF, 0, 1, 2), &floats));
    }

    #[test]
    fn test_data_payload_types() {
        let classifier = Classifier::new();
        let types = vec![ValueType::Int, ValueType::Float, ValueType::String];
        assert!(classifier.is_eligible(&ins(Opcode::Data, ValueTag::Int as i32, 5, 0), &types));
        assert!(classifier.is_eligible(&ins(Opcode::Data, ValueTag::Float as i32, 5, 1), &types));
        assert!(!classifier.is_eligible(&ins(Opcode::Data, ValueTag::String as i32, 0, 2), &types));
        assert!(!classifier.is_eligible(&ins(Opcode::Data, ValueTag::Float as i32, 5, 0), &types));
    }

    #[test]
    fn test_generic_arith_needs_array() {
        let classifier = Classifier::new();
        let scalars = vec![ValueType::Int, ValueType::Int, ValueType::Any];
        assert!(!classifier.is_eligible(&ins(Opcode::Add, 0, 1, 2), &scalars));
        let with_array = vec![ValueType::Array(ElementKind::Float), ValueType::Int, ValueType::Any];
        assert!(classifier.is_eligible(&ins(Opcode::Mul, 0, 1, 2), &with_array));
        let with_string = vec![ValueType::Array(ElementKind::Float), ValueType::String, ValueType::Any];
        assert!(!classifier.is_eligible(&ins(Opcode::Mul, 0, 1, 2), &with_string));
    }

    #[test]
    fn test_set_index_requires_none_index() {
        let classifier = Classifier::new();
        let types = vec![ValueType::Float, ValueType::None, ValueType::Array(ElementKind::Float)];
        assert!(classifier.is_eligible(&ins(Opcode::SetIndex, 0, 1, 2), &types));
        let types = vec![ValueType::Float, ValueType::Int, ValueType::Array(ElementKind::Float)];
        assert!(!classifier.is_eligible(&ins(Opcode::SetIndex, 0, 1, 2), &types));
    }

    #[test]
    fn test_container_suffixes() {
        let classifier = Classifier::new();
        let types = vec![ValueType::Array(ElementKind::Complex), ValueType::Int, ValueType::Complex];
        assert!(classifier.is_eligible(&ins(Opcode::ArrayGetC, 0, 1, 2), &types));
        assert!(!classifier.is_eligible(&ins(Opcode::ArrayGetF, 0, 1, 2), &types));

        let tuple = ValueType::Tuple(vec![ValueType::Int, ValueType::Float]);
        let types = vec![tuple, ValueType::Float];
        assert!(classifier.is_eligible(&ins(Opcode::TupleGetF, 0, 1, 1), &types));
        assert!(!classifier.is_eligible(&ins(Opcode::TupleGetF, 0, 0, 1), &types));
        assert!(!classifier.is_eligible(&ins(Opcode::TupleGet, 0, 2, 1), &types));
    }

    #[test]
    fn test_math_selector() {
        let classifier = Classifier::new();
        let types = vec![ValueType::Float; 2];
        assert!(classifier.is_eligible(&ins(Opcode::MathF, MathFn::Ln as i32, 0, 1), &types));
        assert!(!classifier.is_eligible(&ins(Opcode::MathF, 99, 0, 1), &types));
    }

    #[test]
    fn test_structural_table_and_override() {
        let classifier = Classifier::new();
        let types = vec![ValueType::Any];
        assert!(!classifier.is_eligible(&ins(Opcode::Print, 0, 0, 0), &types));
        assert!(!classifier.is_eligible(&ins(Opcode::Test, 0, 1, 0), &types));
        assert!(classifier.is_eligible(&ins(Opcode::Goto, 0, 0, 0), &types));

        let forced = Classifier::new()
            .with_override(Opcode::Print, true)
            .with_override(Opcode::Goto, false);
        assert!(forced.is_eligible(&ins(Opcode::Print, 0, 0, 0), &types));
        assert!(!forced.is_eligible(&ins(Opcode::Goto, 0, 0, 0), &types));
    }

    #[test]
    fn test_suffix_families() {
        assert_eq!(family_kind(Opcode::GetVarHC, Opcode::GetVarHB), ScalarKind::Complex);
        assert_eq!(family_kind(Opcode::SetFieldI, Opcode::SetFieldB), ScalarKind::Int);
        assert_eq!(numeric_kind(Opcode::ListSetF, Opcode::ListSetI), ElementKind::Float);
        assert_eq!(numeric_kind(Opcode::ArrayGetMultiC, Opcode::ArrayGetMultiI), ElementKind::Complex);
    }
}
