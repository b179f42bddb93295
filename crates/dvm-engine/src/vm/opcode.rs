//! Register machine opcodes
//!
//! Instructions carry three `i32` operands `a`, `b`, `c`. Unless stated
//! otherwise the destination register is `c` and the sources are `a` and `b`
//! (`AddIII a b c` computes `rC = rA + rB`). Typed opcodes encode their
//! operand types in the suffix, destination first: `LtBII` produces a bool
//! from two ints, `MoveIF` moves a float into an int register.

/// How an opcode's operands map onto registers, constants, and targets.
///
/// Used by routine validation, the dataflow analysis, and the disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// No register operands
    Empty,
    /// `rC = f(immediate)` (A, B are immediates or indices)
    LoadC,
    /// `rC = f(rA)`
    UnaryAC,
    /// `rC = f(rB)` (A is an immediate selector)
    UnaryBC,
    /// `rC = f(rA, rB)`
    BinaryABC,
    /// `rC = f(rA, static B)`
    StaticGet,
    /// `rC[static B] = rA`, reads both A and C
    StaticSet,
    /// `rC[rB] = rA`, reads A, B and C
    IndexSet,
    /// `rC[rB] = rA` where the container register C is replaced (copy on write)
    IndexUpdate,
    /// `rC = rA[rA+1 .. rA+B]`
    MultiGet,
    /// `rC[rC+1 .. rC+B] = rA`
    MultiSet,
    /// Reads rA only
    ReadA,
    /// `upvalue[A][B] = ...` style stores reading rA only, C is a depth or index
    StoreA,
    /// Conditional jump on rA to B
    TestA,
    /// Multi-way dispatch on rA; B default target, C case count
    Switch,
    /// Case table entry: A constant index, B target
    Case,
    /// `Return rA` when B is nonzero, plain return otherwise
    Return,
}

macro_rules! define_opcodes {
    ($( $(#[$doc:meta])* $name:ident = $val:literal, $layout:ident; )*) => {
        /// Register machine opcode enumeration
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Opcode {
            $( $(#[$doc])* $name = $val, )*
        }

        impl Opcode {
            /// Every opcode, in numbering order
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];

            /// Decode an opcode from its numeric value
            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $( $val => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Mnemonic used in disassembly and diagnostics
            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$name => stringify!($name), )*
                }
            }

            /// Operand layout
            pub fn layout(self) -> Layout {
                match self {
                    $( Opcode::$name => Layout::$layout, )*
                }
            }
        }
    };
}

define_opcodes! {
    // ===== General (0x00-0x0F) =====
    /// No operation
    Nop = 0x00, Empty;
    /// rC = immediate B of value-tag type A (bool, int, float)
    Data = 0x01, LoadC;
    /// rC = constants[B], any type (generic, reference counted)
    GetConst = 0x02, LoadC;
    /// rC = constants[B] (bool)
    GetConstB = 0x03, LoadC;
    /// rC = constants[B] (int)
    GetConstI = 0x04, LoadC;
    /// rC = constants[B] (float)
    GetConstF = 0x05, LoadC;
    /// rC = constants[B] (complex)
    GetConstC = 0x06, LoadC;
    /// rC = constants[B] (string, shared)
    GetConstS = 0x07, LoadC;
    /// rC = rA, any type
    Move = 0x08, UnaryAC;

    // ===== Typed moves (0x10-0x1F) =====
    /// bool <- bool
    MoveBB = 0x10, UnaryAC;
    /// int <- int
    MoveII = 0x11, UnaryAC;
    /// float <- float
    MoveFF = 0x12, UnaryAC;
    /// complex <- complex
    MoveCC = 0x13, UnaryAC;
    /// int <- float (saturating truncation)
    MoveIF = 0x14, UnaryAC;
    /// float <- int
    MoveFI = 0x15, UnaryAC;
    /// int <- bool
    MoveIB = 0x16, UnaryAC;
    /// bool <- int (nonzero)
    MoveBI = 0x17, UnaryAC;
    /// complex <- int (real part)
    MoveCI = 0x18, UnaryAC;
    /// complex <- float (real part)
    MoveCF = 0x19, UnaryAC;
    /// string <- string (shared, copy on write)
    MoveSS = 0x1A, UnaryAC;

    // ===== Unary (0x20-0x2F) =====
    /// rC = !rA (bool)
    NotB = 0x20, UnaryAC;
    /// rC = (rA == 0) as int
    NotI = 0x21, UnaryAC;
    /// rC = -rA (int, wrapping)
    NegI = 0x22, UnaryAC;
    /// rC = -rA (float)
    NegF = 0x23, UnaryAC;
    /// rC = -rA (complex, per lane)
    NegC = 0x24, UnaryAC;
    /// rC = !rA (int, bitwise)
    BitNotI = 0x25, UnaryAC;

    // ===== Integer arithmetic (0x30-0x3F) =====
    /// rC = rA + rB (wrapping)
    AddIII = 0x30, BinaryABC;
    /// rC = rA - rB (wrapping)
    SubIII = 0x31, BinaryABC;
    /// rC = rA * rB (wrapping)
    MulIII = 0x32, BinaryABC;
    /// rC = rA / rB (division by zero is an arithmetic error)
    DivIII = 0x33, BinaryABC;
    /// rC = rA % rB (division by zero is an arithmetic error)
    ModIII = 0x34, BinaryABC;
    /// rC = rA ** rB (computed in floating point, truncated back)
    PowIII = 0x35, BinaryABC;
    /// rC = rA & rB
    BitAndIII = 0x36, BinaryABC;
    /// rC = rA | rB
    BitOrIII = 0x37, BinaryABC;
    /// rC = rA ^ rB
    BitXorIII = 0x38, BinaryABC;
    /// rC = rA << rB (shift amount masked to 6 bits)
    ShlIII = 0x39, BinaryABC;
    /// rC = rA >> rB (arithmetic, shift amount masked to 6 bits)
    ShrIII = 0x3A, BinaryABC;
    /// rC = rA && rB (bool)
    AndBBB = 0x3B, BinaryABC;
    /// rC = rA || rB (bool)
    OrBBB = 0x3C, BinaryABC;

    // ===== Float arithmetic (0x40-0x4F) =====
    /// rC = rA + rB
    AddFFF = 0x40, BinaryABC;
    /// rC = rA - rB
    SubFFF = 0x41, BinaryABC;
    /// rC = rA * rB
    MulFFF = 0x42, BinaryABC;
    /// rC = rA / rB (IEEE-754)
    DivFFF = 0x43, BinaryABC;
    /// rC = rA % rB (IEEE-754 remainder with the sign of rA)
    ModFFF = 0x44, BinaryABC;
    /// rC = rA ** rB
    PowFFF = 0x45, BinaryABC;
    /// rC = math[A](rB)
    MathF = 0x46, UnaryBC;

    // ===== Complex arithmetic (0x50-0x5F) =====
    /// rC = rA + rB
    AddCCC = 0x50, BinaryABC;
    /// rC = rA - rB
    SubCCC = 0x51, BinaryABC;
    /// rC = rA * rB
    MulCCC = 0x52, BinaryABC;
    /// rC = rA / rB
    DivCCC = 0x53, BinaryABC;

    // ===== Comparison (0x60-0x7F) =====
    /// rC = rA < rB (int)
    LtBII = 0x60, BinaryABC;
    /// rC = rA <= rB (int)
    LeBII = 0x61, BinaryABC;
    /// rC = rA == rB (int)
    EqBII = 0x62, BinaryABC;
    /// rC = rA != rB (int)
    NeBII = 0x63, BinaryABC;
    /// rC = rA < rB (float)
    LtBFF = 0x64, BinaryABC;
    /// rC = rA <= rB (float)
    LeBFF = 0x65, BinaryABC;
    /// rC = rA == rB (float)
    EqBFF = 0x66, BinaryABC;
    /// rC = rA != rB (float, true for NaN)
    NeBFF = 0x67, BinaryABC;
    /// rC = rA == rB (complex)
    EqBCC = 0x68, BinaryABC;
    /// rC = rA != rB (complex)
    NeBCC = 0x69, BinaryABC;
    /// rC = rA < rB (string, bytewise)
    LtBSS = 0x6A, BinaryABC;
    /// rC = rA <= rB (string)
    LeBSS = 0x6B, BinaryABC;
    /// rC = rA == rB (string)
    EqBSS = 0x6C, BinaryABC;
    /// rC = rA != rB (string)
    NeBSS = 0x6D, BinaryABC;

    // ===== Generic arithmetic (0x80-0x8F) =====
    /// rC = rA + rB (any numeric, arrays elementwise)
    Add = 0x80, BinaryABC;
    /// rC = rA - rB
    Sub = 0x81, BinaryABC;
    /// rC = rA * rB
    Mul = 0x82, BinaryABC;
    /// rC = rA / rB
    Div = 0x83, BinaryABC;
    /// rC = rA % rB
    Mod = 0x84, BinaryABC;
    /// rC = rA ** rB
    Pow = 0x85, BinaryABC;
    /// rC[rB] = rA where rB is none: assign rA to every element of array rC
    SetIndex = 0x86, IndexSet;

    // ===== Strings and sizes (0x90-0x9F) =====
    /// rC = rA + rB (string concatenation)
    AddSSS = 0x90, BinaryABC;
    /// rC = byte rB of string rA
    StringGetChar = 0x91, BinaryABC;
    /// byte rB of string rC = rA
    StringSetChar = 0x92, IndexUpdate;
    /// rC = length of string rA
    SizeIS = 0x93, UnaryAC;
    /// rC = element count of array rA
    SizeIA = 0x94, UnaryAC;
    /// rC = length of list rA
    SizeIL = 0x95, UnaryAC;

    // ===== Arrays (0xA0-0xAF) =====
    /// rC = rA[rB] (int array)
    ArrayGetI = 0xA0, BinaryABC;
    /// rC = rA[rB] (float array)
    ArrayGetF = 0xA1, BinaryABC;
    /// rC = rA[rB] (complex array)
    ArrayGetC = 0xA2, BinaryABC;
    /// rC[rB] = rA (int array)
    ArraySetI = 0xA3, IndexSet;
    /// rC[rB] = rA (float array)
    ArraySetF = 0xA4, IndexSet;
    /// rC[rB] = rA (complex array)
    ArraySetC = 0xA5, IndexSet;
    /// rC = rA[rA+1, ..., rA+B] (int array)
    ArrayGetMultiI = 0xA6, MultiGet;
    /// rC = rA[rA+1, ..., rA+B] (float array)
    ArrayGetMultiF = 0xA7, MultiGet;
    /// rC = rA[rA+1, ..., rA+B] (complex array)
    ArrayGetMultiC = 0xA8, MultiGet;
    /// rC[rC+1, ..., rC+B] = rA (int array)
    ArraySetMultiI = 0xA9, MultiSet;
    /// rC[rC+1, ..., rC+B] = rA (float array)
    ArraySetMultiF = 0xAA, MultiSet;
    /// rC[rC+1, ..., rC+B] = rA (complex array)
    ArraySetMultiC = 0xAB, MultiSet;

    // ===== Lists and tuples (0xB0-0xBF) =====
    /// rC = rA[rB] (int list)
    ListGetI = 0xB0, BinaryABC;
    /// rC = rA[rB] (float list)
    ListGetF = 0xB1, BinaryABC;
    /// rC = rA[rB] (complex list)
    ListGetC = 0xB2, BinaryABC;
    /// rC[rB] = rA (int list)
    ListSetI = 0xB3, IndexSet;
    /// rC[rB] = rA (float list)
    ListSetF = 0xB4, IndexSet;
    /// rC[rB] = rA (complex list)
    ListSetC = 0xB5, IndexSet;
    /// rC = rA.items[B], any type, checked against rC's type
    TupleGet = 0xB6, StaticGet;
    /// rC = rA.items[B] (bool)
    TupleGetB = 0xB7, StaticGet;
    /// rC = rA.items[B] (int)
    TupleGetI = 0xB8, StaticGet;
    /// rC = rA.items[B] (float)
    TupleGetF = 0xB9, StaticGet;
    /// rC = rA.items[B] (complex)
    TupleGetC = 0xBA, StaticGet;
    /// rC.items[B] = rA, any type, checked against the item type
    TupleSet = 0xBB, StaticSet;
    /// rC.items[B] = rA (bool)
    TupleSetB = 0xBC, StaticSet;
    /// rC.items[B] = rA (int)
    TupleSetI = 0xBD, StaticSet;
    /// rC.items[B] = rA (float)
    TupleSetF = 0xBE, StaticSet;
    /// rC.items[B] = rA (complex)
    TupleSetC = 0xBF, StaticSet;

    // ===== Storage classes (0xC0-0xDF) =====
    /// rC = receiver.fields[B] (bool)
    GetVarOB = 0xC0, LoadC;
    /// rC = receiver.fields[B] (int)
    GetVarOI = 0xC1, LoadC;
    /// rC = receiver.fields[B] (float)
    GetVarOF = 0xC2, LoadC;
    /// rC = receiver.fields[B] (complex)
    GetVarOC = 0xC3, LoadC;
    /// receiver.fields[C] = rA (bool)
    SetVarOB = 0xC4, StoreA;
    /// receiver.fields[C] = rA (int)
    SetVarOI = 0xC5, StoreA;
    /// receiver.fields[C] = rA (float)
    SetVarOF = 0xC6, StoreA;
    /// receiver.fields[C] = rA (complex)
    SetVarOC = 0xC7, StoreA;
    /// rC = statics[B] (bool)
    GetVarKB = 0xC8, LoadC;
    /// rC = statics[B] (int)
    GetVarKI = 0xC9, LoadC;
    /// rC = statics[B] (float)
    GetVarKF = 0xCA, LoadC;
    /// rC = statics[B] (complex)
    GetVarKC = 0xCB, LoadC;
    /// statics[C] = rA (bool)
    SetVarKB = 0xCC, StoreA;
    /// statics[C] = rA (int)
    SetVarKI = 0xCD, StoreA;
    /// statics[C] = rA (float)
    SetVarKF = 0xCE, StoreA;
    /// statics[C] = rA (complex)
    SetVarKC = 0xCF, StoreA;
    /// rC = globals[B] (bool)
    GetVarGB = 0xD0, LoadC;
    /// rC = globals[B] (int)
    GetVarGI = 0xD1, LoadC;
    /// rC = globals[B] (float)
    GetVarGF = 0xD2, LoadC;
    /// rC = globals[B] (complex)
    GetVarGC = 0xD3, LoadC;
    /// globals[C] = rA (bool)
    SetVarGB = 0xD4, StoreA;
    /// globals[C] = rA (int)
    SetVarGI = 0xD5, StoreA;
    /// globals[C] = rA (float)
    SetVarGF = 0xD6, StoreA;
    /// globals[C] = rA (complex)
    SetVarGC = 0xD7, StoreA;
    /// rC = outer[A][B] (bool, enclosing frame A, register B)
    GetVarHB = 0xD8, LoadC;
    /// rC = outer[A][B] (int)
    GetVarHI = 0xD9, LoadC;
    /// rC = outer[A][B] (float)
    GetVarHF = 0xDA, LoadC;
    /// rC = outer[A][B] (complex)
    GetVarHC = 0xDB, LoadC;
    /// outer[C][B] = rA (bool)
    SetVarHB = 0xDC, StoreA;
    /// outer[C][B] = rA (int)
    SetVarHI = 0xDD, StoreA;
    /// outer[C][B] = rA (float)
    SetVarHF = 0xDE, StoreA;
    /// outer[C][B] = rA (complex)
    SetVarHC = 0xDF, StoreA;

    // ===== Instance fields (0xE0-0xE7) =====
    /// rC = rA.fields[B] (bool)
    GetFieldB = 0xE0, StaticGet;
    /// rC = rA.fields[B] (int)
    GetFieldI = 0xE1, StaticGet;
    /// rC = rA.fields[B] (float)
    GetFieldF = 0xE2, StaticGet;
    /// rC = rA.fields[B] (complex)
    GetFieldC = 0xE3, StaticGet;
    /// rC.fields[B] = rA (bool)
    SetFieldB = 0xE4, StaticSet;
    /// rC.fields[B] = rA (int)
    SetFieldI = 0xE5, StaticSet;
    /// rC.fields[B] = rA (float)
    SetFieldF = 0xE6, StaticSet;
    /// rC.fields[B] = rA (complex)
    SetFieldC = 0xE7, StaticSet;

    // ===== Control flow (0xF0-0xFF) =====
    /// Jump to B
    Goto = 0xF0, Empty;
    /// Jump to B when bool rA is false
    TestB = 0xF1, TestA;
    /// Jump to B when int rA is zero
    TestI = 0xF2, TestA;
    /// Jump to B when float rA is zero
    TestF = 0xF3, TestA;
    /// Jump to B when rA is falsy, any type
    Test = 0xF4, TestA;
    /// Dispatch on rA over the C cases that follow; B is the default target
    Switch = 0xF5, Switch;
    /// Case entry of the preceding switch: constants[A] jumps to B
    Case = 0xF6, Case;
    /// Return rA (when B is nonzero) to the caller
    Return = 0xF7, Return;
    /// Append rA to the interpreter output
    Print = 0xF8, ReadA;
    /// Execute compiled segment A covering B original instructions
    JitCall = 0xFF, Empty;
}

impl Opcode {
    /// Numeric value of the opcode
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Unconditional or conditional jump with a single target in B
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Goto | Opcode::TestB | Opcode::TestI | Opcode::TestF | Opcode::Test
        )
    }

    /// Any opcode that transfers control to an explicit target
    pub fn is_branch(self) -> bool {
        self.is_jump() || self == Opcode::Switch
    }

    /// Conditional test that falls through when the tested value is truthy
    pub fn is_test(self) -> bool {
        matches!(
            self,
            Opcode::TestB | Opcode::TestI | Opcode::TestF | Opcode::Test
        )
    }

    /// Typed scalar comparison producing a bool
    pub fn is_comparison(self) -> bool {
        matches!(self as u16, 0x60..=0x6D)
    }

    /// Generic arithmetic opcode (the numbering shared with array arithmetic)
    pub fn is_generic_arith(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod | Opcode::Pow
        )
    }

    /// Control never reaches the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Goto | Opcode::Switch | Opcode::Return)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip_all() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_u16(op.to_u16()), Some(op), "{}", op.name());
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_u16(0x0F), None);
        assert_eq!(Opcode::from_u16(0xFFFE), None);
    }

    #[test]
    fn test_opcode_classes() {
        assert!(Opcode::Goto.is_jump());
        assert!(Opcode::Switch.is_branch());
        assert!(!Opcode::Switch.is_jump());
        assert!(Opcode::LtBII.is_comparison());
        assert!(Opcode::NeBSS.is_comparison());
        assert!(!Opcode::Add.is_comparison());
        assert!(Opcode::Pow.is_generic_arith());
        assert!(Opcode::Return.is_terminator());
        assert!(!Opcode::TestB.is_terminator());
    }

    #[test]
    fn test_names_unique() {
        let mut names: Vec<_> = Opcode::ALL.iter().map(|op| op.name()).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }
}
