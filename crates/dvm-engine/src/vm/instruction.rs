//! Decoded instruction with three operands

use std::fmt;

use crate::vm::opcode::Opcode;

/// One VM instruction: opcode plus operands A, B, C
///
/// Operand meaning depends on the opcode's [`crate::vm::opcode::Layout`].
/// `line` is the source line, kept for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub opcode: Opcode,
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub line: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode, a: i32, b: i32, c: i32) -> Self {
        Instruction { opcode, a, b, c, line: 0 }
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// Operand A as a register index
    pub fn ra(&self) -> u16 {
        self.a as u16
    }

    /// Operand B as a register index
    pub fn rb(&self) -> u16 {
        self.b as u16
    }

    /// Operand C as a register index
    pub fn rc(&self) -> u16 {
        self.c as u16
    }

    /// Jump target of a single-target branch
    pub fn target(&self) -> usize {
        self.b as usize
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<14} {:>5} {:>5} {:>5}", self.opcode.name(), self.a, self.b, self.c)
    }
}

/// Render a listing with instruction indices
pub fn disassemble(code: &[Instruction]) -> String {
    let mut out = String::new();
    for (i, instr) in code.iter().enumerate() {
        out.push_str(&format!("{:>5}: {}\n", i, instr));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let instr = Instruction::new(Opcode::AddIII, 0, 1, 2);
        let text = instr.to_string();
        assert!(text.starts_with("AddIII "));
        assert!(text.ends_with("0     1     2"));
    }

    #[test]
    fn test_disassemble() {
        let code = [Instruction::new(Opcode::Goto, 0, 1, 0), Instruction::new(Opcode::Nop, 0, 0, 0)];
        let listing = disassemble(&code);
        assert!(listing.starts_with("    0: Goto"));
        assert_eq!(listing.lines().count(), 2);
    }
}
