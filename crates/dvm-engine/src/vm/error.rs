//! VM error types

use crate::vm::opcode::Opcode;

/// Runtime error category
///
/// Compiled segments report failures as `(code << 16) | instruction_index`;
/// the interpreter raises the same categories directly.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Index out of range after negative-index normalization
    Index = 1,
    /// Null container or a checked move with a mismatched type
    Value = 2,
    /// Integer division or remainder by zero
    Arithmetic = 3,
    /// Incompatible array shapes or element kinds
    Shape = 4,
}

/// Largest instruction index a packed status can carry
pub const MAX_PACKED_INDEX: usize = 0xFFFF;

impl ErrorCode {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(ErrorCode::Index),
            2 => Some(ErrorCode::Value),
            3 => Some(ErrorCode::Arithmetic),
            4 => Some(ErrorCode::Shape),
            _ => None,
        }
    }

    /// Status integer returned by runtime support functions
    pub fn status(self) -> i32 {
        self as i32
    }

    /// Pack with an instruction index into a segment return code
    pub fn pack(self, index: usize) -> i32 {
        debug_assert!(index <= MAX_PACKED_INDEX);
        ((self as i32) << 16) | (index as i32 & 0xFFFF)
    }

    /// Decode a nonzero segment return code
    pub fn unpack(packed: i32) -> Option<(ErrorCode, usize)> {
        if packed == 0 {
            return None;
        }
        let code = ErrorCode::from_u16((packed >> 16) as u16)?;
        Some((code, (packed & 0xFFFF) as usize))
    }

    /// Decode a runtime support status (zero is success)
    pub fn from_status(status: i32) -> Option<Self> {
        ErrorCode::from_u16(status as u16)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorCode::Index => "Index error: index out of range",
            ErrorCode::Value => "Value error: invalid value",
            ErrorCode::Arithmetic => "Arithmetic error: division by zero",
            ErrorCode::Shape => "Shape error: incompatible operands",
        })
    }
}

/// Error raised while executing a routine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("{code} (instruction {index})")]
    Runtime { code: ErrorCode, index: usize },
    #[error("Compiled segment {0} is not installed")]
    MissingSegment(usize),
    #[error("Opcode {0} is not executable")]
    NotExecutable(Opcode),
}

impl VmError {
    /// Runtime error of category `code` at `index`
    pub fn at(code: ErrorCode, index: usize) -> Self {
        VmError::Runtime { code, index }
    }
}

/// Error rejecting a malformed routine at construction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutineError {
    #[error("Register r{reg} out of range at instruction {index}")]
    RegisterOutOfRange { index: usize, reg: i64 },
    #[error("Jump target {target} out of range at instruction {index}")]
    TargetOutOfRange { index: usize, target: i64 },
    #[error("Constant {constant} out of range at instruction {index}")]
    ConstantOutOfRange { index: usize, constant: i64 },
    #[error("Malformed switch at instruction {0}")]
    MalformedSwitch(usize),
    #[error("Case outside a switch at instruction {0}")]
    StrayCase(usize),
    #[error("Opcode {opcode} cannot appear in source routines (instruction {index})")]
    Reserved { index: usize, opcode: Opcode },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let packed = ErrorCode::Index.pack(42);
        assert_eq!(packed, (1 << 16) | 42);
        assert_eq!(ErrorCode::unpack(packed), Some((ErrorCode::Index, 42)));
        assert_eq!(ErrorCode::unpack(0), None);
    }

    #[test]
    fn test_pack_max_index() {
        let packed = ErrorCode::Shape.pack(MAX_PACKED_INDEX);
        assert_eq!(ErrorCode::unpack(packed), Some((ErrorCode::Shape, MAX_PACKED_INDEX)));
    }

    #[test]
    fn test_error_messages() {
        let err = VmError::at(ErrorCode::Arithmetic, 3);
        assert_eq!(err.to_string(), "Arithmetic error: division by zero (instruction 3)");
    }
}
