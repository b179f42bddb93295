//! Segment code generation
//!
//! A segment is compiled in two phases. [`plan`] walks the instructions once
//! to find native block boundaries, decide where each scalar register lives,
//! and pick compares that fuse with the following test. [`translate`] then
//! emits Cranelift IR instruction by instruction against that plan.

mod plan;
mod translate;

pub use plan::{BlockId, BlockPlan, CallDataNeeds, RegPlan, Storage, Target};

use cranelift_codegen::ir;
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{FuncId, Module};
use thiserror::Error;

use crate::jit::backend::SegmentModule;
use crate::jit::context::JitConfig;
use crate::vm::{DefUseFacts, IndexRange, Opcode, Routine};

use self::translate::Translator;

/// Errors that abandon one segment
#[derive(Debug, Clone, Error)]
pub enum CodegenError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Unsupported instruction: {0:?}")]
    Unsupported(Opcode),
    #[error("Operand type mismatch at instruction {index}, register r{reg}")]
    OperandType { index: usize, reg: u16 },
    #[error("Malformed segment {range}: {reason}")]
    Malformed { range: IndexRange, reason: &'static str },
}

/// Whether the code generator has a translation for `op` at all
pub(crate) fn is_translatable(op: Opcode) -> bool {
    !matches!(op, Opcode::Test | Opcode::Print | Opcode::JitCall)
}

/// Translates segments of one routine into a [`SegmentModule`]
pub struct CodeGenerator<'a> {
    module: &'a mut SegmentModule,
    facts: &'a dyn DefUseFacts,
    config: &'a JitConfig,
    ctx: Context,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(module: &'a mut SegmentModule, facts: &'a dyn DefUseFacts, config: &'a JitConfig) -> Self {
        CodeGenerator {
            module,
            facts,
            config,
            ctx: Context::new(),
        }
    }

    /// Compile `range` of `routine` into the module.
    ///
    /// On error nothing of the segment remains defined and the generator can
    /// go on with the next range.
    pub fn generate(&mut self, routine: &Routine, range: IndexRange) -> Result<FuncId, CodegenError> {
        let plan = BlockPlan::build(routine, self.facts, range, self.config)?;
        let id = self.module.declare_segment(range)?;

        self.ctx.func.signature = self.module.segment_signature();
        self.ctx.func.name = ir::UserFuncName::user(0, id.as_u32());

        let helper_ids = self.module.helpers().to_vec();
        let helpers: Vec<ir::FuncRef> = helper_ids
            .into_iter()
            .map(|helper| self.module.module().declare_func_in_func(helper, &mut self.ctx.func))
            .collect();

        let mut fn_ctx = FunctionBuilderContext::new();
        let builder = FunctionBuilder::new(&mut self.ctx.func, &mut fn_ctx);
        if let Err(e) = Translator::translate(routine, &plan, &helpers, builder) {
            self.module.module().clear_context(&mut self.ctx);
            return Err(e);
        }

        self.module.define(id, &mut self.ctx)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translatable_opcodes() {
        assert!(is_translatable(Opcode::Case));
        assert!(is_translatable(Opcode::Switch));
        assert!(is_translatable(Opcode::AddIII));
        for op in [Opcode::Test, Opcode::Print, Opcode::JitCall] {
            assert!(!is_translatable(op));
        }
    }

    #[test]
    fn test_error_messages() {
        let e = CodegenError::Malformed {
            range: IndexRange::new(2, 5),
            reason: "branch leaves the segment",
        };
        assert_eq!(e.to_string(), "Malformed segment [2, 5]: branch leaves the segment");
        let e = CodegenError::OperandType { index: 3, reg: 7 };
        assert_eq!(e.to_string(), "Operand type mismatch at instruction 3, register r7");
    }
}
