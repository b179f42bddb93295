//! Per-routine compilation and code installation
//!
//! A routine moves `Unanalyzed → Segmented → Installed`, or ends in
//! `Interpreted` when nothing compiles. The state lock is held only to claim
//! the routine and to publish the result; code generation runs without it,
//! so other threads keep interpreting the original image meanwhile.

use thiserror::Error;
use tracing::debug;

use crate::jit::codegen::{CodeGenerator, CodegenError};
use crate::jit::context::CompilerContext;
use crate::vm::{
    CodeImage, CompileHook, CompiledSegment, DataflowAnalysis, IndexRange, Instruction, JitState, Opcode, Routine,
    MAX_PACKED_INDEX,
};

/// Longest routine the JIT compiles; every index must fit a packed error
pub const MAX_JIT_ROUTINE_LEN: usize = MAX_PACKED_INDEX + 1;

/// Errors that stop compilation of a whole routine
#[derive(Debug, Error)]
pub enum JitError {
    #[error("Routine '{0}' was already analyzed")]
    AlreadyAnalyzed(String),
    #[error("Routine '{name}' has {len} instructions, more than the JIT handles")]
    TooLong { name: String, len: usize },
    #[error("Codegen error: {0}")]
    Codegen(#[from] CodegenError),
}

/// Outcome of compiling one routine
#[derive(Debug, Default)]
pub struct CompileReport {
    /// Segments the finder returned
    pub segments: Vec<IndexRange>,
    /// Segments running as native code in the published image
    pub installed: Vec<IndexRange>,
    /// Segments the code generator gave up on, with the reason
    pub abandoned: Vec<(IndexRange, CodegenError)>,
}

impl CompileReport {
    pub fn is_installed(&self) -> bool {
        !self.installed.is_empty()
    }
}

/// Compiles routines against a shared [`CompilerContext`]
#[derive(Debug, Clone, Copy)]
pub struct JitDriver<'c> {
    ctx: &'c CompilerContext,
}

impl<'c> JitDriver<'c> {
    pub fn new(ctx: &'c CompilerContext) -> Self {
        JitDriver { ctx }
    }

    pub fn context(&self) -> &'c CompilerContext {
        self.ctx
    }

    /// Find, compile and install the segments of `routine`.
    ///
    /// A routine is compiled at most once; a second call fails with
    /// [`JitError::AlreadyAnalyzed`]. Segments that fail to compile are
    /// reported and left to the interpreter.
    pub fn compile(&self, routine: &Routine) -> Result<CompileReport, JitError> {
        let segments = {
            let mut state = routine.lock_state();
            if *state != JitState::Unanalyzed {
                return Err(JitError::AlreadyAnalyzed(routine.name().to_string()));
            }
            if routine.len() > MAX_JIT_ROUTINE_LEN {
                *state = JitState::Interpreted;
                return Err(JitError::TooLong {
                    name: routine.name().to_string(),
                    len: routine.len(),
                });
            }
            let segments = self.ctx.segment_finder().find(routine);
            *state = if segments.is_empty() {
                JitState::Interpreted
            } else {
                JitState::Segmented
            };
            segments
        };
        debug!(routine = routine.name(), segments = segments.len(), "segmented");

        let mut report = CompileReport {
            segments,
            ..CompileReport::default()
        };
        if report.segments.is_empty() {
            return Ok(report);
        }

        let result = self.generate(routine, &mut report);
        let mut state = routine.lock_state();
        match result {
            Ok(Some(image)) if *state == JitState::Segmented => {
                routine.publish(image);
                *state = JitState::Installed;
                debug!(routine = routine.name(), installed = report.installed.len(), "installed");
            }
            // Nothing compiled, or native code was discarded meanwhile
            Ok(_) => {
                report.installed.clear();
                *state = JitState::Interpreted;
            }
            Err(e) => {
                report.installed.clear();
                *state = JitState::Interpreted;
                return Err(e.into());
            }
        }
        Ok(report)
    }

    /// Compile every segment in `report` into one arena and build the patched
    /// image, or `None` when no segment compiled
    fn generate(&self, routine: &Routine, report: &mut CompileReport) -> Result<Option<CodeImage>, CodegenError> {
        let facts = DataflowAnalysis::new(routine);
        let mut module = self.ctx.segment_module()?;
        let mut compiled = Vec::new();
        {
            let mut generator = CodeGenerator::new(&mut module, &facts, self.ctx.config());
            for &range in &report.segments {
                match generator.generate(routine, range) {
                    Ok(id) => compiled.push((range, id)),
                    Err(e) => {
                        debug!(routine = routine.name(), segment = %range, error = %e, "segment abandoned");
                        report.abandoned.push((range, e));
                    }
                }
            }
        }
        if compiled.is_empty() {
            return Ok(None);
        }

        let ids: Vec<_> = compiled.iter().map(|&(_, id)| id).collect();
        let (arena, entries) = module.finalize(&ids)?;

        let mut instructions = routine.instructions().to_vec();
        let mut table = Vec::with_capacity(compiled.len());
        for (index, (&(range, _), native_fn)) in compiled.iter().zip(entries).enumerate() {
            let original = instructions[range.start];
            instructions[range.start] =
                Instruction::new(Opcode::JitCall, index as i32, range.len() as i32, 0).with_line(original.line);
            table.push(CompiledSegment {
                start: range.start,
                length: range.len(),
                native_fn,
                original,
            });
            report.installed.push(range);
        }
        Ok(Some(CodeImage::compiled(instructions.into(), table, Box::new(arena))))
    }
}

impl CompileHook for JitDriver<'_> {
    fn first_call(&self, routine: &Routine) {
        if !self.ctx.config().compile_on_first_call {
            return;
        }
        if let Err(e) = self.compile(routine) {
            debug!(routine = routine.name(), error = %e, "not compiled");
        }
    }
}
