//! Cranelift backend plumbing
//!
//! One [`SegmentModule`] collects every segment of one routine. Finalizing
//! it yields a [`CodeArena`] that owns the machine code and the native entry
//! points into it; the arena is dropped together with the code image that
//! references it.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use cranelift_codegen::ir::{self, types, AbiParam};
use cranelift_codegen::isa::{CallConv, TargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use parking_lot::Mutex;
use target_lexicon::Architecture;

use crate::jit::codegen::CodegenError;
use crate::jit::runtime::RuntimeCatalogue;
use crate::vm::{IndexRange, SegmentFn};

/// Serializes every use of the code generation backend across threads
static BACKEND_LOCK: Mutex<()> = parking_lot::const_mutex(());

fn backend_error(what: &str, e: impl std::fmt::Display) -> CodegenError {
    CodegenError::Backend(format!("{}: {}", what, e))
}

/// Build the host ISA with the given Cranelift `opt_level`
pub fn host_isa(opt_level: &str) -> Result<Arc<dyn TargetIsa>, CodegenError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", opt_level)
        .map_err(|e| backend_error("Failed to set opt_level", e))?;
    // Helpers are called by absolute address
    flag_builder
        .set("is_pic", "false")
        .map_err(|e| backend_error("Failed to set is_pic", e))?;
    let flags = settings::Flags::new(flag_builder);

    let isa = cranelift_native::builder()
        .map_err(|e| backend_error("Failed to create native ISA builder", e))?
        .finish(flags)
        .map_err(|e| backend_error("Failed to finish ISA", e))?;

    match isa.triple().architecture {
        Architecture::X86_64 | Architecture::Aarch64(_) => {}
        arch => return Err(CodegenError::Backend(format!("Unsupported host architecture: {}", arch))),
    }
    if isa.pointer_bytes() != 8 {
        return Err(CodegenError::Backend(format!(
            "Unsupported pointer width: {} bytes",
            isa.pointer_bytes()
        )));
    }
    Ok(isa)
}

/// Executable memory holding the finalized segments of one routine
pub struct CodeArena {
    module: ManuallyDrop<JITModule>,
}

// SAFETY: the module is only touched again by `Drop`, under BACKEND_LOCK
unsafe impl Send for CodeArena {}
unsafe impl Sync for CodeArena {}

impl CodeArena {
    fn new(module: JITModule) -> Self {
        CodeArena {
            module: ManuallyDrop::new(module),
        }
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        let _guard = BACKEND_LOCK.lock();
        // SAFETY: `module` is never used after this point, and no code image
        // referencing the arena's entry points outlives it
        let module = unsafe { ManuallyDrop::take(&mut self.module) };
        unsafe { module.free_memory() };
    }
}

impl std::fmt::Debug for CodeArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeArena").finish_non_exhaustive()
    }
}

/// Module collecting the compiled segments of one routine
pub struct SegmentModule {
    // An arena from the start, so a failed compile still frees its memory
    arena: CodeArena,
    helpers: Vec<FuncId>,
    call_conv: CallConv,
}

impl SegmentModule {
    /// New module with every runtime helper declared as an import
    pub fn new(isa: Arc<dyn TargetIsa>, catalogue: &RuntimeCatalogue) -> Result<Self, CodegenError> {
        let call_conv = isa.default_call_conv();
        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        catalogue.register(&mut builder);
        let mut arena = CodeArena::new(JITModule::new(builder));

        let helpers = catalogue
            .iter()
            .map(|f| arena.module.declare_function(f.name, Linkage::Import, &f.signature(call_conv)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| backend_error("Failed to declare runtime helper", e))?;

        Ok(SegmentModule {
            arena,
            helpers,
            call_conv,
        })
    }

    pub(crate) fn module(&mut self) -> &mut JITModule {
        &mut self.arena.module
    }

    /// Helper function ids, indexed by `RuntimeHelper`
    pub(crate) fn helpers(&self) -> &[FuncId] {
        &self.helpers
    }

    /// `fn(*mut CallData) -> i32`
    pub fn segment_signature(&self) -> ir::Signature {
        let mut sig = ir::Signature::new(self.call_conv);
        sig.params.push(AbiParam::new(types::I64));
        sig.returns.push(AbiParam::new(types::I32));
        sig
    }

    /// Declare the native function for a segment
    pub fn declare_segment(&mut self, range: IndexRange) -> Result<FuncId, CodegenError> {
        let sig = self.segment_signature();
        let name = format!("seg_{}_{}", range.start, range.end);
        self.module()
            .declare_function(&name, Linkage::Local, &sig)
            .map_err(|e| backend_error("Failed to declare segment", e))
    }

    /// Compile the function in `ctx` as `id`; the context is cleared either way
    pub fn define(&mut self, id: FuncId, ctx: &mut Context) -> Result<(), CodegenError> {
        let _guard = BACKEND_LOCK.lock();
        let module = self.module();
        let result = module.define_function(id, ctx);
        module.clear_context(ctx);
        result.map_err(|e| backend_error("Failed to define segment", e))
    }

    /// Make every defined segment executable and resolve the entry points of
    /// `ids`, in order
    pub fn finalize(mut self, ids: &[FuncId]) -> Result<(CodeArena, Vec<SegmentFn>), CodegenError> {
        let guard = BACKEND_LOCK.lock();
        let module = self.module();
        module
            .finalize_definitions()
            .map_err(|e| backend_error("Failed to finalize segments", e))?;
        let entries = ids
            .iter()
            .map(|&id| {
                let code = module.get_finalized_function(id);
                // SAFETY: every segment was defined with `segment_signature`
                unsafe { std::mem::transmute::<*const u8, SegmentFn>(code) }
            })
            .collect();
        drop(guard);
        Ok((self.arena, entries))
    }
}
