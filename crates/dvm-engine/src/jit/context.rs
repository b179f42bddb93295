//! Shared compiler state
//!
//! Everything the JIT consults while compiling any routine: the opcode
//! classifier, the runtime helper catalogue, the host ISA, and the knobs in
//! [`JitConfig`]. Built once and passed by reference.

use std::sync::Arc;

use cranelift_codegen::isa::TargetIsa;

use crate::jit::backend::{host_isa, SegmentModule};
use crate::jit::classify::Classifier;
use crate::jit::codegen::CodegenError;
use crate::jit::runtime::RuntimeCatalogue;
use crate::jit::segment::SegmentFinder;

/// JIT configuration
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Shortest segment worth compiling, in instructions
    /// (default: 1 in debug builds, 10 otherwise)
    pub min_segment_len: usize,
    /// Cranelift `opt_level`: "none", "speed" or "speed_and_size"
    /// (default: "speed")
    pub opt_level: &'static str,
    /// Keep registers with a single dominating definition in SSA values
    /// (default: true)
    pub direct_values: bool,
    /// Branch on a comparison directly when only the next test reads its
    /// result (default: true)
    pub fuse_compares: bool,
    /// Compile a routine the first time the interpreter runs it, through the
    /// driver's compile hook (default: true)
    pub compile_on_first_call: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            min_segment_len: if cfg!(debug_assertions) { 1 } else { 10 },
            opt_level: "speed",
            direct_values: true,
            fuse_compares: true,
            compile_on_first_call: true,
        }
    }
}

/// Process-wide compiler tables
pub struct CompilerContext {
    config: JitConfig,
    classifier: Classifier,
    catalogue: RuntimeCatalogue,
    isa: Arc<dyn TargetIsa>,
}

impl CompilerContext {
    /// Context for the host machine with the default classifier
    pub fn new(config: JitConfig) -> Result<Self, CodegenError> {
        Self::with_classifier(config, Classifier::new())
    }

    /// Context with a custom classifier table
    pub fn with_classifier(config: JitConfig, classifier: Classifier) -> Result<Self, CodegenError> {
        let isa = host_isa(config.opt_level)?;
        Ok(CompilerContext {
            config,
            classifier,
            catalogue: RuntimeCatalogue::new(),
            isa,
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn catalogue(&self) -> &RuntimeCatalogue {
        &self.catalogue
    }

    pub fn isa(&self) -> &Arc<dyn TargetIsa> {
        &self.isa
    }

    /// Segment finder over this context's classifier
    pub fn segment_finder(&self) -> SegmentFinder<'_> {
        SegmentFinder::new(&self.classifier, self.config.min_segment_len)
    }

    /// Fresh module for the segments of one routine
    pub fn segment_module(&self) -> Result<SegmentModule, CodegenError> {
        SegmentModule::new(self.isa.clone(), &self.catalogue)
    }
}

impl std::fmt::Debug for CompilerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerContext")
            .field("config", &self.config)
            .field("target", &self.isa.triple().to_string())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Opcode;

    #[test]
    fn test_default_config() {
        let config = JitConfig::default();
        assert_eq!(config.opt_level, "speed");
        assert!(config.direct_values);
        assert!(config.fuse_compares);
        assert!(config.min_segment_len >= 1);
    }

    #[test]
    fn test_host_context() {
        let ctx = CompilerContext::new(JitConfig::default()).unwrap();
        assert_eq!(ctx.isa().pointer_bytes(), 8);
        assert!(ctx.classifier().is_structurally_eligible(Opcode::AddIII));
        assert!(!ctx.classifier().is_structurally_eligible(Opcode::Print));
    }

    #[test]
    fn test_bad_opt_level() {
        let config = JitConfig {
            opt_level: "fastest",
            ..JitConfig::default()
        };
        assert!(matches!(CompilerContext::new(config), Err(CodegenError::Backend(_))));
    }
}
