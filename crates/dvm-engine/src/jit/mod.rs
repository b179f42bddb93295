//! Selective JIT compilation
//!
//! - Classification of instructions the code generator can translate
//! - Segment finding: maximal single-entry runs of compilable instructions
//! - Code generation through Cranelift, against the runtime ABI in [`abi`]
//!   and the helpers in [`runtime`]
//! - The driver: per-routine state machine, marker patching, and
//!   installation of the compiled code image

pub mod abi;
pub mod backend;
pub mod classify;
pub mod codegen;
pub mod context;
pub mod driver;
pub mod runtime;
pub mod segment;

pub use classify::Classifier;
pub use codegen::{CodeGenerator, CodegenError};
pub use context::{CompilerContext, JitConfig};
pub use driver::{CompileReport, JitDriver, JitError, MAX_JIT_ROUTINE_LEN};
pub use runtime::{RuntimeCatalogue, RuntimeHelper};
pub use segment::SegmentFinder;
