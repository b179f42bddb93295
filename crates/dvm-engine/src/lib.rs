//! DVM Engine
//!
//! A register virtual machine with a selective just-in-time compiler:
//! - **VM**: instruction set, tagged values, routines, dataflow facts, and the
//!   reference interpreter (`vm` module)
//! - **JIT**: finds maximal runs of compilable instructions in a routine,
//!   translates each run to native code through Cranelift, and installs call
//!   markers so the interpreter dispatches into it (`jit` module, behind the
//!   `jit` feature)
//!
//! # Example
//!
//! ```rust,ignore
//! use dvm_engine::jit::{CompilerContext, JitConfig, JitDriver};
//! use dvm_engine::vm::{Interpreter, Namespace, Routine};
//!
//! let ctx = CompilerContext::new(JitConfig::default())?;
//! let driver = JitDriver::new(&ctx);
//! let report = driver.compile(&routine)?;
//!
//! let mut interp = Interpreter::new(Namespace::default());
//! let result = interp.run(&routine)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::missing_safety_doc)]

// ============================================================================
// Core Modules
// ============================================================================

/// VM module: instructions, values, routines, dataflow, and the interpreter
pub mod vm;

/// JIT module: classifier, segment finder, code generator, and driver
#[cfg(feature = "jit")]
pub mod jit;

// ============================================================================
// Re-exports
// ============================================================================

pub use vm::{
    ErrorCode, Frame, Instruction, Interpreter, Namespace, Opcode, Routine, RoutineError, Value, ValueType,
    VmError,
};

#[cfg(feature = "jit")]
pub use jit::{CompileReport, CompilerContext, JitConfig, JitDriver, JitError};
