//! Stax - a stack-machine code generator and virtual machine
//!
//! This library lowers ESTree-shaped syntax trees into a flat bytecode image
//! and runs that image on a single-memory stack machine.

pub mod compiler;
pub mod config;
pub mod vm;

// Re-export commonly used types
pub use compiler::{Compilation, CompileError};
pub use config::RuntimeConfig;
pub use vm::{Executable, HostHandler, Machine, Op, Outcome, RuntimeFault, SupervisorHandler};
