//! StackVM — stack-based virtual machine for token-stream bytecode.
//!
//! Programs are sets of labeled functions, each a sequence of textual
//! tokens. Execution starts at `_entry`. Every call gets its own operand
//! stack and locals arena; arrays are views into an arena and are copied
//! when they outlive the frame that built them.

pub mod arena;
pub mod builtins;
pub mod bytecode;
pub mod config;
pub mod governor;
pub mod program;
pub mod values;
pub mod vm;

pub use builtins::{BuiltinDispatcher, NoBuiltins, OutputBuffer, Stdlib};
pub use config::ResourceLimits;
pub use program::{Function, JumpBlock, Program};
pub use values::{ArrayRef, Slot, StoreId, Value};
pub use vm::{ExitCode, Machine, VmError};
