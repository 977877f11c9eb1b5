//! The virtual machine and its runtime objects: closures, classes, native
//! functions, builtin method tables and runtime errors.

pub mod builtins;
pub mod class;
pub mod closure;
pub mod native;
pub mod runtime_error;
pub mod vm;

pub use builtins::ClassRegistry;
pub use class::Class;
pub use closure::{Closure, Upvalue};
pub use native::NativeFn;
pub use runtime_error::{RuntimeError, TraceFrame};
pub use vm::{Vm, VmConfig};
