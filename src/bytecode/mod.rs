//! Compilation from expression trees to compact bytecode, plus the chunk
//! and opcode definitions shared with the VM.

pub mod chunk;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod op;

pub use chunk::{Builder, Chunk, Constant, Function};
pub use compile::Compiler;
pub use compile_error::CompileError;
