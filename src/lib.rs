//! Cinder, an embeddable scripting engine.
//!
//! A host application hands the engine an expression tree (built by its own
//! parser or constructed directly with the [`Expr`] helpers); the engine
//! compiles it to compact bytecode and runs it on a stack VM with closures,
//! per-type method dispatch with operator-overload fallback, and execution
//! cost metering for untrusted scripts.
//!
//! ```
//! use cinder::{BinaryOp, Engine, Expr, Value};
//!
//! let mut engine = Engine::new();
//! // x = 0; while x < 5 { x = x + 1 }
//! let tree = Expr::block(vec![
//!     Expr::assign("x", Expr::num(0.0)),
//!     Expr::while_(
//!         Expr::binary(BinaryOp::Lt, Expr::name("x"), Expr::num(5.0)),
//!         Expr::assign("x", Expr::binary(BinaryOp::Add, Expr::name("x"), Expr::num(1.0))),
//!     ),
//! ]);
//! assert_eq!(engine.exec("count", &tree).unwrap(), Value::Num(5.0));
//! ```

pub mod bytecode;
pub mod engine;
pub mod lang;
pub mod runtime;

pub use bytecode::chunk::{Chunk, Constant, Function};
pub use bytecode::compile::Compiler;
pub use bytecode::compile_error::CompileError;
pub use bytecode::disasm::disassemble;
pub use engine::{Engine, ScriptError};
pub use lang::ast::{BinaryOp, Expr, ExprKind, Literal, UnaryOp};
pub use lang::value::{ScriptObject, TableKey, Value};
pub use runtime::class::Class;
pub use runtime::native::NativeFn;
pub use runtime::runtime_error::{RuntimeError, TraceFrame};
pub use runtime::vm::{Vm, VmConfig};
