pub mod ast;
pub mod value;

pub use ast::{BinaryOp, Expr, ExprKind, Literal, UnaryOp};
pub use value::{ScriptObject, TableKey, Value};
