use std::rc::Rc;

use crate::bytecode::chunk::Function;
use crate::bytecode::compile::Compiler;
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::disasm;
use crate::lang::ast::Expr;
use crate::lang::value::Value;
use crate::runtime::builtins;
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm::{Vm, VmConfig};

/// Any error an embedded script can produce, compile-time or run-time.
#[derive(Debug)]
pub enum ScriptError {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl From<CompileError> for ScriptError {
    fn from(e: CompileError) -> Self {
        ScriptError::Compile(e)
    }
}

impl From<RuntimeError> for ScriptError {
    fn from(e: RuntimeError) -> Self {
        ScriptError::Runtime(e)
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Compile(e) => write!(f, "{}", e),
            ScriptError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ScriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScriptError::Compile(e) => Some(e),
            ScriptError::Runtime(e) => Some(e),
        }
    }
}

/// The host-facing entry point: owns one VM with the builtin classes and
/// global constructors installed, and drives the compiler for it.
///
/// ```
/// use cinder::{Engine, Expr, Value};
///
/// let mut engine = Engine::new();
/// let result = engine.exec("script", &Expr::num(21.0)).unwrap();
/// assert_eq!(result, Value::Num(21.0));
/// ```
pub struct Engine {
    vm: Vm,
    /// When set, every compile dumps its disassembly to stderr.
    pub debug_bytecode: bool,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut vm = Vm::new(config);
        builtins::install_globals(&mut vm);
        Engine {
            vm,
            debug_bytecode: false,
        }
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.vm.set_global(name, value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.vm.get_global(name)
    }

    /// Compiles an expression tree into a runnable function.
    pub fn compile(&self, name: &str, tree: &Expr) -> Result<Rc<Function>, ScriptError> {
        let function = Compiler::compile(name, tree)?;
        if self.debug_bytecode {
            eprintln!("{}", disasm::disassemble(&function));
        }
        Ok(function)
    }

    /// Runs a previously compiled function. Compiled functions can be run
    /// any number of times, on any engine with compatible globals.
    pub fn run(&mut self, function: Rc<Function>) -> Result<Value, ScriptError> {
        Ok(self.vm.run_function(function)?)
    }

    /// Compiles and runs in one step.
    pub fn exec(&mut self, name: &str, tree: &Expr) -> Result<Value, ScriptError> {
        let function = self.compile(name, tree)?;
        self.run(function)
    }

    /// Total execution cost the VM has accumulated.
    pub fn cost(&self) -> u64 {
        self.vm.cost()
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Direct VM access, for hosts that install natives which need to call
    /// back into script code.
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ast::BinaryOp;

    #[test]
    fn test_exec_expression() {
        let mut engine = Engine::new();
        let tree = Expr::binary(BinaryOp::Mul, Expr::num(6.0), Expr::num(7.0));
        assert_eq!(engine.exec("answer", &tree).unwrap(), Value::Num(42.0));
    }

    #[test]
    fn test_compiled_function_reusable() {
        let mut engine = Engine::new();
        let tree = Expr::block(vec![
            Expr::assign("x", Expr::num(1.0)),
            Expr::binary(BinaryOp::Add, Expr::name("x"), Expr::num(1.0)),
        ]);
        let function = engine.compile("twice", &tree).unwrap();
        assert_eq!(engine.run(function.clone()).unwrap(), Value::Num(2.0));
        assert_eq!(engine.run(function).unwrap(), Value::Num(2.0));
    }

    #[test]
    fn test_globals_visible_to_scripts() {
        let mut engine = Engine::new();
        engine.set_global("answer", Value::Num(42.0));
        assert_eq!(
            engine.exec("read", &Expr::name("answer")).unwrap(),
            Value::Num(42.0)
        );
        // scripts can write globals back to the host
        engine
            .exec("write", &Expr::assign_global("out", Expr::num(7.0)))
            .unwrap();
        assert_eq!(engine.get_global("out"), Some(Value::Num(7.0)));
    }

    #[test]
    fn test_cost_visible_through_facade() {
        let mut engine = Engine::new();
        engine.exec("e", &Expr::num(1.0)).unwrap();
        assert!(engine.cost() > 0);
    }

    #[test]
    fn test_error_variants_convert() {
        let mut engine = Engine::new();
        let err = engine.exec("bad", &Expr::name("missing")).unwrap_err();
        assert!(matches!(err, ScriptError::Runtime(_)));
        assert!(err.to_string().contains("missing"));
    }
}
