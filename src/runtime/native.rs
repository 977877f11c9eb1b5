use std::rc::Rc;

use crate::lang::value::Value;
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm::Vm;

/// Signature of a host function. Receives the VM so it can call back into
/// script code, plus the argument values (for method-style natives the
/// receiver is the first argument).
pub type NativeBody = dyn Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>;

/// Extra execution cost charged per call, computed from the arguments.
/// Lets a host price operations whose real cost scales with their input,
/// such as copying a list.
pub type CostPenalty = dyn Fn(&[Value]) -> u64;

/// A host-provided callable with a fixed parameter count.
pub struct NativeFn {
    pub name: String,
    /// Number of arguments `func` expects, the receiver included when the
    /// native is installed as a method.
    pub param_count: usize,
    pub func: Rc<NativeBody>,
    pub cost_penalty: Option<Rc<CostPenalty>>,
}

impl NativeFn {
    pub fn new(
        name: impl Into<String>,
        param_count: usize,
        func: impl Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError> + 'static,
    ) -> Self {
        NativeFn {
            name: name.into(),
            param_count,
            func: Rc::new(func),
            cost_penalty: None,
        }
    }

    pub fn with_cost_penalty(mut self, penalty: impl Fn(&[Value]) -> u64 + 'static) -> Self {
        self.cost_penalty = Some(Rc::new(penalty));
        self
    }
}

impl std::fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFn")
            .field("name", &self.name)
            .field("param_count", &self.param_count)
            .finish_non_exhaustive()
    }
}
