use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::chunk::Function;
use crate::lang::value::Value;

/// A captured variable. Starts open, aliasing a live stack slot; when that
/// slot leaves the stack the upvalue closes over its value and owns it.
/// The transition is one-way.
#[derive(Debug)]
pub enum Upvalue {
    /// Absolute index of the aliased slot on the VM value stack.
    Open(usize),
    Closed(Value),
}

impl Upvalue {
    pub fn is_open(&self) -> bool {
        matches!(self, Upvalue::Open(_))
    }
}

/// A compiled function bound to its captured environment. Every callable
/// script value is a closure; functions with no captures simply carry an
/// empty upvalue list.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    pub fn new(function: Rc<Function>, upvalues: Vec<Rc<RefCell<Upvalue>>>) -> Self {
        Closure { function, upvalues }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upvalue_closes_once() {
        let upvalue = Rc::new(RefCell::new(Upvalue::Open(3)));
        assert!(upvalue.borrow().is_open());
        *upvalue.borrow_mut() = Upvalue::Closed(Value::Num(7.0));
        assert!(!upvalue.borrow().is_open());
        match &*upvalue.borrow() {
            Upvalue::Closed(Value::Num(n)) => assert_eq!(*n, 7.0),
            other => panic!("expected closed upvalue, got {:?}", other),
        }
    }
}
