use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::chunk::Function;
use crate::runtime::class::Class;
use crate::runtime::closure::Closure;
use crate::runtime::native::NativeFn;

/// Runtime value in the Cinder language.
///
/// Values are the only data that can exist on the VM value stack. All
/// numbers are 64-bit floats; there is no separate integer type.
#[derive(Debug, Clone)]
pub enum Value {
    Null,

    Bool(bool),

    /// 64-bit floating-point number.
    Num(f64),

    /// Immutable UTF-8 string.
    Str(Rc<str>),

    /// Mutable list, shared by reference.
    List(Rc<RefCell<Vec<Value>>>),

    /// Mutable primitive-keyed table, shared by reference.
    Table(Rc<RefCell<HashMap<TableKey, Value>>>),

    /// A compiled function paired with its captured upvalues.
    Closure(Rc<Closure>),

    /// A host-provided callable with a fixed parameter count.
    Native(Rc<NativeFn>),

    /// A bare compiled function. Only ever appears on the stack between a
    /// CONSTANT and the CLOSURE instruction that consumes it; it is not
    /// callable by itself.
    Function(Rc<Function>),

    /// A type object: method and field dispatch tables.
    Class(Rc<Class>),

    /// An instance of a user-defined or host-defined class.
    Object(Rc<ScriptObject>),
}

/// An instance value carrying its class and a bag of named fields.
#[derive(Debug)]
pub struct ScriptObject {
    pub class: Rc<Class>,
    pub fields: RefCell<HashMap<String, Value>>,
}

impl ScriptObject {
    pub fn new(class: Rc<Class>) -> Self {
        ScriptObject {
            class,
            fields: RefCell::new(HashMap::new()),
        }
    }
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn table() -> Value {
        Value::Table(Rc::new(RefCell::new(HashMap::new())))
    }

    /// The name of this value's type, as used in diagnostics and in
    /// metamethod names such as `__get_num` or `__add_str`. For objects this
    /// is the name of their class.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Num(_) => "num",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Table(_) => "table",
            Value::Closure(_) | Value::Native(_) | Value::Function(_) => "fn",
            Value::Class(_) => "class",
            Value::Object(o) => &o.class.name,
        }
    }

    /// `false`, `null` and `0` are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null | Value::Bool(false) => false,
            Value::Num(n) => *n != 0.0,
            _ => true,
        }
    }
}

impl PartialEq for Value {
    /// Numbers, booleans and strings compare by value; lists and tables
    /// compare element-wise; callables, classes and objects compare by
    /// identity.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Num(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Table(entries) => write!(f, "table(len={})", entries.borrow().len()),
            Value::Closure(c) => write!(f, "fn {}", c.function.name),
            Value::Native(n) => write!(f, "native fn {}", n.name),
            Value::Function(func) => write!(f, "fn {}", func.name),
            Value::Class(c) => write!(f, "class {}", c.name),
            Value::Object(o) => write!(f, "{} instance", o.class.name),
        }
    }
}

/// A hashable table key. Only null, booleans, numbers and strings can key a
/// table; numbers are keyed by their bit pattern with zero normalized so
/// `0` and `-0` collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TableKey {
    Null,
    Bool(bool),
    Num(u64),
    Str(Rc<str>),
}

impl TableKey {
    pub fn from_value(value: &Value) -> Option<TableKey> {
        match value {
            Value::Null => Some(TableKey::Null),
            Value::Bool(b) => Some(TableKey::Bool(*b)),
            Value::Num(n) => {
                let n = if *n == 0.0 { 0.0 } else { *n };
                Some(TableKey::Num(n.to_bits()))
            }
            Value::Str(s) => Some(TableKey::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            TableKey::Null => Value::Null,
            TableKey::Bool(b) => Value::Bool(*b),
            TableKey::Num(bits) => Value::Num(f64::from_bits(*bits)),
            TableKey::Str(s) => Value::Str(s.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Num(0.0).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Num(1.0).is_truthy());
        assert!(Value::str("").is_truthy());
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::Num(2.5), Value::Num(2.5));
        assert_eq!(Value::str("a"), Value::str("a"));
        assert_ne!(Value::Num(1.0), Value::str("1"));

        // lists compare element-wise
        let a = Value::list(vec![Value::Num(1.0), Value::Num(2.0)]);
        let b = Value::list(vec![Value::Num(1.0), Value::Num(2.0)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_table_key_zero_normalization() {
        let pos = TableKey::from_value(&Value::Num(0.0)).unwrap();
        let neg = TableKey::from_value(&Value::Num(-0.0)).unwrap();
        assert_eq!(pos, neg);
    }

    #[test]
    fn test_table_key_rejects_compound_values() {
        assert!(TableKey::from_value(&Value::list(vec![])).is_none());
        assert!(TableKey::from_value(&Value::table()).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Num(5.0).to_string(), "5");
        assert_eq!(Value::Num(2.5).to_string(), "2.5");
        assert_eq!(Value::Null.to_string(), "null");
        let l = Value::list(vec![Value::Num(1.0), Value::str("x")]);
        assert_eq!(l.to_string(), "[1, x]");
    }
}
