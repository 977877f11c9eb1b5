use std::rc::Rc;

use crate::lang::value::{TableKey, Value};
use crate::runtime::class::Class;
use crate::runtime::native::NativeFn;
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm::Vm;

// =============================================================================
// Builtin classes
// =============================================================================
//
// One class per value type, holding the native methods the engine ships
// with. Method natives receive the receiver as their first argument, so a
// method of N script-visible parameters has param_count N + 1.

/// The per-type dispatch tables consulted by INVOKE, GET, SET and the
/// operator fallback chain. Instances carry their own class instead.
pub struct ClassRegistry {
    pub num: Rc<Class>,
    pub boolean: Rc<Class>,
    pub str: Rc<Class>,
    pub list: Rc<Class>,
    pub table: Rc<Class>,
    pub function: Rc<Class>,
    pub null: Rc<Class>,
    pub class: Rc<Class>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        ClassRegistry {
            num: Rc::new(with_type(Class::new("num"))),
            boolean: Rc::new(with_type(Class::new("bool"))),
            str: Rc::new(str_class()),
            list: Rc::new(list_class()),
            table: Rc::new(table_class()),
            function: Rc::new(with_type(Class::new("fn"))),
            null: Rc::new(with_type(Class::new("null"))),
            class: Rc::new(with_type(Class::new("class"))),
        }
    }

    pub fn class_of(&self, value: &Value) -> Rc<Class> {
        match value {
            Value::Null => self.null.clone(),
            Value::Bool(_) => self.boolean.clone(),
            Value::Num(_) => self.num.clone(),
            Value::Str(_) => self.str.clone(),
            Value::List(_) => self.list.clone(),
            Value::Table(_) => self.table.clone(),
            Value::Closure(_) | Value::Native(_) | Value::Function(_) => self.function.clone(),
            Value::Class(_) => self.class.clone(),
            Value::Object(o) => o.class.clone(),
        }
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the global constructor functions every script can reach.
pub fn install_globals(vm: &mut Vm) {
    vm.set_global(
        "table",
        Value::Native(Rc::new(NativeFn::new("table", 0, |_, _| Ok(Value::table())))),
    );
    vm.set_global(
        "list",
        Value::Native(Rc::new(NativeFn::new("list", 0, |_, _| {
            Ok(Value::list(Vec::new()))
        }))),
    );
}

fn with_type(mut class: Class) -> Class {
    class.add_native(NativeFn::new("type", 1, |_, args| {
        Ok(Value::str(args[0].type_name()))
    }));
    class
}

// -----------------------------------------------------------------------------
// list
// -----------------------------------------------------------------------------

fn list_class() -> Class {
    let mut class = with_type(Class::new("list"));

    class.add_native(NativeFn::new("__get_num", 2, |_, args| {
        let items = list_receiver(args, "__get_num")?;
        let items = items.borrow();
        let i = index_arg(&args[1], items.len())?;
        Ok(items[i].clone())
    }));

    class.add_native(NativeFn::new("__set_num", 3, |_, args| {
        let items = list_receiver(args, "__set_num")?;
        let mut items = items.borrow_mut();
        let len = items.len();
        let i = index_arg(&args[1], len)?;
        items[i] = args[2].clone();
        Ok(args[2].clone())
    }));

    class.add_native(NativeFn::new("len", 1, |_, args| {
        let items = list_receiver(args, "len")?;
        let n = items.borrow().len();
        Ok(Value::Num(n as f64))
    }));

    class.add_native(NativeFn::new("push", 2, |_, args| {
        let items = list_receiver(args, "push")?;
        items.borrow_mut().push(args[1].clone());
        Ok(args[0].clone())
    }));

    class.add_native(NativeFn::new("pop", 1, |_, args| {
        let items = list_receiver(args, "pop")?;
        let popped = items.borrow_mut().pop();
        popped.ok_or_else(|| RuntimeError::new("pop from an empty list"))
    }));

    class.add_native(NativeFn::new("empty", 1, |_, args| {
        let items = list_receiver(args, "empty")?;
        let empty = items.borrow().is_empty();
        Ok(Value::Bool(empty))
    }));

    class.add_native(
        NativeFn::new("copy", 1, |_, args| {
            let items = list_receiver(args, "copy")?;
            let copied = items.borrow().clone();
            Ok(Value::list(copied))
        })
        .with_cost_penalty(list_len_penalty),
    );

    class.add_native(
        NativeFn::new("has", 2, |_, args| {
            let items = list_receiver(args, "has")?;
            let found = items.borrow().contains(&args[1]);
            Ok(Value::Bool(found))
        })
        .with_cost_penalty(list_len_penalty),
    );

    class
}

fn list_len_penalty(args: &[Value]) -> u64 {
    match &args[0] {
        Value::List(items) => items.borrow().len() as u64,
        _ => 0,
    }
}

fn list_receiver<'a>(
    args: &'a [Value],
    method: &str,
) -> Result<&'a Rc<std::cell::RefCell<Vec<Value>>>, RuntimeError> {
    match &args[0] {
        Value::List(items) => Ok(items),
        other => Err(RuntimeError::new(format!(
            "{} expects a list receiver, got {}",
            method,
            other.type_name()
        ))),
    }
}

fn index_arg(value: &Value, len: usize) -> Result<usize, RuntimeError> {
    let n = match value {
        Value::Num(n) => *n,
        other => {
            return Err(RuntimeError::new(format!(
                "list index must be a num, got {}",
                other.type_name()
            )));
        }
    };
    if n < 0.0 || n.fract() != 0.0 {
        return Err(RuntimeError::new(format!(
            "list index must be a non-negative integer, got {}",
            n
        )));
    }
    let i = n as usize;
    if i >= len {
        return Err(RuntimeError::new(format!(
            "index {} out of range for length {}",
            i, len
        )));
    }
    Ok(i)
}

// -----------------------------------------------------------------------------
// table
// -----------------------------------------------------------------------------

fn table_class() -> Class {
    let mut class = with_type(Class::new("table"));

    class.add_native(NativeFn::new("__get", 2, |_, args| {
        let entries = table_receiver(args, "__get")?;
        let key = table_key(&args[1])?;
        let value = entries.borrow().get(&key).cloned();
        Ok(value.unwrap_or(Value::Null))
    }));

    class.add_native(NativeFn::new("__set", 3, |_, args| {
        let entries = table_receiver(args, "__set")?;
        let key = table_key(&args[1])?;
        entries.borrow_mut().insert(key, args[2].clone());
        Ok(args[2].clone())
    }));

    class.add_native(NativeFn::new("remove", 2, |_, args| {
        let entries = table_receiver(args, "remove")?;
        let key = table_key(&args[1])?;
        let removed = entries.borrow_mut().remove(&key);
        Ok(removed.unwrap_or(Value::Null))
    }));

    class.add_native(NativeFn::new("len", 1, |_, args| {
        let entries = table_receiver(args, "len")?;
        let n = entries.borrow().len();
        Ok(Value::Num(n as f64))
    }));

    class.add_native(NativeFn::new("has", 2, |_, args| {
        let entries = table_receiver(args, "has")?;
        let key = table_key(&args[1])?;
        let found = entries.borrow().contains_key(&key);
        Ok(Value::Bool(found))
    }));

    class
}

type TableCell = Rc<std::cell::RefCell<std::collections::HashMap<TableKey, Value>>>;

fn table_receiver<'a>(args: &'a [Value], method: &str) -> Result<&'a TableCell, RuntimeError> {
    match &args[0] {
        Value::Table(entries) => Ok(entries),
        other => Err(RuntimeError::new(format!(
            "{} expects a table receiver, got {}",
            method,
            other.type_name()
        ))),
    }
}

fn table_key(value: &Value) -> Result<TableKey, RuntimeError> {
    TableKey::from_value(value).ok_or_else(|| {
        RuntimeError::new(format!(
            "a value of type {} cannot key a table",
            value.type_name()
        ))
    })
}

// -----------------------------------------------------------------------------
// str
// -----------------------------------------------------------------------------

fn str_class() -> Class {
    let mut class = with_type(Class::new("str"));

    class.add_native(NativeFn::new("len", 1, |_, args| {
        let s = str_receiver(args, "len")?;
        Ok(Value::Num(s.chars().count() as f64))
    }));

    class.add_native(NativeFn::new("upper", 1, |_, args| {
        let s = str_receiver(args, "upper")?;
        Ok(Value::str(s.to_uppercase()))
    }));

    class.add_native(NativeFn::new("lower", 1, |_, args| {
        let s = str_receiver(args, "lower")?;
        Ok(Value::str(s.to_lowercase()))
    }));

    class.add_native(NativeFn::new("sub", 3, |_, args| {
        let s = str_receiver(args, "sub")?;
        let chars: Vec<char> = s.chars().collect();
        let start = index_bound(&args[1], chars.len())?;
        let end = index_bound(&args[2], chars.len())?;
        if start > end {
            return Err(RuntimeError::new(format!(
                "sub start {} is past end {}",
                start, end
            )));
        }
        Ok(Value::str(chars[start..end].iter().collect::<String>()))
    }));

    class
}

fn str_receiver<'a>(args: &'a [Value], method: &str) -> Result<&'a Rc<str>, RuntimeError> {
    match &args[0] {
        Value::Str(s) => Ok(s),
        other => Err(RuntimeError::new(format!(
            "{} expects a str receiver, got {}",
            method,
            other.type_name()
        ))),
    }
}

/// Like `index_arg` but allows the one-past-the-end position.
fn index_bound(value: &Value, len: usize) -> Result<usize, RuntimeError> {
    let n = match value {
        Value::Num(n) => *n,
        other => {
            return Err(RuntimeError::new(format!(
                "string position must be a num, got {}",
                other.type_name()
            )));
        }
    };
    if n < 0.0 || n.fract() != 0.0 {
        return Err(RuntimeError::new(format!(
            "string position must be a non-negative integer, got {}",
            n
        )));
    }
    let i = n as usize;
    if i > len {
        return Err(RuntimeError::new(format!(
            "position {} out of range for length {}",
            i, len
        )));
    }
    Ok(i)
}
