use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::bytecode::chunk::{Constant, Function};
use crate::bytecode::op;
use crate::lang::value::{TableKey, Value};
use crate::runtime::builtins::ClassRegistry;
use crate::runtime::closure::{Closure, Upvalue};
use crate::runtime::native::NativeFn;
use crate::runtime::runtime_error::RuntimeError;

// =============================================================================
// Virtual machine
// =============================================================================
//
// A stack VM over the bytecode in `bytecode::op`. One value stack shared by
// all frames; each frame records its base pointer `fp`, with slot 0 holding
// the callee (CALL) or the receiver (INVOKE). Frames entered from the host
// are flagged so their RETURN exits the dispatch loop, which makes native
// functions free to call back into script code re-entrantly.

/// Execution limits. `max_cost` of `None` means unmetered.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum call depth before execution aborts.
    pub max_frames: usize,
    /// Execution cost budget; exceeding it is a runtime error.
    pub max_cost: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_frames: 256,
            max_cost: None,
        }
    }
}

struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    /// Base of this frame on the value stack.
    fp: usize,
    /// Set when the frame was entered through the host API; its RETURN
    /// hands the result back instead of continuing dispatch.
    from_host: bool,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<String, Value>,
    /// At most one open upvalue per live stack slot, keyed by slot index.
    /// `split_off` gives all entries at or above a base in one call when a
    /// frame or scope dies.
    open_upvalues: BTreeMap<usize, Rc<RefCell<Upvalue>>>,
    classes: ClassRegistry,
    config: VmConfig,
    cost: u64,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: HashMap::new(),
            open_upvalues: BTreeMap::new(),
            classes: ClassRegistry::new(),
            config,
            cost: 0,
        }
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Total execution cost accumulated so far. Never decreases.
    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// Runs a compiled top-level function to completion.
    pub fn run_function(&mut self, function: Rc<Function>) -> Result<Value, RuntimeError> {
        let closure = Rc::new(Closure::new(function, Vec::new()));
        self.call(&Value::Closure(closure), &[])
    }

    /// Calls any callable value with the given arguments. Safe to use from
    /// inside a native function; script execution nests.
    pub fn call(&mut self, callee: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let stack_before = self.stack.len();
        let frames_before = self.frames.len();
        self.stack.push(callee.clone());
        self.stack.extend(args.iter().cloned());

        let result = match self.make_call(callee.clone(), args.len(), false, true) {
            Ok(()) => {
                if self.frames.len() > frames_before {
                    self.dispatch()
                } else {
                    // native callee already ran and left its result
                    Ok(self.pop())
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => Ok(value),
            Err(mut err) => {
                if err.trace.is_empty() {
                    self.fill_trace(&mut err);
                }
                // unwind everything this entry pushed
                self.frames.truncate(frames_before);
                self.close_upvalues(stack_before);
                self.stack.truncate(stack_before);
                Err(err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    fn dispatch(&mut self) -> Result<Value, RuntimeError> {
        loop {
            self.add_cost(1)?;
            let opcode = self.read_u8();
            match opcode {
                op::CONSTANT | op::WIDE_CONSTANT => {
                    let value = match self.read_constant(opcode == op::WIDE_CONSTANT) {
                        Constant::Num(n) => Value::Num(n),
                        Constant::Bool(b) => Value::Bool(b),
                        Constant::Str(s) => Value::Str(s),
                        Constant::Fn(f) => Value::Function(f),
                    };
                    self.stack.push(value);
                }

                op::PUSH_NULL => self.stack.push(Value::Null),

                op::POP => {
                    self.pop();
                }

                op::POP_UNDER => {
                    let top = self.stack.len();
                    self.stack.remove(top - 2);
                }

                op::ADD
                | op::SUB
                | op::MUL
                | op::DIV
                | op::MOD
                | op::LT
                | op::GT
                | op::LTE
                | op::GTE => self.binary(opcode)?,

                op::EQ => {
                    let r = self.pop();
                    let l = self.pop();
                    self.stack.push(Value::Bool(l == r));
                }

                op::NEQ => {
                    let r = self.pop();
                    let l = self.pop();
                    self.stack.push(Value::Bool(l != r));
                }

                op::NEGATE => self.negate()?,

                op::NOT => {
                    let v = self.pop();
                    self.stack.push(Value::Bool(!v.is_truthy()));
                }

                op::SET_GLOBAL | op::WIDE_SET_GLOBAL => {
                    let name = self.read_name(opcode == op::WIDE_SET_GLOBAL)?;
                    let value = self.peek().clone();
                    self.globals.insert(name.to_string(), value);
                }

                op::LOAD_GLOBAL | op::WIDE_LOAD_GLOBAL => {
                    let name = self.read_name(opcode == op::WIDE_LOAD_GLOBAL)?;
                    match self.globals.get(name.as_ref()) {
                        Some(v) => {
                            let v = v.clone();
                            self.stack.push(v);
                        }
                        None => {
                            return Err(self.error(format!("unrecognized name '{}'", name)));
                        }
                    }
                }

                op::SET_LOCAL | op::WIDE_SET_LOCAL => {
                    let slot = self.frame_fp() + self.read_operand(opcode == op::WIDE_SET_LOCAL);
                    let value = self.peek().clone();
                    self.stack[slot] = value;
                }

                op::LOAD_LOCAL | op::WIDE_LOAD_LOCAL => {
                    let slot = self.frame_fp() + self.read_operand(opcode == op::WIDE_LOAD_LOCAL);
                    let value = self.stack[slot].clone();
                    self.stack.push(value);
                }

                op::SET_UPVALUE | op::WIDE_SET_UPVALUE => {
                    let index = self.read_operand(opcode == op::WIDE_SET_UPVALUE);
                    self.add_cost(1)?;
                    let assigned = self.peek().clone();
                    let cell = self.current_closure().upvalues[index].clone();
                    let open_slot = match &mut *cell.borrow_mut() {
                        Upvalue::Open(slot) => Some(*slot),
                        Upvalue::Closed(v) => {
                            *v = assigned.clone();
                            None
                        }
                    };
                    if let Some(slot) = open_slot {
                        self.stack[slot] = assigned;
                    }
                }

                op::LOAD_UPVALUE | op::WIDE_LOAD_UPVALUE => {
                    let index = self.read_operand(opcode == op::WIDE_LOAD_UPVALUE);
                    self.add_cost(1)?;
                    let cell = self.current_closure().upvalues[index].clone();
                    let value = match &*cell.borrow() {
                        Upvalue::Open(slot) => self.stack[*slot].clone(),
                        Upvalue::Closed(v) => v.clone(),
                    };
                    self.stack.push(value);
                }

                op::JUMP => {
                    let displacement = self.read_u16() as i16;
                    self.jump(displacement);
                }

                op::JUMP_IF_FALSE => {
                    let displacement = self.read_u16() as i16;
                    if !self.peek().is_truthy() {
                        self.jump(displacement);
                    }
                }

                op::JUMP_IF_TRUE => {
                    let displacement = self.read_u16() as i16;
                    if self.peek().is_truthy() {
                        self.jump(displacement);
                    }
                }

                op::CALL => {
                    let argc = self.read_u8() as usize;
                    let callee = self.stack[self.stack.len() - argc - 1].clone();
                    self.make_call(callee, argc, false, false)?;
                }

                op::INVOKE => {
                    let argc = self.read_u8() as usize;
                    self.invoke(argc)?;
                }

                op::CLOSURE | op::WIDE_CLOSURE => {
                    self.make_closure(opcode == op::WIDE_CLOSURE)?;
                }

                op::CLOSE_UPVALUE => {
                    let slot = self.stack.len() - 2;
                    if let Some(cell) = self.open_upvalues.remove(&slot) {
                        self.add_cost(1)?;
                        *cell.borrow_mut() = Upvalue::Closed(self.stack[slot].clone());
                    }
                    self.stack.remove(slot);
                }

                op::RETURN => {
                    if let Some(result) = self.do_return()? {
                        return Ok(result);
                    }
                }

                op::GET => self.get_op()?,
                op::SET => self.set_op()?,

                op::NEW_LIST => self.stack.push(Value::list(Vec::new())),

                op::LIST_PUSH => {
                    let item = self.pop();
                    match self.peek() {
                        Value::List(items) => items.borrow_mut().push(item),
                        other => {
                            return Err(self.error(format!(
                                "list literal built over a value of type {}",
                                other.type_name()
                            )));
                        }
                    }
                }

                op::NEW_TABLE => self.stack.push(Value::table()),

                op::TABLE_SET => {
                    let value = self.pop();
                    let key = self.pop();
                    let Some(key) = TableKey::from_value(&key) else {
                        return Err(self.error(format!(
                            "a value of type {} cannot key a table",
                            key.type_name()
                        )));
                    };
                    match self.peek() {
                        Value::Table(entries) => {
                            entries.borrow_mut().insert(key, value);
                        }
                        other => {
                            return Err(self.error(format!(
                                "table literal built over a value of type {}",
                                other.type_name()
                            )));
                        }
                    }
                }

                other => {
                    return Err(self.error(format!("unknown opcode {}", other)));
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Begins a call with `nargs` arguments on top of the stack. The slot
    /// below them becomes the new frame's slot 0: the callee itself for a
    /// plain call, the receiver when `invoking`. Closure calls push a frame
    /// and return; native calls run to completion here, with the receiver
    /// prepended to their argument list when invoking.
    fn make_call(
        &mut self,
        callee: Value,
        nargs: usize,
        invoking: bool,
        from_host: bool,
    ) -> Result<(), RuntimeError> {
        let fp = self.stack.len() - nargs - 1;
        match callee {
            Value::Closure(closure) => {
                if closure.function.param_count != nargs {
                    return Err(self.error(format!(
                        "{} expects {} args, got {}",
                        closure.function.name, closure.function.param_count, nargs
                    )));
                }
                if self.frames.len() >= self.config.max_frames {
                    return Err(self.error(format!(
                        "call stack overflow, max depth {}",
                        self.config.max_frames
                    )));
                }
                self.frames.push(CallFrame {
                    closure,
                    ip: 0,
                    fp,
                    from_host,
                });
                Ok(())
            }
            Value::Native(native) => {
                let given = nargs + usize::from(invoking);
                if native.param_count != given {
                    return Err(self.error(format!(
                        "{} expects {} args, got {}",
                        native.name,
                        if invoking {
                            native.param_count.saturating_sub(1)
                        } else {
                            native.param_count
                        },
                        nargs
                    )));
                }
                let start = if invoking { fp } else { fp + 1 };
                let args: Vec<Value> = self.stack[start..].to_vec();
                self.stack.truncate(fp);
                let result = self.call_native(native, &args)?;
                self.stack.push(result);
                Ok(())
            }
            other => Err(self.error(format!(
                "cannot call a value of type {}",
                other.type_name()
            ))),
        }
    }

    fn call_native(&mut self, native: Rc<NativeFn>, args: &[Value]) -> Result<Value, RuntimeError> {
        self.add_cost(args.len() as u64)?;
        if let Some(penalty) = native.cost_penalty.clone() {
            self.add_cost(penalty(args))?;
        }
        let func = native.func.clone();
        func(self, args)
    }

    /// Method call: stack is `<receiver> <name> <args...>`. Resolution tries
    /// the arity-suffixed name (`push_1`) before the bare name, walking the
    /// receiver's class chain.
    fn invoke(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let name_at = self.stack.len() - argc - 1;
        let receiver = self.stack[name_at - 1].clone();
        let name = match &self.stack[name_at] {
            Value::Str(s) => s.clone(),
            other => {
                return Err(self.error(format!(
                    "method name must be a string, got {}",
                    other.type_name()
                )));
            }
        };
        let class = self.classes.class_of(&receiver);
        let method = class
            .find_method(&format!("{}_{}", name, argc))
            .or_else(|| class.find_method(name.as_ref()));
        let Some(method) = method else {
            return Err(self.error(format!(
                "type {} has no method '{}' taking {} args",
                receiver.type_name(),
                name,
                argc
            )));
        };
        // drop the name slot so the receiver becomes the callee's slot 0
        self.stack.remove(name_at);
        self.make_call(method, argc, true, false)
    }

    fn do_return(&mut self) -> Result<Option<Value>, RuntimeError> {
        let Some(frame) = self.frames.pop() else {
            return Err(self.error("return outside any call frame"));
        };
        let result = self.pop();
        let closed = self.close_upvalues(frame.fp);
        self.add_cost(closed)?;
        self.stack.truncate(frame.fp);
        if frame.from_host {
            Ok(Some(result))
        } else {
            self.stack.push(result);
            Ok(None)
        }
    }

    // -------------------------------------------------------------------------
    // Upvalues
    // -------------------------------------------------------------------------

    fn capture(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        self.open_upvalues
            .entry(slot)
            .or_insert_with(|| Rc::new(RefCell::new(Upvalue::Open(slot))))
            .clone()
    }

    /// Closes every open upvalue at or above `from_slot`, transferring the
    /// slot's current value into the cell. Returns how many closed.
    fn close_upvalues(&mut self, from_slot: usize) -> u64 {
        let dying = self.open_upvalues.split_off(&from_slot);
        let count = dying.len() as u64;
        for (slot, cell) in dying {
            let value = self.stack.get(slot).cloned().unwrap_or(Value::Null);
            *cell.borrow_mut() = Upvalue::Closed(value);
        }
        count
    }

    fn make_closure(&mut self, wide: bool) -> Result<(), RuntimeError> {
        let function = match self.pop() {
            Value::Function(f) => f,
            other => {
                return Err(self.error(format!(
                    "closure built over a value of type {}",
                    other.type_name()
                )));
            }
        };
        let mut upvalues = Vec::with_capacity(function.num_upvalues);
        for _ in 0..function.num_upvalues {
            let is_local = self.read_u8() == 1;
            let index = self.read_operand(wide);
            self.add_cost(1)?;
            let cell = if is_local {
                let slot = self.frame_fp() + index;
                self.capture(slot)
            } else {
                self.current_closure().upvalues[index].clone()
            };
            upvalues.push(cell);
        }
        self.stack
            .push(Value::Closure(Rc::new(Closure::new(function, upvalues))));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Operators and indexing
    // -------------------------------------------------------------------------

    fn binary(&mut self, opcode: u8) -> Result<(), RuntimeError> {
        let top = self.stack.len();
        let l = self.stack[top - 2].clone();
        let r = self.stack[top - 1].clone();

        if let (Value::Num(a), Value::Num(b)) = (&l, &r) {
            let result = match opcode {
                op::ADD => Value::Num(a + b),
                op::SUB => Value::Num(a - b),
                op::MUL => Value::Num(a * b),
                op::DIV => Value::Num(a / b),
                op::MOD => Value::Num(a % b),
                op::LT => Value::Bool(a < b),
                op::GT => Value::Bool(a > b),
                op::LTE => Value::Bool(a <= b),
                op::GTE => Value::Bool(a >= b),
                other => return Err(self.error(format!("bad arithmetic opcode {}", other))),
            };
            self.stack.truncate(top - 2);
            self.stack.push(result);
            return Ok(());
        }

        // concatenation when either side is a string
        if opcode == op::ADD
            && (matches!(l, Value::Str(_)) || matches!(r, Value::Str(_)))
        {
            let joined = format!("{}{}", l, r);
            self.stack.truncate(top - 2);
            self.stack.push(Value::str(joined));
            return Ok(());
        }

        let stem = match opcode {
            op::ADD => "add",
            op::SUB => "sub",
            op::MUL => "mul",
            op::DIV => "div",
            op::MOD => "mod",
            op::LT => "lt",
            op::GT => "gt",
            op::LTE => "lte",
            op::GTE => "gte",
            other => return Err(self.error(format!("bad arithmetic opcode {}", other))),
        };
        self.operator_fallback(stem, &l, &r)
    }

    /// Operator overload resolution: the left operand's class is asked for
    /// `__<op>_<rhsType>` then `__<op>`; on a miss the right operand's class
    /// is asked for the reversed forms `__<op>R_<lhsType>` then `__<op>R`
    /// with the operands swapped.
    fn operator_fallback(&mut self, stem: &str, l: &Value, r: &Value) -> Result<(), RuntimeError> {
        let left_class = self.classes.class_of(l);
        if let Some(method) = left_class
            .find_method(&format!("__{}_{}", stem, r.type_name()))
            .or_else(|| left_class.find_method(&format!("__{}", stem)))
        {
            return self.make_call(method, 1, true, false);
        }
        let right_class = self.classes.class_of(r);
        if let Some(method) = right_class
            .find_method(&format!("__{}R_{}", stem, l.type_name()))
            .or_else(|| right_class.find_method(&format!("__{}R", stem)))
        {
            let top = self.stack.len();
            self.stack.swap(top - 2, top - 1);
            return self.make_call(method, 1, true, false);
        }
        Err(self.error(format!(
            "cannot {} values of types {} and {}",
            stem,
            l.type_name(),
            r.type_name()
        )))
    }

    fn negate(&mut self) -> Result<(), RuntimeError> {
        match self.peek() {
            Value::Num(n) => {
                let negated = Value::Num(-n);
                let top = self.stack.len();
                self.stack[top - 1] = negated;
                Ok(())
            }
            other => {
                let type_name = other.type_name().to_string();
                let class = self.classes.class_of(other);
                match class.find_method("__neg") {
                    Some(method) => self.make_call(method, 0, true, false),
                    None => Err(self.error(format!("cannot negate a value of type {}", type_name))),
                }
            }
        }
    }

    /// Indexed read, stack `<object> <key>`. Resolution order: field getter
    /// (string keys), the object's own field bag (string keys on instances),
    /// `__get_<keyType>`, `__get`.
    fn get_op(&mut self) -> Result<(), RuntimeError> {
        let top = self.stack.len();
        let object = self.stack[top - 2].clone();
        let key = self.stack[top - 1].clone();
        let class = self.classes.class_of(&object);

        if let Value::Str(field) = &key {
            if let Some(getter) = class.find_getter(field) {
                self.stack.truncate(top - 2);
                let result = self.call_native(getter, &[object])?;
                self.stack.push(result);
                return Ok(());
            }
            if let Value::Object(instance) = &object {
                let field_value = instance.fields.borrow().get(field.as_ref()).cloned();
                if let Some(value) = field_value {
                    self.stack.truncate(top - 2);
                    self.stack.push(value);
                    return Ok(());
                }
            }
        }

        if let Some(method) = class
            .find_method(&format!("__get_{}", key.type_name()))
            .or_else(|| class.find_method("__get"))
        {
            return self.make_call(method, 1, true, false);
        }
        Err(self.error(format!(
            "cannot index a value of type {} with a key of type {}",
            object.type_name(),
            key.type_name()
        )))
    }

    /// Indexed write, stack `<object> <key> <value>`; the written value (or
    /// the setter's result) is left on the stack. Resolution order: field
    /// setter, `__set_<keyType>`, `__set`, then instance field bags accept
    /// any string key.
    fn set_op(&mut self) -> Result<(), RuntimeError> {
        let top = self.stack.len();
        let object = self.stack[top - 3].clone();
        let key = self.stack[top - 2].clone();
        let value = self.stack[top - 1].clone();
        let class = self.classes.class_of(&object);

        if let Value::Str(field) = &key {
            if let Some(setter) = class.find_setter(field) {
                self.stack.truncate(top - 3);
                let result = self.call_native(setter, &[object, value])?;
                self.stack.push(result);
                return Ok(());
            }
        }

        if let Some(method) = class
            .find_method(&format!("__set_{}", key.type_name()))
            .or_else(|| class.find_method("__set"))
        {
            return self.make_call(method, 2, true, false);
        }

        if let (Value::Object(instance), Value::Str(field)) = (&object, &key) {
            instance
                .fields
                .borrow_mut()
                .insert(field.to_string(), value.clone());
            self.stack.truncate(top - 3);
            self.stack.push(value);
            return Ok(());
        }
        Err(self.error(format!(
            "cannot write to a value of type {} with a key of type {}",
            object.type_name(),
            key.type_name()
        )))
    }

    // -------------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------------

    fn frame_fp(&self) -> usize {
        self.frames[self.frames.len() - 1].fp
    }

    fn current_closure(&self) -> Rc<Closure> {
        self.frames[self.frames.len() - 1].closure.clone()
    }

    fn read_u8(&mut self) -> u8 {
        let i = self.frames.len() - 1;
        let frame = &mut self.frames[i];
        let byte = frame.closure.function.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        u16::from_be_bytes([hi, lo])
    }

    fn read_operand(&mut self, wide: bool) -> usize {
        if wide {
            self.read_u16() as usize
        } else {
            self.read_u8() as usize
        }
    }

    fn read_constant(&mut self, wide: bool) -> Constant {
        let index = self.read_operand(wide);
        let i = self.frames.len() - 1;
        self.frames[i].closure.function.chunk.constants[index].clone()
    }

    fn read_name(&mut self, wide: bool) -> Result<Rc<str>, RuntimeError> {
        match self.read_constant(wide) {
            Constant::Str(s) => Ok(s),
            other => Err(self.error(format!(
                "name operand resolved to non-string constant {}",
                other
            ))),
        }
    }

    fn jump(&mut self, displacement: i16) {
        let i = self.frames.len() - 1;
        let frame = &mut self.frames[i];
        frame.ip = (frame.ip as i64 + displacement as i64) as usize;
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    fn peek(&self) -> &Value {
        &self.stack[self.stack.len() - 1]
    }

    fn add_cost(&mut self, amount: u64) -> Result<(), RuntimeError> {
        self.cost = self.cost.saturating_add(amount);
        match self.config.max_cost {
            Some(max) if self.cost > max => {
                Err(self.error(format!("execution cost budget of {} exceeded", max)))
            }
            _ => Ok(()),
        }
    }

    fn error(&self, message: impl Into<String>) -> RuntimeError {
        let mut err = RuntimeError::new(message);
        self.trace_into(&mut err);
        err
    }

    fn fill_trace(&self, err: &mut RuntimeError) {
        if err.trace.is_empty() {
            self.trace_into(err);
        }
    }

    fn trace_into(&self, err: &mut RuntimeError) {
        for frame in self.frames.iter().rev() {
            let function = &frame.closure.function;
            err.push_frame(
                function.name.clone(),
                function.line_for(frame.ip.saturating_sub(1)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::Compiler;
    use crate::lang::ast::{BinaryOp, Expr};
    use crate::lang::value::ScriptObject;
    use crate::runtime::builtins;
    use crate::runtime::class::Class;

    fn vm() -> Vm {
        let mut vm = Vm::new(VmConfig::default());
        builtins::install_globals(&mut vm);
        vm
    }

    fn run(vm: &mut Vm, tree: &Expr) -> Result<Value, RuntimeError> {
        let function = Compiler::compile("main", tree).unwrap();
        vm.run_function(function)
    }

    fn eval(tree: &Expr) -> Value {
        run(&mut vm(), tree).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let m = Expr::binary(BinaryOp::Mod, Expr::num(7.0), Expr::num(3.0));
        assert_eq!(eval(&m), Value::Num(1.0));
        let d = Expr::binary(BinaryOp::Div, Expr::num(5.0), Expr::num(2.0));
        assert_eq!(eval(&d), Value::Num(2.5));
    }

    #[test]
    fn test_string_concat() {
        let tree = Expr::binary(BinaryOp::Add, Expr::str("a"), Expr::num(1.0));
        assert_eq!(eval(&tree), Value::str("a1"));
        let tree = Expr::binary(BinaryOp::Add, Expr::num(2.0), Expr::str("b"));
        assert_eq!(eval(&tree), Value::str("2b"));
    }

    #[test]
    fn test_if_else() {
        let tree = Expr::if_(Expr::bool(false), Expr::num(1.0), Some(Expr::num(2.0)));
        assert_eq!(eval(&tree), Value::Num(2.0));
        let tree = Expr::if_(Expr::bool(false), Expr::num(1.0), None);
        assert_eq!(eval(&tree), Value::Null);
    }

    #[test]
    fn test_logical_short_circuit() {
        assert_eq!(eval(&Expr::or(Expr::bool(false), Expr::num(7.0))), Value::Num(7.0));
        // 0 is falsy and short-circuits `and`, leaving itself
        assert_eq!(eval(&Expr::and(Expr::num(0.0), Expr::num(9.0))), Value::Num(0.0));
        assert_eq!(eval(&Expr::and(Expr::num(1.0), Expr::num(9.0))), Value::Num(9.0));
    }

    #[test]
    fn test_while_mutates_enclosing_local() {
        let tree = Expr::block(vec![
            Expr::assign("x", Expr::num(0.0)),
            Expr::while_(
                Expr::binary(BinaryOp::Lt, Expr::name("x"), Expr::num(5.0)),
                Expr::assign("x", Expr::binary(BinaryOp::Add, Expr::name("x"), Expr::num(1.0))),
            ),
        ]);
        assert_eq!(eval(&tree), Value::Num(5.0));
    }

    #[test]
    fn test_declared_shadow_does_not_leak() {
        // the inner block reads its own x
        let tree = Expr::block(vec![
            Expr::assign("x", Expr::num(1.0)),
            Expr::block(vec![Expr::declare("x", Expr::num(2.0)), Expr::name("x")]),
        ]);
        assert_eq!(eval(&tree), Value::Num(2.0));

        // the outer x is untouched once the shadow dies
        let tree = Expr::block(vec![
            Expr::assign("x", Expr::num(1.0)),
            Expr::block(vec![Expr::declare("x", Expr::num(2.0))]),
            Expr::name("x"),
        ]);
        assert_eq!(eval(&tree), Value::Num(1.0));
    }

    #[test]
    fn test_block_declaring_local_as_operand() {
        // 1 + { x = 2; x }
        let tree = Expr::binary(
            BinaryOp::Add,
            Expr::num(1.0),
            Expr::block(vec![Expr::assign("x", Expr::num(2.0)), Expr::name("x")]),
        );
        assert_eq!(eval(&tree), Value::Num(3.0));
    }

    #[test]
    fn test_block_declaring_local_as_call_argument() {
        // f = fn(a, b) a + b; f(10, { y = 5; y })
        let tree = Expr::block(vec![
            Expr::assign(
                "f",
                Expr::function(
                    vec!["a", "b"],
                    Expr::binary(BinaryOp::Add, Expr::name("a"), Expr::name("b")),
                ),
            ),
            Expr::call(
                Expr::name("f"),
                vec![
                    Expr::num(10.0),
                    Expr::block(vec![Expr::assign("y", Expr::num(5.0)), Expr::name("y")]),
                ],
            ),
        ]);
        assert_eq!(eval(&tree), Value::Num(15.0));
    }

    #[test]
    fn test_block_declaring_local_in_while_condition() {
        // x = 0; while { c = x < 3; c } { x = x + 1 }; x
        let tree = Expr::block(vec![
            Expr::assign("x", Expr::num(0.0)),
            Expr::while_(
                Expr::block(vec![
                    Expr::assign(
                        "c",
                        Expr::binary(BinaryOp::Lt, Expr::name("x"), Expr::num(3.0)),
                    ),
                    Expr::name("c"),
                ]),
                Expr::assign("x", Expr::binary(BinaryOp::Add, Expr::name("x"), Expr::num(1.0))),
            ),
            Expr::name("x"),
        ]);
        assert_eq!(eval(&tree), Value::Num(3.0));
    }

    #[test]
    fn test_structural_equality() {
        let tree = Expr::binary(
            BinaryOp::Eq,
            Expr::list(vec![Expr::num(1.0), Expr::num(2.0)]),
            Expr::list(vec![Expr::num(1.0), Expr::num(2.0)]),
        );
        assert_eq!(eval(&tree), Value::Bool(true));
    }

    #[test]
    fn test_closure_captures_param() {
        // f = fn(n) fn() n; f(3)()
        let tree = Expr::block(vec![
            Expr::assign(
                "f",
                Expr::function(vec!["n"], Expr::function(vec![], Expr::name("n"))),
            ),
            Expr::call(Expr::call(Expr::name("f"), vec![Expr::num(3.0)]), vec![]),
        ]);
        assert_eq!(eval(&tree), Value::Num(3.0));
    }

    #[test]
    fn test_counter_keeps_state_after_return() {
        // make = fn() { c = 0; fn() c = c + 1 }
        let make = Expr::function(
            vec![],
            Expr::block(vec![
                Expr::assign("c", Expr::num(0.0)),
                Expr::function(
                    vec![],
                    Expr::assign(
                        "c",
                        Expr::binary(BinaryOp::Add, Expr::name("c"), Expr::num(1.0)),
                    ),
                ),
            ]),
        );
        let tree = Expr::block(vec![
            Expr::assign("make", make),
            Expr::assign("counter", Expr::call(Expr::name("make"), vec![])),
            Expr::call(Expr::name("counter"), vec![]),
            Expr::call(Expr::name("counter"), vec![]),
        ]);
        assert_eq!(eval(&tree), Value::Num(2.0));
    }

    #[test]
    fn test_two_closures_share_one_cell() {
        // pair = fn() { x = 0; [fn(v) x = v, fn() x] }
        let pair = Expr::function(
            vec![],
            Expr::block(vec![
                Expr::assign("x", Expr::num(0.0)),
                Expr::list(vec![
                    Expr::function(vec!["v"], Expr::assign("x", Expr::name("v"))),
                    Expr::function(vec![], Expr::name("x")),
                ]),
            ]),
        );
        let tree = Expr::block(vec![
            Expr::assign("fns", Expr::call(Expr::name("pair"), vec![])),
            Expr::call(
                Expr::get(Expr::name("fns"), Expr::num(0.0)),
                vec![Expr::num(5.0)],
            ),
            Expr::call(Expr::get(Expr::name("fns"), Expr::num(1.0)), vec![]),
        ]);
        let tree = Expr::block(vec![Expr::assign("pair", pair), tree]);
        assert_eq!(eval(&tree), Value::Num(5.0));
    }

    #[test]
    fn test_stack_empty_after_run() {
        let mut vm = vm();
        let tree = Expr::block(vec![
            Expr::assign("x", Expr::num(1.0)),
            Expr::binary(BinaryOp::Add, Expr::name("x"), Expr::num(2.0)),
        ]);
        run(&mut vm, &tree).unwrap();
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
    }

    #[test]
    fn test_stack_overflow() {
        let mut vm = vm();
        let tree = Expr::block(vec![
            Expr::assign_global("f", Expr::function(vec![], Expr::call(Expr::name("f"), vec![]))),
            Expr::call(Expr::name("f"), vec![]),
        ]);
        let err = run(&mut vm, &tree).unwrap_err();
        assert!(err.message.contains("overflow"));
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn test_cost_budget_enforced() {
        let mut vm = Vm::new(VmConfig {
            max_frames: 256,
            max_cost: Some(50),
        });
        let tree = Expr::while_(Expr::bool(true), Expr::num(1.0));
        let err = run(&mut vm, &tree).unwrap_err();
        assert!(err.message.contains("cost"));
    }

    #[test]
    fn test_cost_accumulates_across_runs() {
        let mut vm = vm();
        run(&mut vm, &Expr::num(1.0)).unwrap();
        let after_first = vm.cost();
        assert!(after_first > 0);
        run(&mut vm, &Expr::num(1.0)).unwrap();
        assert!(vm.cost() > after_first);
    }

    #[test]
    fn test_arity_mismatch() {
        let tree = Expr::call(Expr::function(vec!["x"], Expr::name("x")), vec![]);
        let err = run(&mut vm(), &tree).unwrap_err();
        assert!(err.message.contains("expects 1 args, got 0"));
    }

    #[test]
    fn test_unrecognized_global() {
        let err = run(&mut vm(), &Expr::name("nope")).unwrap_err();
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn test_error_trace_names_frames() {
        let tree = Expr::block(vec![
            Expr::assign(
                "boom",
                Expr::function(vec![], Expr::name("missing")),
            ),
            Expr::call(Expr::name("boom"), vec![]),
        ]);
        let err = run(&mut vm(), &tree).unwrap_err();
        assert_eq!(err.trace.len(), 2);
        assert_eq!(err.trace[1].function, "main");
    }

    #[test]
    fn test_table_roundtrip() {
        let tree = Expr::block(vec![
            Expr::assign("t", Expr::call(Expr::name("table"), vec![])),
            Expr::set_index(Expr::name("t"), Expr::str("k"), Expr::num(1.0)),
            Expr::set_index(Expr::name("t"), Expr::bool(true), Expr::num(2.0)),
            Expr::binary(
                BinaryOp::Add,
                Expr::get(Expr::name("t"), Expr::str("k")),
                Expr::get(Expr::name("t"), Expr::bool(true)),
            ),
        ]);
        assert_eq!(eval(&tree), Value::Num(3.0));
    }

    #[test]
    fn test_table_missing_key_is_null() {
        let tree = Expr::block(vec![
            Expr::assign("t", Expr::call(Expr::name("table"), vec![])),
            Expr::get(Expr::name("t"), Expr::str("absent")),
        ]);
        assert_eq!(eval(&tree), Value::Null);
    }

    #[test]
    fn test_list_indexing_and_methods() {
        let tree = Expr::get(
            Expr::list(vec![Expr::num(1.0), Expr::num(2.0)]),
            Expr::num(1.0),
        );
        assert_eq!(eval(&tree), Value::Num(2.0));

        let tree = Expr::block(vec![
            Expr::assign("l", Expr::list(vec![])),
            Expr::invoke(Expr::name("l"), "push", vec![Expr::num(5.0)]),
            Expr::invoke(Expr::name("l"), "len", vec![]),
        ]);
        assert_eq!(eval(&tree), Value::Num(1.0));
    }

    #[test]
    fn test_list_index_out_of_range() {
        let tree = Expr::get(Expr::list(vec![Expr::num(1.0)]), Expr::num(3.0));
        let err = run(&mut vm(), &tree).unwrap_err();
        assert!(err.message.contains("range"));
    }

    #[test]
    fn test_operator_overload_order() {
        let mut class = Class::new("thing");
        class.add_native(NativeFn::new("__add_num", 2, |_, _| Ok(Value::str("specific"))));
        class.add_native(NativeFn::new("__add", 2, |_, _| Ok(Value::str("generic"))));
        class.add_native(NativeFn::new("__addR_num", 2, |_, _| Ok(Value::str("swapped"))));
        let object = Value::Object(Rc::new(ScriptObject::new(Rc::new(class))));

        let mut vm = vm();
        vm.set_global("obj", object);

        // rhs-typed overload beats the generic one
        let tree = Expr::binary(BinaryOp::Add, Expr::name("obj"), Expr::num(1.0));
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::str("specific"));

        // no bool-specific overload, falls back to __add
        let tree = Expr::binary(BinaryOp::Add, Expr::name("obj"), Expr::bool(true));
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::str("generic"));

        // num on the left knows nothing of thing; the reversed form runs
        let tree = Expr::binary(BinaryOp::Add, Expr::num(1.0), Expr::name("obj"));
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::str("swapped"));
    }

    #[test]
    fn test_getter_beats_get_metamethod() {
        let mut class = Class::new("thing");
        class.add_getter("size", NativeFn::new("size", 1, |_, _| Ok(Value::Num(10.0))));
        class.add_native(NativeFn::new("__get_str", 2, |_, _| Ok(Value::Num(99.0))));
        let object = Value::Object(Rc::new(ScriptObject::new(Rc::new(class))));

        let mut vm = vm();
        vm.set_global("obj", object);
        let tree = Expr::get(Expr::name("obj"), Expr::str("size"));
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::Num(10.0));
        let tree = Expr::get(Expr::name("obj"), Expr::str("other"));
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::Num(99.0));
    }

    #[test]
    fn test_setter_runs_and_returns() {
        let mut class = Class::new("thing");
        class.add_setter(
            "size",
            NativeFn::new("size", 2, |_, args| {
                if let Value::Object(o) = &args[0] {
                    o.fields.borrow_mut().insert("size".into(), args[1].clone());
                }
                Ok(args[1].clone())
            }),
        );
        let object = Rc::new(ScriptObject::new(Rc::new(class)));

        let mut vm = vm();
        vm.set_global("obj", Value::Object(object.clone()));
        let tree = Expr::set_index(Expr::name("obj"), Expr::str("size"), Expr::num(4.0));
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::Num(4.0));
        assert_eq!(
            object.fields.borrow().get("size"),
            Some(&Value::Num(4.0))
        );
    }

    #[test]
    fn test_instance_field_bag() {
        let class = Rc::new(Class::new("thing"));
        let mut vm = vm();
        vm.set_global("obj", Value::Object(Rc::new(ScriptObject::new(class))));
        let tree = Expr::block(vec![
            Expr::set_index(Expr::name("obj"), Expr::str("x"), Expr::num(8.0)),
            Expr::get(Expr::name("obj"), Expr::str("x")),
        ]);
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::Num(8.0));
    }

    #[test]
    fn test_invoke_arity_overloads() {
        let mut class = Class::new("thing");
        class.add_native(NativeFn::new("f_2", 3, |_, _| Ok(Value::str("two"))));
        class.add_native(NativeFn::new("f", 2, |_, _| Ok(Value::str("one"))));
        let object = Value::Object(Rc::new(ScriptObject::new(Rc::new(class))));

        let mut vm = vm();
        vm.set_global("obj", object);
        let tree = Expr::invoke(Expr::name("obj"), "f", vec![Expr::num(1.0), Expr::num(2.0)]);
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::str("two"));
        let tree = Expr::invoke(Expr::name("obj"), "f", vec![Expr::num(1.0)]);
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::str("one"));
    }

    #[test]
    fn test_closure_method_binds_receiver() {
        // compile a standalone `fn() this["x"]`, then install it as a method
        let method_tree = Expr::function(vec![], Expr::get(Expr::this(), Expr::str("x")));
        let mut vm = vm();
        let method = run(&mut vm, &method_tree).unwrap();

        let mut class = Class::new("thing");
        class.add_method("get_x", method);
        let object = Rc::new(ScriptObject::new(Rc::new(class)));
        object.fields.borrow_mut().insert("x".into(), Value::Num(11.0));
        vm.set_global("obj", Value::Object(object));

        let tree = Expr::invoke(Expr::name("obj"), "get_x", vec![]);
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::Num(11.0));
    }

    #[test]
    fn test_native_reenters_vm() {
        let mut vm = vm();
        vm.set_global(
            "apply",
            Value::Native(Rc::new(NativeFn::new("apply", 1, |vm, args| {
                vm.call(&args[0], &[])
            }))),
        );
        let tree = Expr::call(
            Expr::name("apply"),
            vec![Expr::function(vec![], Expr::num(42.0))],
        );
        assert_eq!(run(&mut vm, &tree).unwrap(), Value::Num(42.0));
    }

    #[test]
    fn test_native_cost_penalty_charged() {
        let mut plain = Vm::new(VmConfig::default());
        builtins::install_globals(&mut plain);
        let tree = Expr::block(vec![
            Expr::assign(
                "l",
                Expr::list(vec![Expr::num(1.0), Expr::num(2.0), Expr::num(3.0)]),
            ),
            Expr::invoke(Expr::name("l"), "copy", vec![]),
        ]);
        run(&mut plain, &tree).unwrap();
        let with_copy = plain.cost();

        let mut other = Vm::new(VmConfig::default());
        builtins::install_globals(&mut other);
        let tree = Expr::block(vec![
            Expr::assign(
                "l",
                Expr::list(vec![Expr::num(1.0), Expr::num(2.0), Expr::num(3.0)]),
            ),
            Expr::invoke(Expr::name("l"), "len", vec![]),
        ]);
        run(&mut other, &tree).unwrap();
        // copy pays a per-element penalty that len does not
        assert!(with_copy > other.cost());
    }

    #[test]
    fn test_negate_and_not() {
        assert_eq!(
            eval(&Expr::unary(crate::lang::ast::UnaryOp::Negate, Expr::num(3.0))),
            Value::Num(-3.0)
        );
        assert_eq!(
            eval(&Expr::unary(crate::lang::ast::UnaryOp::Not, Expr::num(0.0))),
            Value::Bool(true)
        );
    }
}
