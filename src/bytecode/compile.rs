use std::rc::Rc;

use crate::bytecode::chunk::{Builder, Constant, Function};
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op;
use crate::lang::ast::{BinaryOp, Expr, ExprKind, Literal, UnaryOp};

// =============================================================================
// Compiler - expression tree to bytecode
// =============================================================================
//
// One function scope is open per nested function literal being compiled.
// The original design chains compiler objects through parent pointers;
// here the scopes live in one vector and upvalue resolution walks them by
// index, which lets capture marking mutate enclosing scopes without
// aliasing.

/// A local variable in the function being compiled. `slot` is its actual
/// stack offset from the frame pointer, recorded at declaration time; a
/// local declared while operand temporaries sit on the stack lives above
/// them, so the offset can exceed the local's position in this list.
/// Slot 0 always holds the callee or the invocation receiver.
struct Local {
    name: String,
    depth: u32,
    captured: bool,
    slot: usize,
}

/// Compile-time recipe for one captured variable: either the enclosing
/// function's local slot `index`, or the enclosing closure's own upvalue
/// at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    pub index: u16,
    pub is_local: bool,
}

struct FnScope {
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    depth: u32,
    builder: Builder,
    line_starts: Vec<u32>,
    latest_line: u32,
    /// Compile-time model of the runtime stack height above the frame
    /// pointer at the current emission point. New locals take this as
    /// their slot, which keeps them addressable even when declared in
    /// operand position with temporaries beneath them.
    stack_top: usize,
}

impl FnScope {
    fn new() -> Self {
        FnScope {
            locals: Vec::new(),
            upvalues: Vec::new(),
            depth: 0,
            builder: Builder::new(),
            line_starts: Vec::new(),
            latest_line: 0,
            stack_top: 0,
        }
    }
}

pub struct Compiler {
    scopes: Vec<FnScope>,
}

impl Compiler {
    /// Compiles a whole expression tree into a zero-parameter function.
    pub fn compile(name: &str, tree: &Expr) -> Result<Rc<Function>, CompileError> {
        let mut c = Compiler { scopes: Vec::new() };
        c.begin_function()?;
        c.scan_declarations(tree)?;
        c.expr(tree)?;
        let (function, _) = c.end_function(name, tree.line, 0)?;
        Ok(function)
    }

    fn scope(&mut self) -> &mut FnScope {
        let i = self.scopes.len() - 1;
        &mut self.scopes[i]
    }

    fn line(&self) -> u32 {
        self.scopes.last().map(|s| s.latest_line).unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Function scopes
    // -------------------------------------------------------------------------

    fn begin_function(&mut self) -> Result<(), CompileError> {
        self.scopes.push(FnScope::new());
        // slot 0: callee / receiver
        self.register_local("")
    }

    fn end_function(
        &mut self,
        name: &str,
        start_line: u32,
        param_count: usize,
    ) -> Result<(Rc<Function>, Vec<UpvalueDesc>), CompileError> {
        self.emit(op::RETURN);
        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| CompileError::internal("no open function scope"))?;
        let function = Function {
            name: name.to_string(),
            chunk: scope.builder.build(),
            param_count,
            num_upvalues: scope.upvalues.len(),
            start_line,
            line_starts: scope.line_starts,
        };
        Ok((Rc::new(function), scope.upvalues))
    }

    // -------------------------------------------------------------------------
    // Lexical scopes and variable resolution
    // -------------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.scope().depth += 1;
    }

    /// Pops locals declared in the closing scope. The block result sits on
    /// top of the stack, so each dying slot is removed from underneath it;
    /// captured slots close their upvalue on the way out.
    fn end_scope(&mut self) {
        self.scope().depth -= 1;
        loop {
            let scope = self.scope();
            let Some(local) = scope.locals.last() else {
                break;
            };
            if local.depth <= scope.depth {
                break;
            }
            let captured = local.captured;
            scope.locals.pop();
            scope.stack_top -= 1;
            if captured {
                self.emit(op::CLOSE_UPVALUE);
            } else {
                self.emit(op::POP_UNDER);
            }
        }
    }

    fn register_local(&mut self, name: &str) -> Result<(), CompileError> {
        let line = self.line();
        let scope = self.scope();
        let slot = scope.stack_top;
        if slot > u16::MAX as usize {
            return Err(CompileError::TooManyLocals { line });
        }
        let depth = scope.depth;
        scope.locals.push(Local {
            name: name.to_string(),
            depth,
            captured: false,
            slot,
        });
        scope.stack_top += 1;
        Ok(())
    }

    /// Accounts for values the emitted code keeps on the stack while a
    /// later operand compiles; any local declared inside that operand must
    /// be addressed above them.
    fn raise_stack(&mut self, n: usize) {
        self.scope().stack_top += n;
    }

    fn lower_stack(&mut self, n: usize) {
        self.scope().stack_top -= n;
    }

    /// Innermost-first scan so a shadowing declaration wins over the outer
    /// binding of the same name.
    fn resolve_local(&self, scope: usize, name: &str) -> Option<usize> {
        self.scopes[scope]
            .locals
            .iter()
            .rposition(|l| l.name == name)
    }

    fn register_upvalue(
        &mut self,
        scope: usize,
        index: u16,
        is_local: bool,
    ) -> Result<usize, CompileError> {
        let desc = UpvalueDesc { index, is_local };
        if let Some(i) = self.scopes[scope].upvalues.iter().position(|u| *u == desc) {
            return Ok(i);
        }
        if self.scopes[scope].upvalues.len() >= u16::MAX as usize {
            return Err(CompileError::TooManyUpvalues { line: self.line() });
        }
        self.scopes[scope].upvalues.push(desc);
        Ok(self.scopes[scope].upvalues.len() - 1)
    }

    /// Resolves `name` as a capture from an enclosing function. Walks
    /// outward recursively, so a variable can be forwarded through any
    /// number of nesting levels; each level on the path records its own
    /// descriptor and the originating local is marked captured.
    fn resolve_upvalue(&mut self, scope: usize, name: &str) -> Result<Option<usize>, CompileError> {
        if scope == 0 {
            return Ok(None);
        }
        let parent = scope - 1;
        if let Some(local) = self.resolve_local(parent, name) {
            self.scopes[parent].locals[local].captured = true;
            let slot = self.scopes[parent].locals[local].slot;
            return Ok(Some(self.register_upvalue(scope, slot as u16, true)?));
        }
        if let Some(upvalue) = self.resolve_upvalue(parent, name)? {
            return Ok(Some(self.register_upvalue(scope, upvalue as u16, false)?));
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    fn emit(&mut self, opcode: u8) {
        self.scope().builder.write_u8(opcode);
    }

    /// Writes the narrow form when the index fits in a byte, the wide form
    /// otherwise. The single choice point keeps encode and decode in sync.
    fn emit_indexed(&mut self, narrow: u8, wide: u8, index: usize) {
        let builder = &mut self.scope().builder;
        if index <= u8::MAX as usize {
            builder.write_u8(narrow);
            builder.write_u8(index as u8);
        } else {
            builder.write_u8(wide);
            builder.write_u16(index as u16);
        }
    }

    fn register_constant(&mut self, value: Constant) -> Result<usize, CompileError> {
        let line = self.line();
        let scope = self.scope();
        let index = scope.builder.register_constant(value);
        if index > u16::MAX as usize {
            return Err(CompileError::TooManyConstants { line });
        }
        Ok(index)
    }

    /// Emits a jump with a placeholder displacement and returns the
    /// operand's offset for later patching.
    fn emit_jump(&mut self, opcode: u8) -> usize {
        self.emit(opcode);
        let at = self.scope().builder.position();
        self.scope().builder.write_u16(0xFFFF);
        at
    }

    fn patch_jump(&mut self, at: usize) -> Result<(), CompileError> {
        let target = self.scope().builder.position();
        let offset = target as i64 - (at as i64 + 2);
        if offset < i16::MIN as i64 || offset > i16::MAX as i64 {
            return Err(CompileError::JumpTooFar { line: self.line() });
        }
        self.scope().builder.patch_u16_at(at, offset as i16 as u16);
        Ok(())
    }

    fn start_loop(&mut self) -> usize {
        self.scope().builder.position()
    }

    /// Emits the backward branch to `loop_start` (the first byte of the
    /// loop condition).
    fn end_loop(&mut self, loop_start: usize) -> Result<(), CompileError> {
        let position = self.scope().builder.position();
        // 3 bytes for the JUMP instruction itself
        let offset = loop_start as i64 - (position as i64 + 3);
        if offset < i16::MIN as i64 || offset > i16::MAX as i64 {
            return Err(CompileError::JumpTooFar { line: self.line() });
        }
        self.emit(op::JUMP);
        self.scope().builder.write_u16(offset as i16 as u16);
        Ok(())
    }

    /// Emits CLOSURE plus one `(flag, index)` pair per captured variable;
    /// the wide form is chosen when any index needs it.
    fn emit_closure(&mut self, upvalues: &[UpvalueDesc]) {
        let wide = upvalues.iter().any(|u| u.index > u8::MAX as u16);
        self.emit(if wide { op::WIDE_CLOSURE } else { op::CLOSURE });
        for upvalue in upvalues {
            let builder = &mut self.scope().builder;
            builder.write_u8(upvalue.is_local as u8);
            if wide {
                builder.write_u16(upvalue.index);
            } else {
                builder.write_u8(upvalue.index as u8);
            }
        }
    }

    fn accept_line(&mut self, line: u32) {
        while line > self.scope().latest_line {
            let position = self.scope().builder.position() as u32;
            let scope = self.scope();
            scope.line_starts.push(position);
            scope.latest_line += 1;
        }
    }

    // -------------------------------------------------------------------------
    // Declaration pre-scan
    // -------------------------------------------------------------------------

    /// Walks one statement before it compiles, registering any new
    /// assignment targets as locals and reserving their stack slot with a
    /// PUSH_NULL. Function literals and nested blocks declare their own
    /// locals when they compile.
    fn scan_declarations(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Assign {
                global,
                declare,
                name,
                value,
            } => {
                if !*global {
                    let current = self.scopes.len() - 1;
                    let new_binding = if *declare {
                        true
                    } else {
                        self.resolve_local(current, name).is_none()
                            && self.resolve_upvalue(current, name)?.is_none()
                    };
                    if new_binding {
                        self.register_local(name)?;
                        self.emit(op::PUSH_NULL);
                    }
                }
                self.scan_declarations(value)
            }
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.scan_declarations(condition)?;
                self.scan_declarations(then_branch)?;
                if let Some(e) = else_branch {
                    self.scan_declarations(e)?;
                }
                Ok(())
            }
            ExprKind::While { condition, body } => {
                self.scan_declarations(condition)?;
                self.scan_declarations(body)
            }
            ExprKind::Get { object, key } => {
                self.scan_declarations(object)?;
                self.scan_declarations(key)
            }
            ExprKind::SetIndex { object, key, value } => {
                self.scan_declarations(object)?;
                self.scan_declarations(key)?;
                self.scan_declarations(value)
            }
            ExprKind::Call { callee, args } => {
                self.scan_declarations(callee)?;
                for arg in args {
                    self.scan_declarations(arg)?;
                }
                Ok(())
            }
            ExprKind::Invoke {
                object,
                method,
                args,
            } => {
                self.scan_declarations(object)?;
                self.scan_declarations(method)?;
                for arg in args {
                    self.scan_declarations(arg)?;
                }
                Ok(())
            }
            ExprKind::Logical { left, right, .. } | ExprKind::Binary { left, right, .. } => {
                self.scan_declarations(left)?;
                self.scan_declarations(right)
            }
            ExprKind::Unary { operand, .. } => self.scan_declarations(operand),
            ExprKind::ListLiteral(items) => {
                for item in items {
                    self.scan_declarations(item)?;
                }
                Ok(())
            }
            ExprKind::TableLiteral(entries) => {
                for (key, value) in entries {
                    self.scan_declarations(key)?;
                    self.scan_declarations(value)?;
                }
                Ok(())
            }
            // blocks and function literals own their declarations
            ExprKind::Block(_)
            | ExprKind::Function { .. }
            | ExprKind::Literal(_)
            | ExprKind::Name(_)
            | ExprKind::This => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Expression compilation
    // -------------------------------------------------------------------------

    fn expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        self.accept_line(expr.line);
        match &expr.kind {
            ExprKind::Block(exprs) => {
                if exprs.is_empty() {
                    self.emit(op::PUSH_NULL);
                }
                self.begin_scope();
                for (i, e) in exprs.iter().enumerate() {
                    self.scan_declarations(e)?;
                    self.expr(e)?;
                    if i + 1 < exprs.len() {
                        self.emit(op::POP);
                    }
                }
                self.end_scope();
                Ok(())
            }

            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expr(condition)?;
                let jump_else = self.emit_jump(op::JUMP_IF_FALSE);
                self.emit(op::POP);
                self.expr(then_branch)?;
                let jump_out = self.emit_jump(op::JUMP);
                self.patch_jump(jump_else)?;
                self.emit(op::POP);
                match else_branch {
                    Some(e) => self.expr(e)?,
                    None => self.emit(op::PUSH_NULL),
                }
                self.patch_jump(jump_out)
            }

            ExprKind::While { condition, body } => {
                // result slot; replaced by the body value each iteration
                self.emit(op::PUSH_NULL);
                self.raise_stack(1);
                let start = self.start_loop();
                self.expr(condition)?;
                let jump_end = self.emit_jump(op::JUMP_IF_FALSE);
                self.emit(op::POP); // condition
                self.emit(op::POP); // previous result
                self.lower_stack(1);
                self.expr(body)?;
                self.end_loop(start)?;
                self.patch_jump(jump_end)?;
                self.emit(op::POP); // condition
                Ok(())
            }

            ExprKind::Literal(lit) => {
                let constant = match lit {
                    Literal::Null => {
                        self.emit(op::PUSH_NULL);
                        return Ok(());
                    }
                    Literal::Bool(b) => Constant::Bool(*b),
                    Literal::Num(n) => Constant::Num(*n),
                    Literal::Str(s) => Constant::Str(Rc::from(s.as_str())),
                };
                let index = self.register_constant(constant)?;
                self.emit_indexed(op::CONSTANT, op::WIDE_CONSTANT, index);
                Ok(())
            }

            ExprKind::Name(name) => {
                let current = self.scopes.len() - 1;
                if let Some(local) = self.resolve_local(current, name) {
                    let slot = self.scopes[current].locals[local].slot;
                    self.emit_indexed(op::LOAD_LOCAL, op::WIDE_LOAD_LOCAL, slot);
                } else if let Some(index) = self.resolve_upvalue(current, name)? {
                    self.emit_indexed(op::LOAD_UPVALUE, op::WIDE_LOAD_UPVALUE, index);
                } else {
                    let index =
                        self.register_constant(Constant::Str(Rc::from(name.as_str())))?;
                    self.emit_indexed(op::LOAD_GLOBAL, op::WIDE_LOAD_GLOBAL, index);
                }
                Ok(())
            }

            ExprKind::This => {
                self.emit_indexed(op::LOAD_LOCAL, op::WIDE_LOAD_LOCAL, 0);
                Ok(())
            }

            ExprKind::Function { name, params, body } => {
                self.begin_function()?;
                for param in params {
                    self.register_local(param)?;
                }
                // bodies that are not blocks still declare their targets
                self.scan_declarations(body)?;
                self.expr(body)?;
                let fn_name = name.as_deref().unwrap_or("fn");
                let (function, upvalues) =
                    self.end_function(fn_name, expr.line, params.len())?;
                let index = self.register_constant(Constant::Fn(function))?;
                self.emit_indexed(op::CONSTANT, op::WIDE_CONSTANT, index);
                self.emit_closure(&upvalues);
                Ok(())
            }

            ExprKind::Get { object, key } => {
                self.expr(object)?;
                self.raise_stack(1);
                self.expr(key)?;
                self.lower_stack(1);
                self.emit(op::GET);
                Ok(())
            }

            ExprKind::SetIndex { object, key, value } => {
                self.expr(object)?;
                self.raise_stack(1);
                self.expr(key)?;
                self.raise_stack(1);
                self.expr(value)?;
                self.lower_stack(2);
                self.emit(op::SET);
                Ok(())
            }

            ExprKind::Call { callee, args } => {
                self.expr(callee)?;
                self.raise_stack(1);
                for arg in args {
                    self.expr(arg)?;
                    self.raise_stack(1);
                }
                self.lower_stack(1 + args.len());
                self.emit(op::CALL);
                self.emit(self.arg_count(args.len())?);
                Ok(())
            }

            ExprKind::Invoke {
                object,
                method,
                args,
            } => {
                self.expr(object)?;
                self.raise_stack(1);
                self.expr(method)?;
                self.raise_stack(1);
                for arg in args {
                    self.expr(arg)?;
                    self.raise_stack(1);
                }
                self.lower_stack(2 + args.len());
                self.emit(op::INVOKE);
                self.emit(self.arg_count(args.len())?);
                Ok(())
            }

            ExprKind::Assign {
                global,
                name,
                value,
                ..
            } => {
                if *global {
                    let index =
                        self.register_constant(Constant::Str(Rc::from(name.as_str())))?;
                    self.expr(value)?;
                    self.emit_indexed(op::SET_GLOBAL, op::WIDE_SET_GLOBAL, index);
                    return Ok(());
                }
                let current = self.scopes.len() - 1;
                if let Some(local) = self.resolve_local(current, name) {
                    let slot = self.scopes[current].locals[local].slot;
                    self.expr(value)?;
                    self.emit_indexed(op::SET_LOCAL, op::WIDE_SET_LOCAL, slot);
                } else if let Some(index) = self.resolve_upvalue(current, name)? {
                    self.expr(value)?;
                    self.emit_indexed(op::SET_UPVALUE, op::WIDE_SET_UPVALUE, index);
                } else {
                    // the pre-scan registers every new target before its
                    // statement compiles
                    return Err(CompileError::internal(format!(
                        "assignment target '{}' was never declared",
                        name
                    )));
                }
                Ok(())
            }

            ExprKind::Logical { and, left, right } => {
                self.expr(left)?;
                let short_circuit = self.emit_jump(if *and {
                    op::JUMP_IF_FALSE
                } else {
                    op::JUMP_IF_TRUE
                });
                self.emit(op::POP);
                self.expr(right)?;
                self.patch_jump(short_circuit)
            }

            ExprKind::Binary { op: bin, left, right } => {
                self.expr(left)?;
                self.raise_stack(1);
                self.expr(right)?;
                self.lower_stack(1);
                self.emit(binary_opcode(*bin));
                Ok(())
            }

            ExprKind::Unary { op: un, operand } => {
                self.expr(operand)?;
                self.emit(match un {
                    UnaryOp::Negate => op::NEGATE,
                    UnaryOp::Not => op::NOT,
                });
                Ok(())
            }

            ExprKind::ListLiteral(items) => {
                self.emit(op::NEW_LIST);
                self.raise_stack(1);
                for item in items {
                    self.expr(item)?;
                    self.emit(op::LIST_PUSH);
                }
                self.lower_stack(1);
                Ok(())
            }

            ExprKind::TableLiteral(entries) => {
                self.emit(op::NEW_TABLE);
                self.raise_stack(1);
                for (key, value) in entries {
                    self.expr(key)?;
                    self.raise_stack(1);
                    self.expr(value)?;
                    self.lower_stack(1);
                    self.emit(op::TABLE_SET);
                }
                self.lower_stack(1);
                Ok(())
            }
        }
    }

    fn arg_count(&self, n: usize) -> Result<u8, CompileError> {
        if n > u8::MAX as usize {
            return Err(CompileError::internal(format!(
                "call with {} arguments, max {}",
                n,
                u8::MAX
            )));
        }
        Ok(n as u8)
    }
}

fn binary_opcode(bin: BinaryOp) -> u8 {
    match bin {
        BinaryOp::Add => op::ADD,
        BinaryOp::Sub => op::SUB,
        BinaryOp::Mul => op::MUL,
        BinaryOp::Div => op::DIV,
        BinaryOp::Mod => op::MOD,
        BinaryOp::Eq => op::EQ,
        BinaryOp::Neq => op::NEQ,
        BinaryOp::Lt => op::LT,
        BinaryOp::Gt => op::GT,
        BinaryOp::Lte => op::LTE,
        BinaryOp::Gte => op::GTE,
    }
}
