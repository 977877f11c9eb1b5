//! The expression tree consumed by the compiler.
//!
//! Cinder is expression-oriented: blocks, conditionals and loops all
//! produce a value. A host parser (or the host application directly)
//! builds these trees; the compiler in `bytecode::compile` lowers them to
//! a `Chunk`.

/// One node of the expression tree, tagged with its starting source line
/// for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub line: u32,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// A sequence of expressions in its own lexical scope; evaluates to the
    /// last expression, or null when empty.
    Block(Vec<Expr>),

    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },

    /// Evaluates to the body's value on the final iteration, or null if the
    /// body never ran.
    While {
        condition: Box<Expr>,
        body: Box<Expr>,
    },

    Literal(Literal),

    /// A variable read: local, then upvalue, then global.
    Name(String),

    /// The receiver slot of the current call frame.
    This,

    /// A function literal. Becomes a closure at runtime.
    Function {
        name: Option<String>,
        params: Vec<String>,
        body: Box<Expr>,
    },

    /// `object[key]`
    Get {
        object: Box<Expr>,
        key: Box<Expr>,
    },

    /// `object[key] = value`
    SetIndex {
        object: Box<Expr>,
        key: Box<Expr>,
        value: Box<Expr>,
    },

    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },

    /// `object.method(args)`. Resolves the method by name on the receiver
    /// and binds the receiver as the callee's slot 0.
    Invoke {
        object: Box<Expr>,
        method: Box<Expr>,
        args: Vec<Expr>,
    },

    /// A variable write. Non-global assignment to an undeclared name
    /// declares a new local in the enclosing block; with `declare` set the
    /// assignment always introduces a fresh local, shadowing any visible
    /// binding of the same name until the block exits.
    Assign {
        global: bool,
        declare: bool,
        name: String,
        value: Box<Expr>,
    },

    /// Short-circuiting `and` / `or`.
    Logical {
        and: bool,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    ListLiteral(Vec<Expr>),

    TableLiteral(Vec<(Expr, Expr)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
}

impl BinaryOp {
    /// Stem used to form metamethod names (`__add_num`, `__ltR`, ...).
    pub fn method_stem(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
            BinaryOp::Eq => "eq",
            BinaryOp::Neq => "neq",
            BinaryOp::Lt => "lt",
            BinaryOp::Gt => "gt",
            BinaryOp::Lte => "lte",
            BinaryOp::Gte => "gte",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

// Construction helpers. Nodes default to line 1; use `at` to tag real
// source positions.
impl Expr {
    pub fn new(line: u32, kind: ExprKind) -> Expr {
        Expr { line, kind }
    }

    pub fn at(mut self, line: u32) -> Expr {
        self.line = line;
        self
    }

    pub fn null() -> Expr {
        Expr::new(1, ExprKind::Literal(Literal::Null))
    }

    pub fn bool(b: bool) -> Expr {
        Expr::new(1, ExprKind::Literal(Literal::Bool(b)))
    }

    pub fn num(n: f64) -> Expr {
        Expr::new(1, ExprKind::Literal(Literal::Num(n)))
    }

    pub fn str(s: impl Into<String>) -> Expr {
        Expr::new(1, ExprKind::Literal(Literal::Str(s.into())))
    }

    pub fn name(n: impl Into<String>) -> Expr {
        Expr::new(1, ExprKind::Name(n.into()))
    }

    pub fn this() -> Expr {
        Expr::new(1, ExprKind::This)
    }

    pub fn block(exprs: Vec<Expr>) -> Expr {
        Expr::new(1, ExprKind::Block(exprs))
    }

    pub fn if_(condition: Expr, then_branch: Expr, else_branch: Option<Expr>) -> Expr {
        Expr::new(
            1,
            ExprKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: else_branch.map(Box::new),
            },
        )
    }

    pub fn while_(condition: Expr, body: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::While {
                condition: Box::new(condition),
                body: Box::new(body),
            },
        )
    }

    pub fn function(params: Vec<&str>, body: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::Function {
                name: None,
                params: params.into_iter().map(String::from).collect(),
                body: Box::new(body),
            },
        )
    }

    pub fn get(object: Expr, key: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::Get {
                object: Box::new(object),
                key: Box::new(key),
            },
        )
    }

    pub fn set_index(object: Expr, key: Expr, value: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::SetIndex {
                object: Box::new(object),
                key: Box::new(key),
                value: Box::new(value),
            },
        )
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Expr {
        Expr::new(
            1,
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
        )
    }

    pub fn invoke(object: Expr, method: &str, args: Vec<Expr>) -> Expr {
        Expr::new(
            1,
            ExprKind::Invoke {
                object: Box::new(object),
                method: Box::new(Expr::str(method)),
                args,
            },
        )
    }

    pub fn assign(name: impl Into<String>, value: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::Assign {
                global: false,
                declare: false,
                name: name.into(),
                value: Box::new(value),
            },
        )
    }

    pub fn declare(name: impl Into<String>, value: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::Assign {
                global: false,
                declare: true,
                name: name.into(),
                value: Box::new(value),
            },
        )
    }

    pub fn assign_global(name: impl Into<String>, value: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::Assign {
                global: true,
                declare: false,
                name: name.into(),
                value: Box::new(value),
            },
        )
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        )
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        )
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::Logical {
                and: true,
                left: Box::new(left),
                right: Box::new(right),
            },
        )
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        Expr::new(
            1,
            ExprKind::Logical {
                and: false,
                left: Box::new(left),
                right: Box::new(right),
            },
        )
    }

    pub fn list(items: Vec<Expr>) -> Expr {
        Expr::new(1, ExprKind::ListLiteral(items))
    }

    pub fn table_literal(entries: Vec<(Expr, Expr)>) -> Expr {
        Expr::new(1, ExprKind::TableLiteral(entries))
    }
}
