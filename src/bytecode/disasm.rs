use std::fmt::Write;
use std::rc::Rc;

use crate::bytecode::chunk::{Constant, Function};
use crate::bytecode::op;

// =============================================================================
// Disassembler
// =============================================================================
//
// Human-readable dump of a compiled function, one instruction per line:
//
//     offset  OPCODE          operand  ; resolved
//
// Nested function constants are dumped after their parent, indented.

/// Renders `function` and every function constant it contains.
pub fn disassemble(function: &Function) -> String {
    let mut out = String::new();
    dump(function, 0, &mut out);
    out
}

fn dump(function: &Function, depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    let _ = writeln!(
        out,
        "{}=== fn {} ({} params, {} upvalues) ===",
        pad, function.name, function.param_count, function.num_upvalues
    );

    let code = &function.chunk.code;
    let constants = &function.chunk.constants;
    let mut offset = 0usize;
    // the function constant most recently pushed, so CLOSURE knows how
    // many capture pairs follow it
    let mut pending_fn: Option<Rc<Function>> = None;

    while offset < code.len() {
        let at = offset;
        let opcode = code[offset];
        offset += 1;
        let name = op::name(opcode);

        match opcode {
            op::CONSTANT | op::WIDE_CONSTANT => {
                let (index, next) = read_index(code, offset, opcode == op::WIDE_CONSTANT);
                offset = next;
                match constants.get(index) {
                    Some(c) => {
                        let _ = writeln!(out, "{}{:04}  {:<16}{:<5}; {}", pad, at, name, index, c);
                        if let Constant::Fn(f) = c {
                            pending_fn = Some(f.clone());
                        }
                    }
                    None => {
                        let _ =
                            writeln!(out, "{}{:04}  {:<16}{:<5}; <bad index>", pad, at, name, index);
                    }
                }
                continue;
            }

            op::SET_GLOBAL | op::LOAD_GLOBAL | op::WIDE_SET_GLOBAL | op::WIDE_LOAD_GLOBAL => {
                let wide = opcode == op::WIDE_SET_GLOBAL || opcode == op::WIDE_LOAD_GLOBAL;
                let (index, next) = read_index(code, offset, wide);
                offset = next;
                match constants.get(index) {
                    Some(c) => {
                        let _ = writeln!(out, "{}{:04}  {:<16}{:<5}; {}", pad, at, name, index, c);
                    }
                    None => {
                        let _ =
                            writeln!(out, "{}{:04}  {:<16}{:<5}; <bad index>", pad, at, name, index);
                    }
                }
            }

            op::SET_LOCAL
            | op::LOAD_LOCAL
            | op::SET_UPVALUE
            | op::LOAD_UPVALUE
            | op::WIDE_SET_LOCAL
            | op::WIDE_LOAD_LOCAL
            | op::WIDE_SET_UPVALUE
            | op::WIDE_LOAD_UPVALUE => {
                let wide = opcode >= op::WIDE_CONSTANT;
                let (index, next) = read_index(code, offset, wide);
                offset = next;
                let _ = writeln!(out, "{}{:04}  {:<16}{}", pad, at, name, index);
            }

            op::JUMP | op::JUMP_IF_FALSE | op::JUMP_IF_TRUE => {
                let displacement =
                    i16::from_be_bytes([code[offset], code[offset + 1]]) as i64;
                offset += 2;
                let target = offset as i64 + displacement;
                let _ = writeln!(
                    out,
                    "{}{:04}  {:<16}{:<5}; -> {:04}",
                    pad, at, name, displacement, target
                );
            }

            op::CALL | op::INVOKE => {
                let argc = code[offset];
                offset += 1;
                let _ = writeln!(out, "{}{:04}  {:<16}{} args", pad, at, name, argc);
            }

            op::CLOSURE | op::WIDE_CLOSURE => {
                let wide = opcode == op::WIDE_CLOSURE;
                let count = pending_fn
                    .as_ref()
                    .map(|f| f.num_upvalues)
                    .unwrap_or(0);
                let _ = writeln!(out, "{}{:04}  {:<16}{} captures", pad, at, name, count);
                for _ in 0..count {
                    let is_local = code[offset] == 1;
                    offset += 1;
                    let (index, next) = read_index(code, offset, wide);
                    offset = next;
                    let _ = writeln!(
                        out,
                        "{}      | {} {}",
                        pad,
                        if is_local { "local" } else { "upvalue" },
                        index
                    );
                }
                pending_fn = None;
            }

            _ => {
                let _ = writeln!(out, "{}{:04}  {}", pad, at, name);
            }
        }
    }

    for constant in constants {
        if let Constant::Fn(f) = constant {
            dump(f, depth + 1, out);
        }
    }
}

fn read_index(code: &[u8], offset: usize, wide: bool) -> (usize, usize) {
    if wide {
        (
            u16::from_be_bytes([code[offset], code[offset + 1]]) as usize,
            offset + 2,
        )
    } else {
        (code[offset] as usize, offset + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::Compiler;
    use crate::lang::ast::{BinaryOp, Expr};

    #[test]
    fn test_disassembles_arithmetic() {
        let tree = Expr::binary(BinaryOp::Add, Expr::num(1.0), Expr::num(2.0));
        let f = Compiler::compile("main", &tree).unwrap();
        let text = disassemble(&f);
        assert!(text.contains("=== fn main"));
        assert!(text.contains("CONSTANT"));
        assert!(text.contains("ADD"));
        assert!(text.contains("RETURN"));
    }

    #[test]
    fn test_jump_targets_resolved() {
        let tree = Expr::if_(Expr::bool(true), Expr::num(1.0), Some(Expr::num(2.0)));
        let f = Compiler::compile("main", &tree).unwrap();
        let text = disassemble(&f);
        // JUMP_IF_FALSE at 2 with displacement 6 lands at 11
        assert!(text.contains("JUMP_IF_FALSE"));
        assert!(text.contains("-> 0011"));
    }

    #[test]
    fn test_nested_function_dumped() {
        let tree = Expr::function(vec!["n"], Expr::name("n"));
        let f = Compiler::compile("main", &tree).unwrap();
        let text = disassemble(&f);
        assert!(text.contains("=== fn fn (1 params"));
        assert!(text.contains("CLOSURE"));
    }

    #[test]
    fn test_closure_captures_listed() {
        let tree = Expr::block(vec![Expr::assign(
            "x",
            Expr::num(1.0),
        ), Expr::function(vec![], Expr::name("x"))]);
        let f = Compiler::compile("main", &tree).unwrap();
        let text = disassemble(&f);
        assert!(text.contains("1 captures"));
        assert!(text.contains("| local 1"));
    }
}
