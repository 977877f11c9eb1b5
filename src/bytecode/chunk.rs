use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// An entry in a chunk's constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Num(f64),
    Bool(bool),
    Str(Rc<str>),
    /// A nested compiled function, consumed by a following CLOSURE.
    Fn(Rc<Function>),
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Num(n) => write!(f, "{}", n),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Str(s) => write!(f, "'{}'", s),
            Constant::Fn(func) => write!(f, "fn {}", func.name),
        }
    }
}

/// An immutable compiled instruction stream plus its constant pool.
/// Produced once per compiled function by [`Builder`] and never mutated
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub constants: Vec<Constant>,
    pub code: Vec<u8>,
}

/// A compiled function: its chunk plus the metadata the VM needs to call
/// it and to report errors against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub chunk: Chunk,
    pub param_count: usize,
    pub num_upvalues: usize,
    /// Source line the function starts on.
    pub start_line: u32,
    /// Entry `n` is the byte offset of the first instruction at source
    /// line greater than `n`. Diagnostics only.
    pub line_starts: Vec<u32>,
}

impl Function {
    /// Approximate source line for a byte offset, from the line table.
    pub fn line_for(&self, offset: usize) -> u32 {
        let mut line = 1u32;
        while (line as usize) < self.line_starts.len()
            && self.line_starts[line as usize] as usize <= offset
        {
            line += 1;
        }
        line
    }
}

impl std::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({} params)", self.name, self.param_count)
    }
}

/// Accumulates constants and instruction bytes for one function being
/// compiled, then freezes them into a [`Chunk`]. Supports back-patching of
/// previously emitted operand bytes for forward jumps.
pub struct Builder {
    constants: Vec<Constant>,
    code: Vec<u8>,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            constants: Vec::new(),
            code: Vec::with_capacity(64),
        }
    }

    /// Byte offset the next write will land at.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn write_u8(&mut self, b: u8) {
        self.code.push(b);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    pub fn patch_u16_at(&mut self, offset: usize, v: u16) {
        let [hi, lo] = v.to_be_bytes();
        self.code[offset] = hi;
        self.code[offset + 1] = lo;
    }

    /// Adds a constant if not already present and returns its pool index.
    pub fn register_constant(&mut self, value: Constant) -> usize {
        if let Some(i) = self.constants.iter().position(|c| *c == value) {
            return i;
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn num_constants(&self) -> usize {
        self.constants.len()
    }

    pub fn build(self) -> Chunk {
        Chunk {
            constants: self.constants,
            code: self.code,
        }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_build() {
        let mut b = Builder::new();
        b.write_u8(7);
        b.write_u16(0x0102);
        let chunk = b.build();
        assert_eq!(chunk.code, vec![7, 1, 2]);
    }

    #[test]
    fn test_patching() {
        let mut b = Builder::new();
        b.write_u8(0);
        let at = b.position();
        b.write_u16(0xFFFF);
        b.write_u8(9);
        b.patch_u16_at(at, 0x1234);
        assert_eq!(b.build().code, vec![0, 0x12, 0x34, 9]);
    }

    #[test]
    fn test_constant_dedup() {
        let mut b = Builder::new();
        let a = b.register_constant(Constant::Num(1.0));
        let s = b.register_constant(Constant::Str("x".into()));
        let a2 = b.register_constant(Constant::Num(1.0));
        assert_eq!(a, a2);
        assert_ne!(a, s);
        assert_eq!(b.num_constants(), 2);
    }

    #[test]
    fn test_line_for() {
        let f = Function {
            name: "f".into(),
            chunk: Chunk {
                constants: vec![],
                code: vec![0; 10],
            },
            param_count: 0,
            num_upvalues: 0,
            start_line: 1,
            // line 1 starts at offset 0, line 2 at 4, line 3 at 8
            line_starts: vec![0, 4, 8],
        };
        assert_eq!(f.line_for(0), 1);
        assert_eq!(f.line_for(3), 1);
        assert_eq!(f.line_for(4), 2);
        assert_eq!(f.line_for(9), 3);
    }
}
