// =============================================================================
// Opcode catalog
// =============================================================================
//
// One byte per opcode, operands big-endian. Every opcode that carries an
// index into the constant pool, the local slots or the upvalue array has
// two encodings: the narrow form with a u8 operand and a WIDE_* form with
// a u16 operand, chosen by the chunk builder when the index does not fit
// in a byte. Jump operands are always signed 16-bit displacements relative
// to the instruction pointer after the operand has been read.

/// Push a constant. Operand: constant index.
pub const CONSTANT: u8 = 0;
pub const PUSH_NULL: u8 = 1;
/// Pop the top of the stack.
pub const POP: u8 = 2;
/// Remove the element just below the top, keeping the top. Used at scope
/// exit, where the block result sits above the dying local slot.
pub const POP_UNDER: u8 = 3;

// arithmetic
pub const ADD: u8 = 4;
pub const SUB: u8 = 5;
pub const MUL: u8 = 6;
pub const DIV: u8 = 7;
pub const MOD: u8 = 8;
pub const NEGATE: u8 = 9;
pub const NOT: u8 = 10;

// comparison
pub const EQ: u8 = 11;
pub const NEQ: u8 = 12;
pub const LT: u8 = 13;
pub const GT: u8 = 14;
pub const LTE: u8 = 15;
pub const GTE: u8 = 16;

// variables. Global opcodes take a constant index naming the global;
// local/upvalue opcodes take a slot index. The SET forms peek rather than
// pop, since assignment is an expression.
pub const SET_GLOBAL: u8 = 17;
pub const LOAD_GLOBAL: u8 = 18;
pub const SET_LOCAL: u8 = 19;
pub const LOAD_LOCAL: u8 = 20;
pub const SET_UPVALUE: u8 = 21;
pub const LOAD_UPVALUE: u8 = 22;

// control flow. Conditional jumps peek the condition; the compiler emits
// explicit POPs on each path.
pub const JUMP: u8 = 23;
pub const JUMP_IF_FALSE: u8 = 24;
pub const JUMP_IF_TRUE: u8 = 25;

// calls. Operand: argument count.
pub const CALL: u8 = 26;
/// Stack is `<receiver> <method name> <args...>`. Resolves the method on
/// the receiver's class and binds the receiver as the callee's slot 0.
pub const INVOKE: u8 = 27;

/// Pops a function constant and builds a closure over it. Followed by one
/// `(flag, index)` pair per upvalue: flag 1 captures the enclosing frame's
/// local at `index`, flag 0 forwards the enclosing closure's upvalue at
/// `index`.
pub const CLOSURE: u8 = 28;
/// Close upvalues referring to the local just below the top of the stack,
/// then remove that slot (keeping the block result on top).
pub const CLOSE_UPVALUE: u8 = 29;
pub const RETURN: u8 = 30;

// dynamic indexing
pub const GET: u8 = 31;
/// Stack is `<object> <key> <value>`; leaves the value (or the `__set`
/// result) on the stack.
pub const SET: u8 = 32;

// literal construction
pub const NEW_LIST: u8 = 33;
/// Pops a value and appends it to the list below.
pub const LIST_PUSH: u8 = 34;
pub const NEW_TABLE: u8 = 35;
/// Pops a value, then a key, and inserts into the table below.
pub const TABLE_SET: u8 = 36;

// wide forms: u16 operands
pub const WIDE_CONSTANT: u8 = 37;
pub const WIDE_SET_GLOBAL: u8 = 38;
pub const WIDE_LOAD_GLOBAL: u8 = 39;
pub const WIDE_SET_LOCAL: u8 = 40;
pub const WIDE_LOAD_LOCAL: u8 = 41;
pub const WIDE_SET_UPVALUE: u8 = 42;
pub const WIDE_LOAD_UPVALUE: u8 = 43;
/// Like CLOSURE, but each pair is `(flag, u16 index)`.
pub const WIDE_CLOSURE: u8 = 44;

/// Opcode name for disassembly.
pub fn name(op: u8) -> &'static str {
    match op {
        CONSTANT => "CONSTANT",
        PUSH_NULL => "PUSH_NULL",
        POP => "POP",
        POP_UNDER => "POP_UNDER",
        ADD => "ADD",
        SUB => "SUB",
        MUL => "MUL",
        DIV => "DIV",
        MOD => "MOD",
        NEGATE => "NEGATE",
        NOT => "NOT",
        EQ => "EQ",
        NEQ => "NEQ",
        LT => "LT",
        GT => "GT",
        LTE => "LTE",
        GTE => "GTE",
        SET_GLOBAL => "SET_GLOBAL",
        LOAD_GLOBAL => "LOAD_GLOBAL",
        SET_LOCAL => "SET_LOCAL",
        LOAD_LOCAL => "LOAD_LOCAL",
        SET_UPVALUE => "SET_UPVALUE",
        LOAD_UPVALUE => "LOAD_UPVALUE",
        JUMP => "JUMP",
        JUMP_IF_FALSE => "JUMP_IF_FALSE",
        JUMP_IF_TRUE => "JUMP_IF_TRUE",
        CALL => "CALL",
        INVOKE => "INVOKE",
        CLOSURE => "CLOSURE",
        CLOSE_UPVALUE => "CLOSE_UPVALUE",
        RETURN => "RETURN",
        GET => "GET",
        SET => "SET",
        NEW_LIST => "NEW_LIST",
        LIST_PUSH => "LIST_PUSH",
        NEW_TABLE => "NEW_TABLE",
        TABLE_SET => "TABLE_SET",
        WIDE_CONSTANT => "WIDE_CONSTANT",
        WIDE_SET_GLOBAL => "WIDE_SET_GLOBAL",
        WIDE_LOAD_GLOBAL => "WIDE_LOAD_GLOBAL",
        WIDE_SET_LOCAL => "WIDE_SET_LOCAL",
        WIDE_LOAD_LOCAL => "WIDE_LOAD_LOCAL",
        WIDE_SET_UPVALUE => "WIDE_SET_UPVALUE",
        WIDE_LOAD_UPVALUE => "WIDE_LOAD_UPVALUE",
        WIDE_CLOSURE => "WIDE_CLOSURE",
        _ => "UNKNOWN",
    }
}
