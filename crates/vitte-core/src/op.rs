//! op.rs — the normative opcode set. Each variant is a single byte tag;
//! operands (constant indices, jump offsets, argument counts, upvalue
//! descriptors...) are *not* part of the enum — they are the raw bytes
//! that immediately follow the opcode in [`crate::chunk::Chunk::code`],
//! decoded by the VM's dispatch loop.
//!
//! Compat note: this is bytecode, not an AST — don't reorder existing
//! variants once programs have been compiled against them. New opcodes
//! go at the bottom.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Op {
    // ----- Constants & literals -----
    Constant,
    Constant16,
    Nil,
    True,
    False,

    // ----- Stack -----
    Pop,
    Dup,

    // ----- Locals -----
    GetLocal,
    SetLocal,

    // ----- Upvalues -----
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,

    // ----- Globals -----
    DefineGlobal,
    DefineGlobal16,
    GetGlobal,
    GetGlobal16,
    SetGlobal,
    SetGlobal16,

    // ----- Arithmetic / comparison -----
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Equal,
    Greater,
    Less,
    Not,

    // ----- I/O -----
    Print,

    // ----- Control flow -----
    Jump,
    JumpIfFalse,
    Loop,

    // ----- Calls -----
    Call,
    Invoke,
    SuperInvoke,

    // ----- Functions & closures -----
    Closure,

    // ----- Classes -----
    Class,
    Inherit,
    Method,
    GetProperty,
    SetProperty,
    GetSuper,

    // ----- Arrays -----
    Array,
    GetIndex,
    SetIndex,

    // ----- Return -----
    Return,
}

impl Op {
    /// Mnemonic used by the disassembler.
    pub fn mnemonic(self) -> &'static str {
        use Op::*;
        match self {
            Constant => "OP_CONSTANT",
            Constant16 => "OP_CONSTANT_16",
            Nil => "OP_NIL",
            True => "OP_TRUE",
            False => "OP_FALSE",
            Pop => "OP_POP",
            Dup => "OP_DUP",
            GetLocal => "OP_GET_LOCAL",
            SetLocal => "OP_SET_LOCAL",
            GetUpvalue => "OP_GET_UPVALUE",
            SetUpvalue => "OP_SET_UPVALUE",
            CloseUpvalue => "OP_CLOSE_UPVALUE",
            DefineGlobal => "OP_DEFINE_GLOBAL",
            DefineGlobal16 => "OP_DEFINE_GLOBAL_16",
            GetGlobal => "OP_GET_GLOBAL",
            GetGlobal16 => "OP_GET_GLOBAL_16",
            SetGlobal => "OP_SET_GLOBAL",
            SetGlobal16 => "OP_SET_GLOBAL_16",
            Add => "OP_ADD",
            Subtract => "OP_SUBTRACT",
            Multiply => "OP_MULTIPLY",
            Divide => "OP_DIVIDE",
            Negate => "OP_NEGATE",
            Equal => "OP_EQUAL",
            Greater => "OP_GREATER",
            Less => "OP_LESS",
            Not => "OP_NOT",
            Print => "OP_PRINT",
            Jump => "OP_JUMP",
            JumpIfFalse => "OP_JUMP_IF_FALSE",
            Loop => "OP_LOOP",
            Call => "OP_CALL",
            Invoke => "OP_INVOKE",
            SuperInvoke => "OP_SUPER_INVOKE",
            Closure => "OP_CLOSURE",
            Class => "OP_CLASS",
            Inherit => "OP_INHERIT",
            Method => "OP_METHOD",
            GetProperty => "OP_GET_PROPERTY",
            SetProperty => "OP_SET_PROPERTY",
            GetSuper => "OP_GET_SUPER",
            Array => "OP_ARRAY",
            GetIndex => "OP_GET_INDEX",
            SetIndex => "OP_SET_INDEX",
            Return => "OP_RETURN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_roundtrip() {
        for b in 0..=Op::Return.into() {
            if let Ok(op) = Op::try_from(b) {
                let back: u8 = op.into();
                assert_eq!(back, b);
            }
        }
    }

    #[test]
    fn unknown_byte_fails() {
        assert!(Op::try_from(255u8).is_err());
    }
}
