//! disasm.rs — human-readable disassembly, used by `--debug-print-code`
//! and by the VM's `--debug-trace-execution` single-step trace. Mirrors
//! clox's `debug.c`: one line per instruction, byte offset, source line
//! (blank when it repeats the previous instruction's line), mnemonic,
//! and whatever operand preview makes sense for that opcode.
//!
//! Takes a [`Heap`] alongside the chunk: constant previews need it to
//! render interned strings, and walking past an `OP_CLOSURE`'s trailing
//! upvalue descriptors needs it to know how many pairs the referenced
//! function actually captured (that count isn't recoverable from the
//! chunk's bytes alone).

use std::fmt::Write as _;

use crate::chunk::Chunk;
use crate::object::{Heap, Obj};
use crate::op::Op;
use crate::value::Value;

/// Disassembles every instruction in `chunk`, prefixed with a `== title ==`
/// header, clox-style.
pub fn disassemble_chunk(chunk: &Chunk, title: &str, heap: &Heap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {title} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, offset, heap);
        let _ = writeln!(out, "{line}");
        offset = next;
    }
    out
}

/// Disassembles the single instruction starting at `offset`, returning
/// the rendered line and the offset of the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> (String, usize) {
    let mut line = format!("{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        line.push_str("   | ");
    } else {
        let _ = write!(line, "{:4} ", chunk.line_at(offset));
    }

    let Ok(op) = Op::try_from(chunk.code[offset]) else {
        let _ = write!(line, "Unknown opcode {}", chunk.code[offset]);
        return (line, offset + 1);
    };

    let next = match op {
        Op::Nil
        | Op::True
        | Op::False
        | Op::Pop
        | Op::Dup
        | Op::CloseUpvalue
        | Op::Add
        | Op::Subtract
        | Op::Multiply
        | Op::Divide
        | Op::Negate
        | Op::Equal
        | Op::Greater
        | Op::Less
        | Op::Not
        | Op::Print
        | Op::Inherit
        | Op::GetIndex
        | Op::SetIndex
        | Op::Return => simple(&mut line, op, offset),

        Op::GetLocal | Op::SetLocal | Op::GetUpvalue | Op::SetUpvalue | Op::Call | Op::Array => {
            byte_operand(&mut line, op, chunk, offset)
        }

        Op::Constant | Op::DefineGlobal | Op::GetGlobal | Op::SetGlobal => {
            constant_operand(&mut line, op, chunk, offset, 1, heap)
        }
        Op::Constant16 | Op::DefineGlobal16 | Op::GetGlobal16 | Op::SetGlobal16 => {
            constant_operand(&mut line, op, chunk, offset, 2, heap)
        }

        Op::Class | Op::Method | Op::GetProperty | Op::SetProperty | Op::GetSuper => {
            name_operand(&mut line, op, chunk, offset, heap)
        }

        Op::Jump | Op::JumpIfFalse => jump_operand(&mut line, op, chunk, offset, 1),
        Op::Loop => jump_operand(&mut line, op, chunk, offset, -1),

        Op::Invoke | Op::SuperInvoke => invoke_operand(&mut line, op, chunk, offset, heap),

        Op::Closure => closure_operand(&mut line, chunk, offset, heap),
    };

    (line, next)
}

fn simple(line: &mut String, op: Op, offset: usize) -> usize {
    line.push_str(op.mnemonic());
    offset + 1
}

fn byte_operand(line: &mut String, op: Op, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = write!(line, "{:<16} {slot:4}", op.mnemonic());
    offset + 2
}

fn constant_operand(line: &mut String, op: Op, chunk: &Chunk, offset: usize, width: usize, heap: &Heap) -> usize {
    let idx = if width == 1 { chunk.code[offset + 1] as usize } else { chunk.read_u16(offset + 1) as usize };
    let preview = chunk.constants.get(idx).map(|v| preview_value(v, heap)).unwrap_or_else(|| "<invalid>".into());
    let _ = write!(line, "{:<16} {idx:4} ; {preview}", op.mnemonic());
    offset + 1 + width
}

fn name_operand(line: &mut String, op: Op, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let preview = chunk.constants.get(idx).map(|v| preview_value(v, heap)).unwrap_or_else(|| "<invalid>".into());
    let _ = write!(line, "{:<16} {idx:4} ; {preview}", op.mnemonic());
    offset + 2
}

fn jump_operand(line: &mut String, op: Op, chunk: &Chunk, offset: usize, sign: i64) -> usize {
    let jump = chunk.read_u16(offset + 1) as i64;
    let dest = offset as i64 + 3 + sign * jump;
    let _ = write!(line, "{:<16} {offset:4} -> {dest}", op.mnemonic());
    offset + 3
}

fn invoke_operand(line: &mut String, op: Op, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    let preview = chunk.constants.get(idx).map(|v| preview_value(v, heap)).unwrap_or_else(|| "<invalid>".into());
    let _ = write!(line, "{:<16} ({argc} args) {idx:4} ; {preview}", op.mnemonic());
    offset + 3
}

fn closure_operand(line: &mut String, chunk: &Chunk, offset: usize, heap: &Heap) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let preview = chunk.constants.get(idx).map(|v| preview_value(v, heap)).unwrap_or_else(|| "<invalid>".into());
    let _ = write!(line, "{:<16} {idx:4} ; {preview}", Op::Closure.mnemonic());

    let upvalue_count = match chunk.constants.get(idx) {
        Some(Value::Obj(r)) => match heap.get(*r) {
            Obj::Function(f) => f.upvalue_count as usize,
            _ => 0,
        },
        _ => 0,
    };

    let mut next = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[next] != 0;
        let index = chunk.code[next + 1];
        let kind = if is_local { "local" } else { "upvalue" };
        let _ = write!(line, "\n{next:04}      |                     {kind} {index}");
        next += 2;
    }
    next
}

fn preview_value(v: &Value, heap: &Heap) -> String {
    match v {
        Value::Nil => "nil".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Obj(r) => match heap.get(*r) {
            Obj::Str(_) => format!("\"{}\"", heap.as_str(*r)),
            Obj::Function(f) => {
                let name = f.name.map(|n| heap.as_str(n)).unwrap_or("<script>");
                format!("<fn {name}>")
            }
            other => format!("<{}>", other.type_name()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Heap;

    #[test]
    fn disassembles_a_constant_load() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.0));
        chunk.write_u8(Op::Constant.into(), 1);
        chunk.write_u8(idx as u8, 1);
        chunk.write_u8(Op::Return.into(), 1);

        let out = disassemble_chunk(&chunk, "test", &heap);
        assert!(out.contains("OP_CONSTANT"));
        assert!(out.contains("OP_RETURN"));
    }

    #[test]
    fn repeated_line_numbers_collapse_to_a_pipe() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_u8(Op::Nil.into(), 5);
        chunk.write_u8(Op::Pop.into(), 5);
        let out = disassemble_chunk(&chunk, "test", &heap);
        assert!(out.contains("   | "));
    }

    #[test]
    fn jump_preview_shows_destination() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_u8(Op::Jump.into(), 1);
        chunk.write_u16(2, 1);
        chunk.write_u8(Op::Nil.into(), 1);
        let (text, next) = disassemble_instruction(&chunk, 0, &heap);
        assert!(text.contains("-> 5"));
        assert_eq!(next, 3);
    }

    #[test]
    fn name_operand_resolves_interned_string() {
        let mut heap = Heap::new();
        let name = heap.intern_str("foo");
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Obj(name));
        chunk.write_u8(Op::Class.into(), 1);
        chunk.write_u8(idx as u8, 1);
        let (text, _) = disassemble_instruction(&chunk, 0, &heap);
        assert!(text.contains("OP_CLASS"));
        assert!(text.contains("\"foo\""));
    }
}
