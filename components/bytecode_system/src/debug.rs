//! Chunk disassembler.
//!
//! Renders a chunk's packed byte stream one instruction per line. Heap
//! constants print as their handle; the CLI's `--print-bytecode` flag and
//! compiler tests are the consumers.

use crate::chunk::Chunk;
use crate::opcode::OpCode;
use std::fmt::Write;

/// Disassemble an entire chunk under a header name.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);

    let mut offset = 0;
    while offset < chunk.len() {
        offset = disassemble_instruction(chunk, offset, &mut out);
    }

    out
}

/// Disassemble the instruction at `offset`, returning the next offset.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line_at(offset));
    }

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        let _ = writeln!(out, "unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::GetPropertyNoPop
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Subclass
        | OpCode::Method
        | OpCode::Trait
        | OpCode::TraitMethod => constant_instruction(chunk, op, offset, out),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::CloseFile => byte_instruction(chunk, op, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Break => {
            jump_instruction(chunk, op, 1, offset, out)
        }
        OpCode::Loop => jump_instruction(chunk, op, -1, offset, out),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(chunk, op, offset, out),
        OpCode::Closure => closure_instruction(chunk, offset, out),
        _ => {
            let _ = writeln!(out, "{:?}", op);
            offset + 1
        }
    }
}

fn constant_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let _ = writeln!(out, "{:?} {} '{}'", op, idx, chunk.constants[idx]);
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{:?} {}", op, chunk.code[offset + 1]);
    offset + 2
}

fn jump_instruction(chunk: &Chunk, op: OpCode, sign: i32, offset: usize, out: &mut String) -> usize {
    let jump = i32::from(chunk.read_u16(offset + 1));
    let target = offset as i32 + 3 + sign * jump;
    let _ = writeln!(out, "{:?} {} -> {}", op, offset, target);
    offset + 3
}

fn invoke_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let arg_count = chunk.code[offset + 1];
    let name_idx = chunk.code[offset + 2] as usize;
    let _ = writeln!(
        out,
        "{:?} ({} args) '{}'",
        op, arg_count, chunk.constants[name_idx]
    );
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let upvalue_count = chunk.code[offset + 2] as usize;
    let _ = writeln!(out, "Closure {} '{}'", idx, chunk.constants[idx]);

    let mut cursor = offset + 3;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor] == 1;
        let index = chunk.code[cursor + 1];
        let _ = writeln!(
            out,
            "{:04}    |   {} {}",
            cursor,
            if is_local { "local" } else { "upvalue" },
            index
        );
        cursor += 2;
    }

    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Value;

    #[test]
    fn test_disassemble_simple_chunk() {
        let mut chunk = Chunk::new();
        let idx = chunk.add_constant(Value::Number(1.2));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(idx as u8, 1);
        chunk.write_op(OpCode::Return, 1);

        let text = disassemble_chunk(&chunk, "test");
        assert!(text.contains("== test =="));
        assert!(text.contains("Constant 0 '1.2'"));
        assert!(text.contains("Return"));
    }

    #[test]
    fn test_disassemble_jump_targets() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0, 1);
        chunk.write(2, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);

        let text = disassemble_chunk(&chunk, "jumps");
        assert!(text.contains("Jump 0 -> 5"));
    }
}
