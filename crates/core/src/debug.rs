//! Bytecode disassembler.
//!
//! Renders a chunk (or a single instruction) as a listing: byte offset,
//! source line (`|` when unchanged from the previous instruction), opcode
//! name, operands, and resolved constant values. Used by the compiler's
//! dump-code option and the VM's execution tracer.

use std::fmt::Write;

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::value::print_value;

/// Disassemble a whole chunk under a header.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Disassemble the instruction at `offset`, appending one or more lines to
/// `out`. Returns the offset of the next instruction.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        let _ = writeln!(out, "Unknown opcode {}", chunk.code[offset]);
        return offset + 1;
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method => constant_instruction(heap, chunk, op, offset, out),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(chunk, op, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op, 1, offset, out),
        OpCode::Loop => jump_instruction(chunk, op, -1, offset, out),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(heap, chunk, op, offset, out),
        OpCode::Closure => closure_instruction(heap, chunk, offset, out),
        _ => {
            let _ = writeln!(out, "{op:?}");
            offset + 1
        }
    }
}

fn constant_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut String,
) -> usize {
    let index = chunk.code[offset + 1];
    let value = chunk.constants[index as usize];
    let _ = writeln!(
        out,
        "{:<16} {:4} '{}'",
        format!("{op:?}"),
        index,
        print_value(heap, value)
    );
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<16} {:4}", format!("{op:?}"), slot);
    offset + 2
}

fn jump_instruction(chunk: &Chunk, op: OpCode, sign: i64, offset: usize, out: &mut String) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
    let target = offset as i64 + 3 + sign * i64::from(jump);
    let _ = writeln!(out, "{:<16} {:4} -> {}", format!("{op:?}"), offset, target);
    offset + 3
}

fn invoke_instruction(
    heap: &Heap,
    chunk: &Chunk,
    op: OpCode,
    offset: usize,
    out: &mut String,
) -> usize {
    let index = chunk.code[offset + 1];
    let argc = chunk.code[offset + 2];
    let value = chunk.constants[index as usize];
    let _ = writeln!(
        out,
        "{:<16} ({argc} args) {:4} '{}'",
        format!("{op:?}"),
        index,
        print_value(heap, value)
    );
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let mut offset = offset + 1;
    let index = chunk.code[offset];
    offset += 1;
    let value = chunk.constants[index as usize];
    let _ = writeln!(
        out,
        "{:<16} {:4} {}",
        "Closure",
        index,
        print_value(heap, value)
    );

    // One (is_local, index) byte pair per captured upvalue.
    let function = match value {
        crate::value::Value::Obj(r) => r,
        _ => return offset,
    };
    for _ in 0..heap.function(function).upvalue_count {
        let is_local = chunk.code[offset] != 0;
        let capture = chunk.code[offset + 1];
        let _ = writeln!(
            out,
            "{:04}      |                     {} {}",
            offset,
            if is_local { "local" } else { "upvalue" },
            capture
        );
        offset += 2;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_simple_chunk_listing() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::Number(1.2));
        chunk.write_op(OpCode::Constant, 123);
        chunk.write(index as u8, 123);
        chunk.write_op(OpCode::Return, 123);

        let listing = disassemble_chunk(&heap, &chunk, "test");
        assert!(listing.starts_with("== test ==\n"));
        assert!(listing.contains("Constant"));
        assert!(listing.contains("'1.2'"));
        assert!(listing.contains("Return"));
        // Second instruction on the same line shows the repeat marker.
        assert!(listing.contains("   | "));
    }

    #[test]
    fn test_jump_targets_are_resolved() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0x00, 1);
        chunk.write(0x02, 1);
        let mut out = String::new();
        let next = disassemble_instruction(&heap, &chunk, 0, &mut out);
        assert_eq!(next, 3);
        assert!(out.contains("Jump"));
        assert!(out.contains("-> 5"));
    }
}
