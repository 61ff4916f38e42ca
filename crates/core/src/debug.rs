//! Chunk disassembler.
//!
//! Renders a chunk one instruction per line: byte offset, source line
//! (`|` when unchanged), opcode, operands, and constant values. Used by
//! compiler tests and by `trace!`-level diagnostics in the VM.

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Append one rendered instruction to `out`; returns the next offset.
pub fn disassemble_instruction(
    heap: &Heap,
    chunk: &Chunk,
    offset: usize,
    out: &mut String,
) -> usize {
    out.push_str(&format!("{:04} ", offset));
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let op = match OpCode::try_from(chunk.code[offset]) {
        Ok(op) => op,
        Err(byte) => {
            out.push_str(&format!("unknown opcode {}\n", byte));
            return offset + 1;
        }
    };

    use OpCode::*;
    match op {
        Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty | GetSuper
        | Class | Method => constant_instruction(heap, chunk, op, offset, out),
        Int | List | Dict | GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => {
            byte_instruction(chunk, op, offset, out)
        }
        Jump | JumpIfFalse | NextJump => jump_instruction(chunk, op, 1, offset, out),
        Loop => jump_instruction(chunk, op, -1, offset, out),
        Invoke | SuperInvoke => invoke_instruction(heap, chunk, op, offset, out),
        Closure => closure_instruction(heap, chunk, offset, out),
        _ => {
            out.push_str(&format!("{:?}\n", op));
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
    let rendered = heap.format_value(chunk.constants[index as usize]);
    out.push_str(&format!("{:<16} {:4} '{}'\n", format!("{:?}", op), index, rendered));
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let operand = chunk.code[offset + 1];
    out.push_str(&format!("{:<16} {:4}\n", format!("{:?}", op), operand));
    offset + 2
}

fn jump_instruction(
    chunk: &Chunk,
    op: OpCode,
    sign: i64,
    offset: usize,
    out: &mut String,
) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
    let target = offset as i64 + 3 + sign * i64::from(jump);
    out.push_str(&format!("{:<16} {:4} -> {}\n", format!("{:?}", op), offset, target));
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
    let rendered = heap.format_value(chunk.constants[index as usize]);
    out.push_str(&format!(
        "{:<16} ({} args) {:4} '{}'\n",
        format!("{:?}", op),
        argc,
        index,
        rendered
    ));
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let mut offset = offset + 1;
    let index = chunk.code[offset];
    offset += 1;
    let rendered = heap.format_value(chunk.constants[index as usize]);
    out.push_str(&format!("{:<16} {:4} {}\n", "Closure", index, rendered));

    // The function's upvalue descriptors follow inline, two bytes each.
    let upvalue_count = match chunk.constants[index as usize].as_object() {
        Some(handle) => match heap.get(handle) {
            crate::object::Obj::Function(f) => f.upvalue_count,
            _ => 0,
        },
        None => 0,
    };
    for _ in 0..upvalue_count {
        let is_local = chunk.code[offset] != 0;
        let slot = chunk.code[offset + 1];
        out.push_str(&format!(
            "{:04}    |                     {} {}\n",
            offset,
            if is_local { "local" } else { "upvalue" },
            slot
        ));
        offset += 2;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_disassemble_constant_and_simple_ops() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        let index = chunk.add_constant(Value::number(1.5)).unwrap();
        chunk.write_op(OpCode::Constant, 1);
        chunk.write(index, 1);
        chunk.write_op(OpCode::Negate, 1);
        chunk.write_op(OpCode::Return, 2);

        let text = disassemble_chunk(&heap, &chunk, "test");
        assert!(text.contains("== test =="));
        assert!(text.contains("Constant"));
        assert!(text.contains("'1.5'"));
        assert!(text.contains("Negate"));
        assert!(text.contains("Return"));
    }

    #[test]
    fn test_disassemble_jump_targets() {
        let heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Jump, 1);
        chunk.write(0, 1);
        chunk.write(2, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);

        let mut out = String::new();
        let next = disassemble_instruction(&heap, &chunk, 0, &mut out);
        assert_eq!(next, 3);
        assert!(out.contains("-> 5"));
    }
}
