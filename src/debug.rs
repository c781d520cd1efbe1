use crate::vm::chunk::{op, read_uleb128, Chunk};
use crate::vm::heap::Heap;
use crate::vm::object::Obj;
use crate::vm::value::{number_to_string, ObjRef, Value};

// ---------------------------------------------------------------------------
// Disassembler
// ---------------------------------------------------------------------------

/// Print a function's chunk, then recurse into function constants so a
/// whole compiled script can be inspected with one call.
pub fn disassemble_function(heap: &Heap, function: ObjRef) {
    let name = match heap.function(function).name {
        Some(id) => heap.string(id.obj).chars.clone(),
        None => "<script>".to_string(),
    };
    let chunk = heap.function(function).chunk.clone();
    disassemble_chunk(heap, &chunk, &name);
    for &constant in &chunk.constants {
        if let Value::Obj(r) = constant {
            if matches!(heap.get(r), Obj::Function(_)) {
                println!();
                disassemble_function(heap, r);
            }
        }
    }
}

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) {
    println!("== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset);
    }
}

/// Print one instruction and return the offset of the next.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if chunk.lines.same_as_previous(offset) {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines.line(offset));
    }

    let instruction = chunk.code[offset];
    match instruction {
        op::CONSTANT
        | op::GET_GLOBAL
        | op::DEFINE_GLOBAL
        | op::SET_GLOBAL
        | op::GET_PROPERTY
        | op::SET_PROPERTY
        | op::SET_PROPERTY_KV
        | op::GET_SUPER
        | op::CLASS
        | op::METHOD
        | op::IMPORT
        | op::EXPORT => constant_instruction(heap, chunk, offset),
        op::GET_LOCAL | op::SET_LOCAL | op::GET_UPVALUE | op::SET_UPVALUE | op::CALL
        | op::LIST => byte_instruction(chunk, offset),
        op::JUMP | op::JUMP_IF_FALSE | op::JUMP_IF_FALSE_SC | op::TRY_BEGIN => {
            jump_instruction(chunk, offset, 1)
        }
        op::LOOP => jump_instruction(chunk, offset, -1),
        op::INVOKE | op::SUPER_INVOKE => invoke_instruction(heap, chunk, offset),
        op::CLOSURE => closure_instruction(heap, chunk, offset),
        _ => {
            println!("{}", op_name(instruction));
            offset + 1
        }
    }
}

fn constant_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let (index, length) = read_uleb128(&chunk.code, offset + 1);
    println!(
        "{:<16} {:4} '{}'",
        op_name(chunk.code[offset]),
        index,
        constant_text(heap, chunk.constants[index])
    );
    offset + 1 + length
}

fn byte_instruction(chunk: &Chunk, offset: usize) -> usize {
    println!(
        "{:<16} {:4}",
        op_name(chunk.code[offset]),
        chunk.code[offset + 1]
    );
    offset + 2
}

fn jump_instruction(chunk: &Chunk, offset: usize, sign: i64) -> usize {
    let jump = ((chunk.code[offset + 1] as usize) << 8) | chunk.code[offset + 2] as usize;
    let target = (offset as i64 + 3) + sign * jump as i64;
    println!(
        "{:<16} {:4} -> {}",
        op_name(chunk.code[offset]),
        offset,
        target
    );
    offset + 3
}

fn invoke_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let (index, length) = read_uleb128(&chunk.code, offset + 1);
    let arg_count = chunk.code[offset + 1 + length];
    println!(
        "{:<16} ({} args) {:4} '{}'",
        op_name(chunk.code[offset]),
        arg_count,
        index,
        constant_text(heap, chunk.constants[index])
    );
    offset + 2 + length
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let (index, length) = read_uleb128(&chunk.code, offset + 1);
    let function_value = chunk.constants[index];
    println!(
        "{:<16} {:4} {}",
        "CLOSURE",
        index,
        constant_text(heap, function_value)
    );

    let mut cursor = offset + 1 + length;
    let upvalue_count = heap.function(function_value.as_obj()).upvalue_count;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[cursor];
        let slot = chunk.code[cursor + 1];
        println!(
            "{:04}    |                     {} {}",
            cursor,
            if is_local != 0 { "local" } else { "upvalue" },
            slot
        );
        cursor += 2;
    }
    cursor
}

fn constant_text(heap: &Heap, value: Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => number_to_string(n),
        Value::Obj(r) => match heap.get(r) {
            Obj::String(s) => s.chars.clone(),
            Obj::Function(f) => match f.name {
                Some(id) => format!("<function {}>", heap.string(id.obj).chars),
                None => "<script>".to_string(),
            },
            _ => "<object>".to_string(),
        },
    }
}

fn op_name(instruction: u8) -> &'static str {
    match instruction {
        op::CONSTANT => "CONSTANT",
        op::NULL => "NULL",
        op::TRUE => "TRUE",
        op::FALSE => "FALSE",
        op::OBJECT => "OBJECT",
        op::LIST => "LIST",
        op::RANGE => "RANGE",
        op::POP => "POP",
        op::DUP => "DUP",
        op::DUP_X2 => "DUP_X2",
        op::SWAP => "SWAP",
        op::GET_GLOBAL => "GET_GLOBAL",
        op::DEFINE_GLOBAL => "DEFINE_GLOBAL",
        op::SET_GLOBAL => "SET_GLOBAL",
        op::GET_LOCAL => "GET_LOCAL",
        op::SET_LOCAL => "SET_LOCAL",
        op::GET_UPVALUE => "GET_UPVALUE",
        op::SET_UPVALUE => "SET_UPVALUE",
        op::CLOSE_UPVALUE => "CLOSE_UPVALUE",
        op::GET_PROPERTY => "GET_PROPERTY",
        op::SET_PROPERTY => "SET_PROPERTY",
        op::SET_PROPERTY_KV => "SET_PROPERTY_KV",
        op::GET_INDEX => "GET_INDEX",
        op::SET_INDEX => "SET_INDEX",
        op::GET_SUPER => "GET_SUPER",
        op::NEGATE => "NEGATE",
        op::NOT => "NOT",
        op::BIT_NOT => "BIT_NOT",
        op::ADD => "ADD",
        op::SUB => "SUB",
        op::MUL => "MUL",
        op::DIV => "DIV",
        op::MOD => "MOD",
        op::BIT_AND => "BIT_AND",
        op::BIT_OR => "BIT_OR",
        op::BIT_XOR => "BIT_XOR",
        op::LSH => "LSH",
        op::ASH => "ASH",
        op::RSH => "RSH",
        op::EQUAL => "EQUAL",
        op::NOT_EQUAL => "NOT_EQUAL",
        op::IS => "IS",
        op::GREATER => "GREATER",
        op::GREATER_EQ => "GREATER_EQ",
        op::LESS => "LESS",
        op::LESS_EQ => "LESS_EQ",
        op::IN => "IN",
        op::INSTANCEOF => "INSTANCEOF",
        op::TYPEOF => "TYPEOF",
        op::JUMP => "JUMP",
        op::LOOP => "LOOP",
        op::JUMP_IF_FALSE => "JUMP_IF_FALSE",
        op::JUMP_IF_FALSE_SC => "JUMP_IF_FALSE_SC",
        op::CALL => "CALL",
        op::CLOSURE => "CLOSURE",
        op::CLASS => "CLASS",
        op::INHERIT => "INHERIT",
        op::METHOD => "METHOD",
        op::INVOKE => "INVOKE",
        op::SUPER_INVOKE => "SUPER_INVOKE",
        op::RETURN => "RETURN",
        op::THROW => "THROW",
        op::TRY_BEGIN => "TRY_BEGIN",
        op::TRY_END => "TRY_END",
        op::IMPORT => "IMPORT",
        op::EXPORT => "EXPORT",
        _ => "UNKNOWN",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;

    #[test]
    fn walks_every_instruction_without_panicking() {
        let mut heap = Heap::new();
        let source = "\
            var a = [1, 2, 3];\n\
            var b = a[0] + 2 * 3;\n\
            if (b > 5) { b = b - 1; } else { b = 0; }\n\
            while (b > 0) { b -= 1; }\n\
            function f(x) { return x; }\n\
            f(1);\n";
        let function = compiler::compile(&mut heap, source).expect("compile error");
        let chunk = heap.function(function).chunk.clone();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let next = disassemble_instruction(&heap, &chunk, offset);
            assert!(next > offset);
            offset = next;
        }
        assert_eq!(offset, chunk.code.len());
    }
}
