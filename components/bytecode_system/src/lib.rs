//! Bytecode system for the Dictu runtime.
//!
//! Chunks pack opcodes and operands into a flat byte stream with a
//! parallel line table and a constant pool; the disassembler renders them
//! for debugging.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod debug;
pub mod opcode;

pub use chunk::{Chunk, MAX_CONSTANTS};
pub use debug::{disassemble_chunk, disassemble_instruction};
pub use opcode::OpCode;
