//! Bytecode opcode catalogue.
//!
//! Opcodes are single bytes; operands follow inline in the chunk's code
//! stream. Jump operands are two bytes (big-endian), everything else is
//! one byte per operand.

/// One bytecode instruction's opcode.
///
/// The `#[repr(u8)]` layout is the wire format: a chunk's code vector
/// stores these as raw bytes with operands interleaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Push constants[operand]
    Constant,
    /// Push nil
    Nil,
    /// Push true
    True,
    /// Push false
    False,
    /// Discard the top of the stack
    Pop,
    /// Discard the top of the stack, printing it first (REPL mode)
    PopRepl,
    /// Push the local at slot operand
    GetLocal,
    /// Store the top of the stack into the local at slot operand
    SetLocal,
    /// Push the global named by constants[operand]
    GetGlobal,
    /// Define a global named by constants[operand] from the top of the stack
    DefineGlobal,
    /// Store the top of the stack into an existing global
    SetGlobal,
    /// Push the upvalue at index operand
    GetUpvalue,
    /// Store the top of the stack into the upvalue at index operand
    SetUpvalue,
    /// Pop an instance, push its property named by constants[operand]
    GetProperty,
    /// Like GetProperty but leaves the instance on the stack
    GetPropertyNoPop,
    /// instance.property = value; pops both, pushes the value
    SetProperty,
    /// Pop superclass and receiver, push the bound superclass method
    GetSuper,
    /// Pop two values, push their equality
    Equal,
    /// Pop two numbers, push a > b
    Greater,
    /// Pop two numbers, push a < b
    Less,
    /// Pop two values, push their sum (numbers add, strings concatenate,
    /// lists append)
    Add,
    /// Negate the number on top of the stack
    Negate,
    /// Pop two numbers, push their product
    Multiply,
    /// Pop two numbers, push their quotient
    Divide,
    /// Pop two numbers, push base raised to exponent
    Pow,
    /// Pop two numbers, push the remainder
    Mod,
    /// Pop two numbers, push their bitwise AND
    BitwiseAnd,
    /// Pop two numbers, push their bitwise XOR
    BitwiseXor,
    /// Pop two numbers, push their bitwise OR
    BitwiseOr,
    /// Replace the top of the stack with its logical negation
    Not,
    /// Add one to the number on top of the stack
    Increment,
    /// Subtract one from the number on top of the stack
    Decrement,
    /// Unconditional forward jump (two-byte offset)
    Jump,
    /// Forward jump if the top of the stack is falsy (two-byte offset)
    JumpIfFalse,
    /// Backward jump (two-byte offset)
    Loop,
    /// Placeholder emitted by `break`; rewritten to Jump when the loop ends
    Break,
    /// Pop a path string, import the module it names, push the module value
    Import,
    /// Push a new empty list
    NewList,
    /// Pop a value, append it to the list beneath it
    AddList,
    /// Push a new empty dict
    NewDict,
    /// Pop value and key, insert into the dict beneath them
    AddDict,
    /// Pop index and target, push target[index]
    Subscript,
    /// Pop value, index and target, perform target[index] = value
    SubscriptAssign,
    /// For compound subscript assignment: with [target, index, rhs] on the
    /// stack, push target[index] beneath the rhs
    SubscriptPush,
    /// Pop hi, lo and target, push the slice target[lo:hi]
    Slice,
    /// Push the slice-boundary sentinel ("from start" / "to end")
    Empty,
    /// Call the value below the operand-count arguments
    Call,
    /// Invoke a method: operands are argument count and method-name constant
    Invoke,
    /// Invoke a superclass method without allocating a bound method
    SuperInvoke,
    /// Build a closure: operands are function constant, upvalue count, then
    /// an (is_local, index) byte pair per upvalue
    Closure,
    /// Close every open upvalue at or above the current stack top, then pop
    CloseUpvalue,
    /// Return from the current function
    Return,
    /// Install defaults for missing optional arguments
    DefineOptional,
    /// Create a class named by constants[operand]
    Class,
    /// Create a class inheriting the superclass on the stack
    Subclass,
    /// Pop a closure, install it as a method on the class beneath it
    Method,
    /// Create a trait named by constants[operand]
    Trait,
    /// Pop a closure, install it as a method on the trait beneath it
    TraitMethod,
    /// Pop a trait, copy its methods into the class beneath it
    UseTrait,
    /// Pop mode and path strings, open the file, push the handle
    OpenFile,
    /// Close the file stored in the local at slot operand
    CloseFile,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<OpCode, u8> {
        let op = match byte {
            0 => OpCode::Constant,
            1 => OpCode::Nil,
            2 => OpCode::True,
            3 => OpCode::False,
            4 => OpCode::Pop,
            5 => OpCode::PopRepl,
            6 => OpCode::GetLocal,
            7 => OpCode::SetLocal,
            8 => OpCode::GetGlobal,
            9 => OpCode::DefineGlobal,
            10 => OpCode::SetGlobal,
            11 => OpCode::GetUpvalue,
            12 => OpCode::SetUpvalue,
            13 => OpCode::GetProperty,
            14 => OpCode::GetPropertyNoPop,
            15 => OpCode::SetProperty,
            16 => OpCode::GetSuper,
            17 => OpCode::Equal,
            18 => OpCode::Greater,
            19 => OpCode::Less,
            20 => OpCode::Add,
            21 => OpCode::Negate,
            22 => OpCode::Multiply,
            23 => OpCode::Divide,
            24 => OpCode::Pow,
            25 => OpCode::Mod,
            26 => OpCode::BitwiseAnd,
            27 => OpCode::BitwiseXor,
            28 => OpCode::BitwiseOr,
            29 => OpCode::Not,
            30 => OpCode::Increment,
            31 => OpCode::Decrement,
            32 => OpCode::Jump,
            33 => OpCode::JumpIfFalse,
            34 => OpCode::Loop,
            35 => OpCode::Break,
            36 => OpCode::Import,
            37 => OpCode::NewList,
            38 => OpCode::AddList,
            39 => OpCode::NewDict,
            40 => OpCode::AddDict,
            41 => OpCode::Subscript,
            42 => OpCode::SubscriptAssign,
            43 => OpCode::SubscriptPush,
            44 => OpCode::Slice,
            45 => OpCode::Empty,
            46 => OpCode::Call,
            47 => OpCode::Invoke,
            48 => OpCode::SuperInvoke,
            49 => OpCode::Closure,
            50 => OpCode::CloseUpvalue,
            51 => OpCode::Return,
            52 => OpCode::DefineOptional,
            53 => OpCode::Class,
            54 => OpCode::Subclass,
            55 => OpCode::Method,
            56 => OpCode::Trait,
            57 => OpCode::TraitMethod,
            58 => OpCode::UseTrait,
            59 => OpCode::OpenFile,
            60 => OpCode::CloseFile,
            _ => return Err(byte),
        };
        Ok(op)
    }
}

impl OpCode {
    /// Decode a raw byte back into an opcode.
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        OpCode::try_from(byte).ok()
    }

    /// Number of operand bytes following this opcode at `offset` in `code`.
    ///
    /// `Closure` is variable-length: its second operand byte is the number
    /// of (is_local, index) pairs that follow.
    pub fn operand_len(&self, code: &[u8], offset: usize) -> usize {
        match self {
            OpCode::Constant
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetGlobal
            | OpCode::DefineGlobal
            | OpCode::SetGlobal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::GetProperty
            | OpCode::GetPropertyNoPop
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::Call
            | OpCode::Class
            | OpCode::Subclass
            | OpCode::Method
            | OpCode::Trait
            | OpCode::TraitMethod
            | OpCode::CloseFile => 1,
            OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::Loop
            | OpCode::Break
            | OpCode::Invoke
            | OpCode::SuperInvoke => 2,
            OpCode::Closure => {
                let upvalue_count = code[offset + 2] as usize;
                2 + upvalue_count * 2
            }
            _ => 0,
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for byte in 0..=OpCode::CloseFile as u8 {
            let op = OpCode::from_byte(byte).expect("valid opcode byte");
            assert_eq!(op as u8, byte);
        }
    }

    #[test]
    fn test_invalid_byte() {
        assert_eq!(OpCode::from_byte(0xff), None);
    }

    #[test]
    fn test_try_from() {
        assert_eq!(OpCode::try_from(OpCode::Return as u8), Ok(OpCode::Return));
        assert_eq!(OpCode::try_from(0xff), Err(0xff));
    }

    #[test]
    fn test_operand_lengths() {
        let code = [OpCode::Closure as u8, 0, 2, 1, 0, 0, 1];
        assert_eq!(OpCode::Closure.operand_len(&code, 0), 6);
        assert_eq!(OpCode::Jump.operand_len(&[], 0), 2);
        assert_eq!(OpCode::Constant.operand_len(&[], 0), 1);
        assert_eq!(OpCode::Nil.operand_len(&[], 0), 0);
    }
}
