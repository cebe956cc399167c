//! Heap object representation.
//!
//! Every Dictu value that doesn't fit in a machine word lives here as a
//! variant of [`Obj`]. Objects reference each other by [`ObjId`] handle,
//! never by Rust reference, which is what lets the collector treat the
//! heap as a graph it can mark and sweep.

use crate::table::{DictTable, Table};
use bytecode_system::Chunk;
use core_types::{ObjId, Value};
use std::fs::File;

/// An immutable interned string: byte content plus its cached FNV-1a hash.
///
/// The intern pool guarantees one object per byte content, so string
/// equality anywhere else in the runtime is handle equality.
#[derive(Debug, Clone)]
pub struct ObjString {
    /// The string's bytes
    pub chars: String,
    /// Cached content hash, computed once at interning time
    pub hash: u32,
}

/// A compiled function: metadata plus its bytecode chunk.
#[derive(Debug, Clone)]
pub struct ObjFunction {
    /// Function name; `None` for the top-level script body
    pub name: Option<ObjId>,
    /// Number of required parameters
    pub arity: u8,
    /// Number of trailing optional parameters
    pub arity_optional: u8,
    /// Number of upvalues the function captures
    pub upvalue_count: usize,
    /// The compiled body
    pub chunk: Chunk,
}

/// A function paired with its captured environment.
#[derive(Debug, Clone)]
pub struct ObjClosure {
    /// The function being closed over
    pub function: ObjId,
    /// Captured variables, one upvalue object per capture
    pub upvalues: Vec<ObjId>,
}

/// A captured variable.
///
/// Open upvalues alias a live stack slot; closing copies the value into
/// the object when the slot is about to disappear.
#[derive(Debug, Clone, Copy)]
pub enum ObjUpvalue {
    /// Still aliases the VM stack at the given absolute slot
    Open(usize),
    /// Owns its value; the originating frame has returned
    Closed(Value),
}

impl ObjUpvalue {
    /// The stack slot if this upvalue is still open.
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            ObjUpvalue::Open(slot) => Some(*slot),
            ObjUpvalue::Closed(_) => None,
        }
    }
}

/// A class: name, method table, and optional superclass.
#[derive(Debug, Clone)]
pub struct ObjClass {
    /// Interned class name
    pub name: ObjId,
    /// Method table; user classes hold closures, builtin module classes
    /// hold natives
    pub methods: Table,
    /// Superclass, when declared with `<`
    pub superclass: Option<ObjId>,
}

/// A trait: a named bag of methods copied into adopting classes.
#[derive(Debug, Clone)]
pub struct ObjTrait {
    /// Interned trait name
    pub name: ObjId,
    /// Methods to copy on `use`
    pub methods: Table,
}

/// An instance of a class.
#[derive(Debug, Clone)]
pub struct ObjInstance {
    /// The instance's class
    pub class: ObjId,
    /// Field table
    pub fields: Table,
}

/// A method bound to its receiver.
#[derive(Debug, Clone, Copy)]
pub struct ObjBoundMethod {
    /// The receiver captured at binding time
    pub receiver: Value,
    /// The closure the class returned when the method was looked up
    pub method: ObjId,
}

/// A growable list of values.
#[derive(Debug, Clone, Default)]
pub struct ObjList {
    /// The elements
    pub items: Vec<Value>,
}

/// A dictionary keyed by value (strings, numbers, booleans, nil).
#[derive(Debug, Clone, Default)]
pub struct ObjDict {
    /// Open-addressed key/value storage
    pub items: DictTable,
}

/// An open file handle plus the path and mode it was opened with.
#[derive(Debug)]
pub struct ObjFile {
    /// The OS handle; `None` once closed
    pub file: Option<File>,
    /// Path the file was opened from
    pub path: String,
    /// Mode string (`"r"`, `"w"`, `"a"`, with optional `+`)
    pub mode: String,
}

/// A native function reference.
///
/// The function pointer itself lives in the VM's native registry; the
/// heap object carries the interned name and the registry index.
#[derive(Debug, Clone, Copy)]
pub struct ObjNative {
    /// Interned function name, for error messages and printing
    pub name: ObjId,
    /// Index into the VM's native registry
    pub native: usize,
}

/// Any heap-allocated object.
#[derive(Debug)]
pub enum Obj {
    /// Interned string
    String(ObjString),
    /// Compiled function
    Function(ObjFunction),
    /// Function plus captured environment
    Closure(ObjClosure),
    /// Captured variable
    Upvalue(ObjUpvalue),
    /// Class
    Class(ObjClass),
    /// Trait
    Trait(ObjTrait),
    /// Class instance
    Instance(ObjInstance),
    /// Receiver-bound method
    BoundMethod(ObjBoundMethod),
    /// List
    List(ObjList),
    /// Dictionary
    Dict(ObjDict),
    /// File handle
    File(ObjFile),
    /// Native function reference
    Native(ObjNative),
}

impl Obj {
    /// The user-visible name of this object's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Trait(_) => "trait",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "method",
            Obj::List(_) => "list",
            Obj::Dict(_) => "dict",
            Obj::File(_) => "file",
            Obj::Native(_) => "function",
        }
    }

    /// Rough byte footprint used for the collector's allocation budget.
    pub fn size_estimate(&self) -> usize {
        let base = std::mem::size_of::<Obj>();
        base + match self {
            Obj::String(s) => s.chars.len(),
            Obj::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * 16,
            Obj::Closure(c) => c.upvalues.len() * 8,
            Obj::Class(c) => c.methods.capacity() * 24,
            Obj::Trait(t) => t.methods.capacity() * 24,
            Obj::Instance(i) => i.fields.capacity() * 24,
            Obj::List(l) => l.items.capacity() * 16,
            Obj::Dict(d) => d.items.capacity() * 32,
            Obj::File(f) => f.path.len() + f.mode.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        let list = Obj::List(ObjList::default());
        assert_eq!(list.type_name(), "list");
        let upvalue = Obj::Upvalue(ObjUpvalue::Closed(Value::Nil));
        assert_eq!(upvalue.type_name(), "upvalue");
    }

    #[test]
    fn test_upvalue_states() {
        let open = ObjUpvalue::Open(4);
        assert_eq!(open.open_slot(), Some(4));
        let closed = ObjUpvalue::Closed(Value::Number(1.0));
        assert_eq!(closed.open_slot(), None);
    }

    #[test]
    fn test_size_estimate_scales_with_payload() {
        let small = Obj::String(ObjString {
            chars: "a".to_string(),
            hash: 0,
        });
        let large = Obj::String(ObjString {
            chars: "a".repeat(100),
            hash: 0,
        });
        assert!(large.size_estimate() > small.size_estimate());
    }
}
