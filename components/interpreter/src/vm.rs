//! Virtual machine state and calling convention.
//!
//! The `Vm` owns the heap, the value stack, the call-frame stack, the
//! sorted open-upvalue list, globals, and the module cache. The dispatch
//! loop lives in `dispatch.rs`; native registration in `natives.rs`;
//! builtin modules and imports in `modules.rs`.

use crate::call_frame::CallFrame;
use builtins::RandomLib;
use compiler::compile;
use core_types::{InterpretError, ObjId, RuntimeError, StackTraceFrame, Value};
use memory_manager::{
    Heap, Obj, ObjBoundMethod, ObjClosure, ObjInstance, ObjUpvalue, Table,
};
use std::collections::HashMap;

/// A native function: receives the VM and the argument values, returns
/// the result or an error message the VM raises as a runtime error.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

/// Maximum call depth.
pub const MAX_FRAMES: usize = 64;

/// The Dictu virtual machine.
///
/// One instance owns all interpreter state; REPL sessions keep a single
/// `Vm` alive across inputs so globals persist.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalues, sorted by descending stack slot
    pub(crate) open_upvalues: Vec<ObjId>,
    pub(crate) globals: Table,
    /// Module cache: path string → module value; guarantees each module
    /// executes once
    pub(crate) modules: Table,
    /// The interned "init" string used for implicit initializer calls
    pub(crate) init_string: ObjId,
    pub(crate) repl: bool,
    /// Registry of native function pointers; `ObjNative` stores indexes
    /// into this
    pub(crate) natives: Vec<NativeFn>,
    pub(crate) string_methods: HashMap<&'static str, NativeFn>,
    pub(crate) number_methods: HashMap<&'static str, NativeFn>,
    pub(crate) list_methods: HashMap<&'static str, NativeFn>,
    pub(crate) dict_methods: HashMap<&'static str, NativeFn>,
    pub(crate) file_methods: HashMap<&'static str, NativeFn>,
    pub(crate) rng: RandomLib,
}

impl Vm {
    /// Create a VM with the standard globals and type-method tables
    /// registered.
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern("init");

        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(MAX_FRAMES * 256),
            frames: Vec::with_capacity(MAX_FRAMES),
            open_upvalues: Vec::new(),
            globals: Table::new(),
            modules: Table::new(),
            init_string,
            repl: false,
            natives: Vec::new(),
            string_methods: HashMap::new(),
            number_methods: HashMap::new(),
            list_methods: HashMap::new(),
            dict_methods: HashMap::new(),
            file_methods: HashMap::new(),
            rng: RandomLib::new(),
        };

        crate::natives::register(&mut vm);
        vm
    }

    /// Switch REPL mode: expression statements print their value.
    pub fn set_repl(&mut self, repl: bool) {
        self.repl = repl;
    }

    /// Compile and execute `source`, returning the script's result.
    ///
    /// On a runtime error the stacks have been reset and the VM is ready
    /// for the next input.
    pub fn interpret(&mut self, source: &str) -> Result<Value, InterpretError> {
        let function = compile(&mut self.heap, source, self.repl)?;

        // Root the function while the closure allocates.
        self.push(Value::Obj(function));
        let closure = self.heap.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));

        self.call_closure(closure, 0)
            .map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    /// Look up a global by name.
    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let id = self.heap.intern(name);
        let hash = self.heap.string_hash(id)?;
        self.globals.get(id, hash)
    }

    /// Define (or overwrite) a global.
    pub fn set_global(&mut self, name: &str, value: Value) {
        let id = self.heap.intern(name);
        if let Some(hash) = self.heap.string_hash(id) {
            self.globals.set(id, hash, value);
        }
    }

    /// Borrow the heap, for hosts and tests that inspect objects.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ---- stack -----------------------------------------------------------

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        let len = self.stack.len();
        self.stack
            .get(len - 1 - distance)
            .copied()
            .unwrap_or(Value::Nil)
    }

    // ---- tables keyed by interned strings --------------------------------

    pub(crate) fn table_get(&self, table: &Table, key: ObjId) -> Option<Value> {
        let hash = self.heap.string_hash(key)?;
        table.get(key, hash)
    }

    pub(crate) fn globals_get(&self, key: ObjId) -> Option<Value> {
        self.table_get(&self.globals, key)
    }

    pub(crate) fn globals_set(&mut self, key: ObjId, value: Value) -> bool {
        match self.heap.string_hash(key) {
            Some(hash) => self.globals.set(key, hash, value),
            None => false,
        }
    }

    pub(crate) fn globals_delete(&mut self, key: ObjId) {
        if let Some(hash) = self.heap.string_hash(key) {
            self.globals.delete(key, hash);
        }
    }

    // ---- calling ---------------------------------------------------------

    /// Dispatch a call on any callee value.
    pub(crate) fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        let Value::Obj(id) = callee else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };

        enum Kind {
            Closure,
            Native(usize),
            Class,
            Bound(Value, ObjId),
        }

        let kind = match self.heap.get(id) {
            Some(Obj::Closure(_)) => Kind::Closure,
            Some(Obj::Native(native)) => Kind::Native(native.native),
            Some(Obj::Class(_)) => Kind::Class,
            Some(Obj::BoundMethod(bound)) => Kind::Bound(bound.receiver, bound.method),
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };

        match kind {
            Kind::Closure => self.call_closure(id, arg_count),
            Kind::Native(index) => self.call_registry_native(index, arg_count),
            Kind::Class => self.call_class(id, arg_count),
            Kind::Bound(receiver, method) => {
                // The receiver takes the callee's slot, becoming slot zero.
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
        }
    }

    /// Push a call frame for a closure after checking arity.
    pub(crate) fn call_closure(&mut self, closure: ObjId, arg_count: u8) -> Result<(), RuntimeError> {
        let (function, arity, arity_optional, name) = match self.heap.get(closure) {
            Some(Obj::Closure(c)) => match self.heap.get(c.function) {
                Some(Obj::Function(f)) => (c.function, f.arity, f.arity_optional, f.name),
                _ => return Err(self.runtime_error("Can only call functions and classes.")),
            },
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };

        let argc = u32::from(arg_count);
        let min = u32::from(arity);
        let max = min + u32::from(arity_optional);
        if argc < min || argc > max {
            let fn_name = name
                .and_then(|n| self.heap.string(n))
                .unwrap_or("<anonymous>")
                .to_string();
            let expected = if arity_optional > 0 {
                format!("{} to {}", min, max)
            } else {
                format!("{}", min)
            };
            return Err(self.runtime_error(format!(
                "Function '{}' expected {} argument(s) but got {}.",
                fn_name, expected, argc
            )));
        }

        if self.frames.len() == MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow."));
        }

        let slot_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame::new(closure, function, slot_base));
        Ok(())
    }

    /// Construct an instance; invoke `init` when the class defines one.
    fn call_class(&mut self, class: ObjId, arg_count: u8) -> Result<(), RuntimeError> {
        let instance = self.heap.alloc(Obj::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));

        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Obj(instance);

        let initializer = match self.heap.get(class) {
            Some(Obj::Class(c)) => self.table_get(&c.methods, self.init_string),
            _ => None,
        };

        match initializer {
            Some(Value::Obj(init)) => self.call_closure(init, arg_count),
            Some(_) | None if arg_count != 0 => Err(self.runtime_error(format!(
                "Expected 0 arguments but got {}.",
                arg_count
            ))),
            _ => Ok(()),
        }
    }

    /// Call a native from the registry: the callee sits beneath the
    /// arguments and is consumed with them.
    pub(crate) fn call_registry_native(
        &mut self,
        index: usize,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let argc = arg_count as usize;
        let start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[start..].to_vec();

        let native = self.natives[index];
        match native(self, &args) {
            Ok(value) => {
                self.stack.truncate(start - 1);
                self.push(value);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    /// Call a type-method native: the receiver is passed as `args[0]`
    /// and consumed with the arguments.
    pub(crate) fn call_type_native(
        &mut self,
        native: NativeFn,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let start = self.stack.len() - arg_count as usize - 1;
        let args: Vec<Value> = self.stack[start..].to_vec();

        match native(self, &args) {
            Ok(value) => {
                self.stack.truncate(start);
                self.push(value);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    /// Replace the receiver on top of the stack with a bound method for
    /// `name`, looked up on `class`.
    pub(crate) fn bind_method(&mut self, class: ObjId, name: ObjId) -> Result<bool, RuntimeError> {
        let method = match self.heap.get(class) {
            Some(Obj::Class(c)) => self.table_get(&c.methods, name),
            _ => None,
        };

        let Some(Value::Obj(method)) = method else {
            return Ok(false);
        };

        let receiver = self.peek(0);
        let bound = self.heap.alloc(Obj::BoundMethod(ObjBoundMethod {
            receiver,
            method,
        }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(true)
    }

    // ---- upvalues --------------------------------------------------------

    /// Find or create an open upvalue for an absolute stack slot,
    /// keeping the list sorted by descending slot.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> ObjId {
        let mut insert_at = self.open_upvalues.len();

        for (i, &id) in self.open_upvalues.iter().enumerate() {
            let existing = match self.heap.get(id) {
                Some(Obj::Upvalue(upvalue)) => upvalue.open_slot(),
                _ => None,
            };
            match existing {
                Some(s) if s == slot => return id,
                Some(s) if s < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }

        let created = self.heap.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue at stack slot >= `from`: copy the value
    /// into the upvalue object and unlink it.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        while let Some(&id) = self.open_upvalues.first() {
            let slot = match self.heap.get(id) {
                Some(Obj::Upvalue(upvalue)) => upvalue.open_slot(),
                _ => None,
            };

            let Some(slot) = slot else {
                self.open_upvalues.remove(0);
                continue;
            };
            if slot < from {
                break;
            }

            let value = self.stack.get(slot).copied().unwrap_or(Value::Nil);
            if let Some(Obj::Upvalue(upvalue)) = self.heap.get_mut(id) {
                *upvalue = ObjUpvalue::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    // ---- garbage collection ----------------------------------------------

    /// Run a full collection cycle: mark the VM roots, then let the heap
    /// trace, drop weak intern entries, and sweep.
    pub fn collect_garbage(&mut self) {
        for value in &self.stack {
            self.heap.mark_value(*value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        for upvalue in &self.open_upvalues {
            self.heap.mark_object(*upvalue);
        }
        self.heap.mark_table(&self.globals);
        self.heap.mark_table(&self.modules);
        self.heap.mark_object(self.init_string);

        self.heap.finish_cycle();
    }

    // ---- errors ----------------------------------------------------------

    /// Build a runtime error with a stack trace, then reset the stacks
    /// so the host loop can continue.
    pub(crate) fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let (name, line) = match self.heap.get(frame.function) {
                Some(Obj::Function(f)) => {
                    let name = f
                        .name
                        .and_then(|n| self.heap.string(n))
                        .map(str::to_string)
                        .unwrap_or_else(|| "<top>".to_string());
                    (name, f.chunk.line_at(frame.ip.saturating_sub(1)))
                }
                _ => ("<top>".to_string(), 0),
            };
            trace.push(StackTraceFrame {
                function: name,
                line,
            });
        }

        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    // ---- value formatting ------------------------------------------------

    /// Render a value the way `print` shows it (strings unquoted).
    pub fn value_to_string(&self, value: Value) -> String {
        self.format_value(value, false, 0)
    }

    /// Render a value the way the REPL echoes it (strings quoted,
    /// containers recursive).
    pub fn value_repr(&self, value: Value) -> String {
        self.format_value(value, true, 0)
    }

    fn format_value(&self, value: Value, quote: bool, depth: usize) -> String {
        let Value::Obj(id) = value else {
            return value.to_string();
        };

        if depth > 4 {
            return "...".to_string();
        }

        match self.heap.get(id) {
            Some(Obj::String(s)) => {
                if quote {
                    format!("'{}'", s.chars)
                } else {
                    s.chars.clone()
                }
            }
            Some(Obj::Function(f)) => format!("<fn {}>", self.function_name(f.name)),
            Some(Obj::Closure(c)) => match self.heap.get(c.function) {
                Some(Obj::Function(f)) => format!("<fn {}>", self.function_name(f.name)),
                _ => "<fn>".to_string(),
            },
            Some(Obj::Upvalue(_)) => "<upvalue>".to_string(),
            Some(Obj::Class(c)) => format!("<class {}>", self.function_name(Some(c.name))),
            Some(Obj::Trait(t)) => format!("<trait {}>", self.function_name(Some(t.name))),
            Some(Obj::Instance(i)) => {
                let class_name = match self.heap.get(i.class) {
                    Some(Obj::Class(c)) => self.function_name(Some(c.name)),
                    _ => "?".to_string(),
                };
                format!("<{} instance>", class_name)
            }
            Some(Obj::BoundMethod(b)) => match self.heap.get(b.method) {
                Some(Obj::Closure(c)) => match self.heap.get(c.function) {
                    Some(Obj::Function(f)) => {
                        format!("<bound method {}>", self.function_name(f.name))
                    }
                    _ => "<bound method>".to_string(),
                },
                _ => "<bound method>".to_string(),
            },
            Some(Obj::List(l)) => {
                let items: Vec<String> = l
                    .items
                    .iter()
                    .map(|&item| self.format_value(item, true, depth + 1))
                    .collect();
                format!("[{}]", items.join(", "))
            }
            Some(Obj::Dict(d)) => {
                let items: Vec<String> = d
                    .items
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}: {}",
                            self.format_value(k, true, depth + 1),
                            self.format_value(v, true, depth + 1)
                        )
                    })
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            Some(Obj::File(f)) => format!("<file '{}'>", f.path),
            Some(Obj::Native(n)) => {
                format!("<native fn {}>", self.function_name(Some(n.name)))
            }
            None => "<freed>".to_string(),
        }
    }

    fn function_name(&self, name: Option<ObjId>) -> String {
        name.and_then(|n| self.heap.string(n))
            .map(str::to_string)
            .unwrap_or_else(|| "<top>".to_string())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_simple_expression() {
        let mut vm = Vm::new();
        assert!(vm.interpret("var x = 1 + 2;").is_ok());
        assert_eq!(vm.get_global("x"), Some(Value::Number(3.0)));
    }

    #[test]
    fn test_runtime_error_resets_stacks() {
        let mut vm = Vm::new();
        assert!(vm.interpret("1 + nil;").is_err());
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        // Ready for the next input.
        assert!(vm.interpret("var ok = true;").is_ok());
    }

    #[test]
    fn test_runtime_error_carries_trace() {
        let mut vm = Vm::new();
        let err = vm
            .interpret("def f() { return 1 + nil; } f();")
            .unwrap_err();
        match err {
            InterpretError::Runtime(e) => {
                assert!(e.trace.iter().any(|f| f.function == "f"));
                assert!(e.trace.iter().any(|f| f.function == "<top>"));
            }
            _ => panic!("expected runtime error"),
        }
    }

    #[test]
    fn test_globals_persist_across_inputs() {
        let mut vm = Vm::new();
        vm.interpret("var counter = 1;").expect("runs");
        vm.interpret("counter = counter + 1;").expect("runs");
        assert_eq!(vm.get_global("counter"), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_collect_garbage_keeps_globals() {
        let mut vm = Vm::new();
        vm.interpret("var s = \"keep me\";").expect("runs");
        vm.collect_garbage();
        let value = vm.get_global("s").expect("global survives");
        let id = value.as_obj().expect("string object");
        assert_eq!(vm.heap().string(id), Some("keep me"));
    }
}
