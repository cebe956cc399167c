//! Dispatch loop for bytecode execution.
//!
//! One opcode per iteration; the collection check at the top of the loop
//! is the GC's only entry point during execution, so no instruction is
//! ever interrupted half-way.

use crate::vm::Vm;
use bytecode_system::OpCode;
use core_types::{ObjId, RuntimeError, Value};
use memory_manager::{Obj, ObjClosure, ObjDict, ObjFile, ObjList, ObjTrait, Table};
use std::fs::OpenOptions;

impl Vm {
    /// Execute until the outermost frame returns, yielding its result.
    pub(crate) fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                return Err(self.runtime_error(format!("Unknown opcode {}.", byte)));
            };

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopRepl => {
                    let value = self.pop();
                    println!("{}", self.value_repr(value));
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_slot_base();
                    let value = self.stack.get(base + slot).copied().unwrap_or(Value::Nil);
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_slot_base();
                    let value = self.peek(0);
                    if let Some(target) = self.stack.get_mut(base + slot) {
                        *target = value;
                    }
                }

                OpCode::GetGlobal => {
                    let name = self.read_string()?;
                    match self.globals_get(name) {
                        Some(value) => self.push(value),
                        None => {
                            let text = self.heap.string(name).unwrap_or("?").to_string();
                            return Err(
                                self.runtime_error(format!("Undefined variable '{}'.", text))
                            );
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string()?;
                    let value = self.peek(0);
                    self.globals_set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string()?;
                    let value = self.peek(0);
                    if self.globals_set(name, value) {
                        // The assignment created the key: the global never
                        // existed, so undo and report.
                        self.globals_delete(name);
                        let text = self.heap.string(name).unwrap_or("?").to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{}'.", text)));
                    }
                }

                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.read_upvalue(index);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    self.write_upvalue(index, value);
                }

                OpCode::GetProperty => self.op_get_property(false)?,
                OpCode::GetPropertyNoPop => self.op_get_property(true)?,
                OpCode::SetProperty => {
                    let name = self.read_string()?;
                    let value = self.peek(0);
                    let target = self.peek(1);

                    let Some(instance) = self.instance_of(target) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let hash = self.heap.string_hash(name).unwrap_or(0);
                    if let Some(Obj::Instance(obj)) = self.heap.get_mut(instance) {
                        obj.fields.set(name, hash, value);
                    }

                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }

                OpCode::GetSuper => {
                    let name = self.read_string()?;
                    let superclass = self.pop();
                    let Some(class) = superclass.as_obj() else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    if !self.bind_method(class, name)? {
                        let text = self.heap.string(name).unwrap_or("?").to_string();
                        return Err(self.runtime_error(format!("Undefined property '{}'.", text)));
                    }
                }

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,

                OpCode::Add => self.op_add()?,
                OpCode::Negate => {
                    let Value::Number(n) = self.pop() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.push(Value::Number(-n));
                }
                OpCode::Multiply => self.binary_number(|a, b| a * b)?,
                OpCode::Divide => self.binary_number(|a, b| a / b)?,
                OpCode::Pow => self.binary_number(f64::powf)?,
                OpCode::Mod => self.binary_number(|a, b| a % b)?,
                OpCode::BitwiseAnd => self.binary_number(|a, b| (a as i64 & b as i64) as f64)?,
                OpCode::BitwiseXor => self.binary_number(|a, b| (a as i64 ^ b as i64) as f64)?,
                OpCode::BitwiseOr => self.binary_number(|a, b| (a as i64 | b as i64) as f64)?,

                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsy()));
                }
                OpCode::Increment => {
                    let Value::Number(n) = self.pop() else {
                        return Err(self.runtime_error("Cannot increment a non-number value."));
                    };
                    self.push(Value::Number(n + 1.0));
                }
                OpCode::Decrement => {
                    let Value::Number(n) = self.pop() else {
                        return Err(self.runtime_error("Cannot decrement a non-number value."));
                    };
                    self.push(Value::Number(n - 1.0));
                }

                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_ip_add(offset);
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsy() {
                        self.frame_ip_add(offset);
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_ip_sub(offset);
                }
                OpCode::Break => {
                    // Rewritten to Jump when a loop compiles; reaching one
                    // means the chunk is corrupt.
                    return Err(self.runtime_error("Unpatched break in bytecode."));
                }

                OpCode::Import => {
                    let path = self.pop();
                    let Some(path_id) = self.string_id(path) else {
                        return Err(self.runtime_error("Import path must be a string."));
                    };
                    self.import_module(path_id)?;
                }

                OpCode::NewList => {
                    let list = self.heap.alloc(Obj::List(ObjList::default()));
                    self.push(Value::Obj(list));
                }
                OpCode::AddList => {
                    let value = self.pop();
                    let list = self.peek(0);
                    if let Some(id) = list.as_obj() {
                        if let Some(Obj::List(obj)) = self.heap.get_mut(id) {
                            obj.items.push(value);
                        }
                    }
                }
                OpCode::NewDict => {
                    let dict = self.heap.alloc(Obj::Dict(ObjDict::default()));
                    self.push(Value::Obj(dict));
                }
                OpCode::AddDict => {
                    let value = self.pop();
                    let key = self.pop();
                    let dict = self.peek(0);

                    let Some(hash) = self.heap.value_hash(key) else {
                        return Err(self.runtime_error(
                            "Dictionary key must be a string, number, bool or nil.",
                        ));
                    };
                    if let Some(id) = dict.as_obj() {
                        if let Some(Obj::Dict(obj)) = self.heap.get_mut(id) {
                            obj.items.set(key, hash, value);
                        }
                    }
                }

                OpCode::Subscript => {
                    let index = self.pop();
                    let target = self.pop();
                    let value = self.subscript_value(target, index)?;
                    self.push(value);
                }
                OpCode::SubscriptAssign => self.op_subscript_assign()?,
                OpCode::SubscriptPush => {
                    let rhs = self.pop();
                    let index = self.peek(0);
                    let target = self.peek(1);
                    let current = self.subscript_value(target, index)?;
                    self.push(current);
                    self.push(rhs);
                }
                OpCode::Slice => self.op_slice()?,
                OpCode::Empty => self.push(Value::Empty),

                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let arg_count = self.read_byte();
                    let name = self.read_string_operand()?;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let arg_count = self.read_byte();
                    let name = self.read_string_operand()?;
                    let superclass = self.pop();
                    let Some(class) = superclass.as_obj() else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    self.invoke_from_class(class, name, arg_count)?;
                }

                OpCode::Closure => {
                    let constant = self.read_constant();
                    let upvalue_count = self.read_byte() as usize;

                    let Some(function) = constant.as_obj() else {
                        return Err(self.runtime_error("Corrupt closure constant."));
                    };

                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;

                        if is_local {
                            let base = self.frame_slot_base();
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(self.enclosing_upvalue(index));
                        }
                    }

                    let closure = self.heap.alloc(Obj::Closure(ObjClosure {
                        function,
                        upvalues,
                    }));
                    self.push(Value::Obj(closure));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let Some(frame) = self.frames.pop() else {
                        return Ok(result);
                    };
                    self.close_upvalues(frame.slot_base);

                    if self.frames.is_empty() {
                        self.stack.clear();
                        return Ok(result);
                    }

                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }

                OpCode::DefineOptional => self.op_define_optional(),

                OpCode::Class => {
                    let name = self.read_string()?;
                    let class = self.heap.alloc(Obj::Class(memory_manager::ObjClass {
                        name,
                        methods: Table::new(),
                        superclass: None,
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Subclass => self.op_subclass()?,
                OpCode::Method => {
                    let name = self.read_string()?;
                    self.op_define_method(name, false)?;
                }
                OpCode::Trait => {
                    let name = self.read_string()?;
                    let tr = self.heap.alloc(Obj::Trait(ObjTrait {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Obj(tr));
                }
                OpCode::TraitMethod => {
                    let name = self.read_string()?;
                    self.op_define_method(name, true)?;
                }
                OpCode::UseTrait => self.op_use_trait()?,

                OpCode::OpenFile => self.op_open_file()?,
                OpCode::CloseFile => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_slot_base();
                    let value = self.stack.get(base + slot).copied().unwrap_or(Value::Nil);
                    if let Some(id) = value.as_obj() {
                        if let Some(Obj::File(file)) = self.heap.get_mut(id) {
                            // Dropping the handle closes it; a second close
                            // is a no-op.
                            file.file.take();
                        }
                    }
                }
            }
        }
    }

    // ---- instruction stream ----------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let (function, ip) = {
            let frame = self.frames.last().expect("active frame");
            (frame.function, frame.ip)
        };
        let byte = match self.heap.get(function) {
            Some(Obj::Function(f)) => f.chunk.code.get(ip).copied().unwrap_or(0),
            _ => 0,
        };
        if let Some(frame) = self.frames.last_mut() {
            frame.ip += 1;
        }
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        (u16::from(high) << 8) | u16::from(low)
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let function = self.frames.last().expect("active frame").function;
        match self.heap.get(function) {
            Some(Obj::Function(f)) => f.chunk.constants.get(index).copied().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    fn read_string(&mut self) -> Result<ObjId, RuntimeError> {
        let constant = self.read_constant();
        match constant.as_obj() {
            Some(id) => Ok(id),
            None => Err(self.runtime_error("Corrupt name constant.")),
        }
    }

    fn read_string_operand(&mut self) -> Result<ObjId, RuntimeError> {
        self.read_string()
    }

    fn frame_slot_base(&self) -> usize {
        self.frames.last().map(|f| f.slot_base).unwrap_or(0)
    }

    fn frame_ip_add(&mut self, offset: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip += offset;
        }
    }

    fn frame_ip_sub(&mut self, offset: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip -= offset;
        }
    }

    // ---- upvalue access --------------------------------------------------

    fn read_upvalue(&self, index: usize) -> Value {
        let closure = match self.frames.last() {
            Some(frame) => frame.closure,
            None => return Value::Nil,
        };
        let upvalue = match self.heap.get(closure) {
            Some(Obj::Closure(c)) => c.upvalues.get(index).copied(),
            _ => None,
        };
        match upvalue.and_then(|id| self.heap.get(id)) {
            Some(Obj::Upvalue(u)) => match u {
                memory_manager::ObjUpvalue::Open(slot) => {
                    self.stack.get(*slot).copied().unwrap_or(Value::Nil)
                }
                memory_manager::ObjUpvalue::Closed(value) => *value,
            },
            _ => Value::Nil,
        }
    }

    fn write_upvalue(&mut self, index: usize, value: Value) {
        let closure = match self.frames.last() {
            Some(frame) => frame.closure,
            None => return,
        };
        let upvalue = match self.heap.get(closure) {
            Some(Obj::Closure(c)) => c.upvalues.get(index).copied(),
            _ => None,
        };
        let Some(id) = upvalue else {
            return;
        };

        let open_slot = match self.heap.get(id) {
            Some(Obj::Upvalue(memory_manager::ObjUpvalue::Open(slot))) => Some(*slot),
            _ => None,
        };

        match open_slot {
            Some(slot) => {
                if let Some(target) = self.stack.get_mut(slot) {
                    *target = value;
                }
            }
            None => {
                if let Some(Obj::Upvalue(u)) = self.heap.get_mut(id) {
                    *u = memory_manager::ObjUpvalue::Closed(value);
                }
            }
        }
    }

    fn enclosing_upvalue(&self, index: usize) -> ObjId {
        let closure = self.frames.last().expect("active frame").closure;
        match self.heap.get(closure) {
            Some(Obj::Closure(c)) => c.upvalues.get(index).copied().unwrap_or(ObjId(0)),
            _ => ObjId(0),
        }
    }

    // ---- compound opcode bodies ------------------------------------------

    fn binary_number(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(Value::Number(f(a, b)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn binary_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(Value::Bool(f(a, b)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();

        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Obj(left), Value::Obj(right)) => {
                let concatenated = match (self.heap.get(left), self.heap.get(right)) {
                    (Some(Obj::String(x)), Some(Obj::String(y))) => {
                        Some(format!("{}{}", x.chars, y.chars))
                    }
                    _ => None,
                };
                if let Some(text) = concatenated {
                    let id = self.heap.intern(&text);
                    self.push(Value::Obj(id));
                    return Ok(());
                }

                let joined = match (self.heap.get(left), self.heap.get(right)) {
                    (Some(Obj::List(x)), Some(Obj::List(y))) => {
                        let mut items = x.items.clone();
                        items.extend(y.items.iter().copied());
                        Some(items)
                    }
                    _ => None,
                };
                if let Some(items) = joined {
                    let id = self.heap.alloc(Obj::List(ObjList { items }));
                    self.push(Value::Obj(id));
                    return Ok(());
                }

                Err(self.runtime_error("Operands must be numbers or strings."))
            }
            _ => Err(self.runtime_error("Operands must be numbers or strings.")),
        }
    }

    fn op_get_property(&mut self, keep_receiver: bool) -> Result<(), RuntimeError> {
        let name = self.read_string()?;
        let receiver = self.peek(0);

        let Some(id) = receiver.as_obj() else {
            return Err(self.runtime_error("Only instances have properties."));
        };

        match self.heap.get(id) {
            Some(Obj::Instance(instance)) => {
                // Fields shadow methods.
                if let Some(value) = self.table_get(&instance.fields, name) {
                    if !keep_receiver {
                        self.pop();
                    }
                    self.push(value);
                    return Ok(());
                }

                let class = instance.class;
                if keep_receiver {
                    // Re-push so bind_method's replacement leaves the
                    // receiver beneath the bound method.
                    self.push(receiver);
                }
                if self.bind_method(class, name)? {
                    return Ok(());
                }
                if keep_receiver {
                    self.pop();
                }
                let text = self.heap.string(name).unwrap_or("?").to_string();
                Err(self.runtime_error(format!("Undefined property '{}'.", text)))
            }
            Some(Obj::Class(class)) => {
                if let Some(value) = self.table_get(&class.methods, name) {
                    if !keep_receiver {
                        self.pop();
                    }
                    self.push(value);
                    Ok(())
                } else {
                    let text = self.heap.string(name).unwrap_or("?").to_string();
                    Err(self.runtime_error(format!("Undefined property '{}'.", text)))
                }
            }
            _ => Err(self.runtime_error("Only instances have properties.")),
        }
    }

    fn op_subscript_assign(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let target = self.pop();

        let Some(id) = target.as_obj() else {
            return Err(self.runtime_error("Can only subscript assign lists and dictionaries."));
        };

        enum Target {
            List(usize),
            Dict(u32),
        }

        let plan = match self.heap.get(id) {
            Some(Obj::List(list)) => {
                let Value::Number(n) = index else {
                    return Err(self.runtime_error("List index must be a number."));
                };
                let Some(slot) = normalize_index(n, list.items.len()) else {
                    return Err(self.runtime_error("List index out of bounds."));
                };
                Target::List(slot)
            }
            Some(Obj::Dict(_)) => {
                let Some(hash) = self.heap.value_hash(index) else {
                    return Err(self.runtime_error(
                        "Dictionary key must be a string, number, bool or nil.",
                    ));
                };
                Target::Dict(hash)
            }
            _ => {
                return Err(
                    self.runtime_error("Can only subscript assign lists and dictionaries.")
                )
            }
        };

        match (plan, self.heap.get_mut(id)) {
            (Target::List(slot), Some(Obj::List(list))) => list.items[slot] = value,
            (Target::Dict(hash), Some(Obj::Dict(dict))) => {
                dict.items.set(index, hash, value);
            }
            _ => {}
        }

        self.push(value);
        Ok(())
    }

    pub(crate) fn subscript_value(
        &mut self,
        target: Value,
        index: Value,
    ) -> Result<Value, RuntimeError> {
        let Some(id) = target.as_obj() else {
            return Err(self.runtime_error("Can only subscript lists, strings and dictionaries."));
        };

        enum Fetched {
            Value(Value),
            Char(char),
            MissingKey,
        }

        let fetched = match self.heap.get(id) {
            Some(Obj::List(list)) => {
                let Value::Number(n) = index else {
                    return Err(self.runtime_error("List index must be a number."));
                };
                let Some(slot) = normalize_index(n, list.items.len()) else {
                    return Err(self.runtime_error("List index out of bounds."));
                };
                Fetched::Value(list.items[slot])
            }
            Some(Obj::String(s)) => {
                let Value::Number(n) = index else {
                    return Err(self.runtime_error("String index must be a number."));
                };
                let chars: Vec<char> = s.chars.chars().collect();
                let Some(slot) = normalize_index(n, chars.len()) else {
                    return Err(self.runtime_error("String index out of bounds."));
                };
                Fetched::Char(chars[slot])
            }
            Some(Obj::Dict(dict)) => {
                let Some(hash) = self.heap.value_hash(index) else {
                    return Err(self.runtime_error(
                        "Dictionary key must be a string, number, bool or nil.",
                    ));
                };
                match dict.items.get(index, hash) {
                    Some(value) => Fetched::Value(value),
                    None => Fetched::MissingKey,
                }
            }
            _ => {
                return Err(
                    self.runtime_error("Can only subscript lists, strings and dictionaries.")
                )
            }
        };

        match fetched {
            Fetched::Value(value) => Ok(value),
            Fetched::Char(c) => {
                let id = self.heap.intern(&c.to_string());
                Ok(Value::Obj(id))
            }
            Fetched::MissingKey => {
                let key = self.value_repr(index);
                Err(self.runtime_error(format!(
                    "Key {} does not exist within dictionary.",
                    key
                )))
            }
        }
    }

    fn op_slice(&mut self) -> Result<(), RuntimeError> {
        let hi = self.pop();
        let lo = self.pop();
        let target = self.pop();

        let Some(id) = target.as_obj() else {
            return Err(self.runtime_error("Can only slice lists and strings."));
        };

        let len = match self.heap.get(id) {
            Some(Obj::List(list)) => list.items.len(),
            Some(Obj::String(s)) => s.chars.chars().count(),
            _ => return Err(self.runtime_error("Can only slice lists and strings.")),
        };

        let lo = match slice_bound(lo, len, 0) {
            Some(v) => v,
            None => return Err(self.runtime_error("Slice index must be a number.")),
        };
        let hi = match slice_bound(hi, len, len) {
            Some(v) => v,
            None => return Err(self.runtime_error("Slice index must be a number.")),
        };
        let hi = hi.max(lo);

        let result = match self.heap.get(id) {
            Some(Obj::List(list)) => {
                let items = list.items[lo..hi].to_vec();
                let sliced = self.heap.alloc(Obj::List(ObjList { items }));
                Value::Obj(sliced)
            }
            Some(Obj::String(s)) => {
                let text: String = s.chars.chars().skip(lo).take(hi - lo).collect();
                let sliced = self.heap.intern(&text);
                Value::Obj(sliced)
            }
            _ => Value::Nil,
        };

        self.push(result);
        Ok(())
    }

    /// The optional-default shuffle: all defaults were evaluated in the
    /// prologue and sit above the provided arguments. Keep the defaults
    /// for parameters the caller left off; drop the rest.
    fn op_define_optional(&mut self) {
        let frame = *self.frames.last().expect("active frame");
        let (arity, arity_optional) = match self.heap.get(frame.function) {
            Some(Obj::Function(f)) => (f.arity as usize, f.arity_optional as usize),
            _ => (0, 0),
        };

        let arg_count = self.stack.len() - frame.slot_base - 1 - arity_optional;

        let mut defaults = vec![Value::Nil; arity_optional];
        for slot in (0..arity_optional).rev() {
            defaults[slot] = self.pop();
        }

        let provided_optional = arg_count.saturating_sub(arity);
        for default in defaults.into_iter().skip(provided_optional) {
            self.push(default);
        }
    }

    /// Method dispatch on a receiver: instance fields first, then class
    /// methods; classes dispatch statics; the primitive types use their
    /// method tables.
    pub(crate) fn invoke(&mut self, name: ObjId, arg_count: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count as usize);

        if let Value::Number(_) = receiver {
            return self.invoke_type_method(TypeTable::Number, name, arg_count);
        }

        let Some(id) = receiver.as_obj() else {
            return Err(self.runtime_error("Only instances have methods."));
        };

        enum Plan {
            Field(Value),
            ClassMethod(ObjId),
            Static(Value),
            TypeTable(TypeTable),
            NoSuchProperty,
        }

        let plan = match self.heap.get(id) {
            Some(Obj::Instance(instance)) => {
                if let Some(value) = self.table_get(&instance.fields, name) {
                    Plan::Field(value)
                } else {
                    Plan::ClassMethod(instance.class)
                }
            }
            Some(Obj::Class(class)) => match self.table_get(&class.methods, name) {
                Some(value) => Plan::Static(value),
                None => Plan::NoSuchProperty,
            },
            Some(Obj::String(_)) => Plan::TypeTable(TypeTable::String),
            Some(Obj::List(_)) => Plan::TypeTable(TypeTable::List),
            Some(Obj::Dict(_)) => Plan::TypeTable(TypeTable::Dict),
            Some(Obj::File(_)) => Plan::TypeTable(TypeTable::File),
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };

        match plan {
            Plan::Field(value) => {
                // The field's value becomes the callee.
                let slot = self.stack.len() - arg_count as usize - 1;
                self.stack[slot] = value;
                self.call_value(value, arg_count)
            }
            Plan::ClassMethod(class) => self.invoke_from_class(class, name, arg_count),
            Plan::Static(value) => match value {
                Value::Obj(callee_id) => match self.heap.get(callee_id) {
                    Some(Obj::Native(native)) => {
                        let index = native.native;
                        self.call_registry_native(index, arg_count)
                    }
                    Some(Obj::Closure(_)) => self.call_closure(callee_id, arg_count),
                    _ => self.call_value(value, arg_count),
                },
                _ => self.call_value(value, arg_count),
            },
            Plan::TypeTable(table) => self.invoke_type_method(table, name, arg_count),
            Plan::NoSuchProperty => {
                let text = self.heap.string(name).unwrap_or("?").to_string();
                Err(self.runtime_error(format!("Undefined property '{}'.", text)))
            }
        }
    }

    fn invoke_type_method(
        &mut self,
        table: TypeTable,
        name: ObjId,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let method_name = self.heap.string(name).unwrap_or("?").to_string();

        let methods = match table {
            TypeTable::String => &self.string_methods,
            TypeTable::Number => &self.number_methods,
            TypeTable::List => &self.list_methods,
            TypeTable::Dict => &self.dict_methods,
            TypeTable::File => &self.file_methods,
        };

        let Some(&native) = methods.get(method_name.as_str()) else {
            return Err(self.runtime_error(format!(
                "'{}' has no method '{}'.",
                table.type_name(),
                method_name
            )));
        };

        self.call_type_native(native, arg_count)
    }

    /// Invoke `name` resolved on a class's method table, with the
    /// receiver already sitting in slot zero.
    pub(crate) fn invoke_from_class(
        &mut self,
        class: ObjId,
        name: ObjId,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let method = match self.heap.get(class) {
            Some(Obj::Class(c)) => self.table_get(&c.methods, name),
            _ => None,
        };

        match method {
            Some(Value::Obj(closure)) => self.call_closure(closure, arg_count),
            _ => {
                let text = self.heap.string(name).unwrap_or("?").to_string();
                Err(self.runtime_error(format!("Undefined property '{}'.", text)))
            }
        }
    }

    fn op_define_method(&mut self, name: ObjId, on_trait: bool) -> Result<(), RuntimeError> {
        let method = self.peek(0);
        let holder = self.peek(1);
        let hash = self.heap.string_hash(name).unwrap_or(0);

        let Some(id) = holder.as_obj() else {
            return Err(self.runtime_error("Corrupt method target."));
        };

        match (on_trait, self.heap.get_mut(id)) {
            (false, Some(Obj::Class(class))) => {
                class.methods.set(name, hash, method);
            }
            (true, Some(Obj::Trait(tr))) => {
                tr.methods.set(name, hash, method);
            }
            _ => return Err(self.runtime_error("Corrupt method target.")),
        }

        self.pop();
        Ok(())
    }

    fn op_subclass(&mut self) -> Result<(), RuntimeError> {
        let class_value = self.peek(0);
        let super_value = self.peek(1);

        let (Some(class_id), Some(super_id)) = (class_value.as_obj(), super_value.as_obj())
        else {
            return Err(self.runtime_error("Superclass must be a class."));
        };

        // Copy the superclass's methods in before any of the subclass's
        // own are installed, so child methods override.
        let inherited = match self.heap.get(super_id) {
            Some(Obj::Class(superclass)) => superclass.methods.clone(),
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };

        match self.heap.get_mut(class_id) {
            Some(Obj::Class(class)) => {
                inherited.copy_into(&mut class.methods);
                class.superclass = Some(super_id);
                Ok(())
            }
            _ => Err(self.runtime_error("Superclass must be a class.")),
        }
    }

    fn op_use_trait(&mut self) -> Result<(), RuntimeError> {
        let trait_value = self.pop();
        let class_value = self.peek(0);

        let Some(trait_id) = trait_value.as_obj() else {
            return Err(self.runtime_error("Can only use traits."));
        };
        let methods = match self.heap.get(trait_id) {
            Some(Obj::Trait(tr)) => tr.methods.clone(),
            _ => return Err(self.runtime_error("Can only use traits.")),
        };

        let Some(class_id) = class_value.as_obj() else {
            return Err(self.runtime_error("Can only use traits in classes."));
        };
        match self.heap.get_mut(class_id) {
            Some(Obj::Class(class)) => {
                methods.copy_into(&mut class.methods);
                Ok(())
            }
            _ => Err(self.runtime_error("Can only use traits in classes.")),
        }
    }

    fn op_open_file(&mut self) -> Result<(), RuntimeError> {
        let mode_value = self.pop();
        let path_value = self.pop();

        let (Some(path_id), Some(mode_id)) =
            (self.string_id(path_value), self.string_id(mode_value))
        else {
            return Err(self.runtime_error("File path and mode must be strings."));
        };
        let path = self.heap.string(path_id).unwrap_or("").to_string();
        let mode = self.heap.string(mode_id).unwrap_or("").to_string();

        let mut options = OpenOptions::new();
        match mode.as_str() {
            "r" => options.read(true),
            "r+" => options.read(true).write(true),
            "w" => options.write(true).create(true).truncate(true),
            "w+" => options.read(true).write(true).create(true).truncate(true),
            "a" => options.append(true).create(true),
            "a+" => options.read(true).append(true).create(true),
            _ => {
                return Err(self.runtime_error(format!("Invalid file mode '{}'.", mode)));
            }
        };

        match options.open(&path) {
            Ok(file) => {
                let id = self.heap.alloc(Obj::File(ObjFile {
                    file: Some(file),
                    path,
                    mode,
                }));
                self.push(Value::Obj(id));
                Ok(())
            }
            Err(err) => Err(self.runtime_error(format!("Unable to open file '{}': {}.", path, err))),
        }
    }

    fn instance_of(&self, value: Value) -> Option<ObjId> {
        let id = value.as_obj()?;
        match self.heap.get(id) {
            Some(Obj::Instance(_)) => Some(id),
            _ => None,
        }
    }

    pub(crate) fn string_id(&self, value: Value) -> Option<ObjId> {
        let id = value.as_obj()?;
        match self.heap.get(id) {
            Some(Obj::String(_)) => Some(id),
            _ => None,
        }
    }
}

/// Which built-in type's method table to dispatch through.
#[derive(Debug, Clone, Copy)]
enum TypeTable {
    String,
    Number,
    List,
    Dict,
    File,
}

impl TypeTable {
    fn type_name(self) -> &'static str {
        match self {
            TypeTable::String => "string",
            TypeTable::Number => "number",
            TypeTable::List => "list",
            TypeTable::Dict => "dict",
            TypeTable::File => "file",
        }
    }
}

/// Resolve a possibly-negative index against a length.
fn normalize_index(n: f64, len: usize) -> Option<usize> {
    let mut index = n as i64;
    if index < 0 {
        index += len as i64;
    }
    if index >= 0 && (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

/// A slice bound: the Empty sentinel takes the default, numbers clamp
/// into range, negatives count from the end.
fn slice_bound(value: Value, len: usize, default: usize) -> Option<usize> {
    match value {
        Value::Empty => Some(default),
        Value::Number(n) => {
            let mut index = n as i64;
            if index < 0 {
                index += len as i64;
            }
            Some(index.clamp(0, len as i64) as usize)
        }
        _ => None,
    }
}
