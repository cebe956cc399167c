//! Native function registration.
//!
//! Globals (`print`, `assert`, `type`, …) and the per-type method tables
//! (`stringMethods`, `listMethods`, `dictMethods`, `fileMethods`,
//! `numberMethods`). A native receives the VM and its arguments and
//! returns a value or an error message; type methods additionally get
//! their receiver as `args[0]`.

use crate::vm::{NativeFn, Vm};
use builtins::SystemLib;
use core_types::{ObjId, Value};
use memory_manager::{Obj, ObjList, ObjNative};
use std::io::{Read, Write};

/// Register the standard globals and type-method tables on a fresh VM.
pub(crate) fn register(vm: &mut Vm) {
    define_global(vm, "print", native_print);
    define_global(vm, "assert", native_assert);
    define_global(vm, "type", native_type);
    define_global(vm, "str", native_str);
    define_global(vm, "bool", native_bool);
    define_global(vm, "len", native_len);
    define_global(vm, "time", native_time);

    vm.string_methods.insert("len", string_len);
    vm.string_methods.insert("lower", string_lower);
    vm.string_methods.insert("upper", string_upper);
    vm.string_methods.insert("contains", string_contains);
    vm.string_methods.insert("startsWith", string_starts_with);
    vm.string_methods.insert("endsWith", string_ends_with);
    vm.string_methods.insert("split", string_split);
    vm.string_methods.insert("replace", string_replace);
    vm.string_methods.insert("find", string_find);
    vm.string_methods.insert("trim", string_trim);

    vm.number_methods.insert("toString", number_to_string);

    vm.list_methods.insert("len", list_len);
    vm.list_methods.insert("push", list_push);
    vm.list_methods.insert("pop", list_pop);
    vm.list_methods.insert("insert", list_insert);
    vm.list_methods.insert("contains", list_contains);
    vm.list_methods.insert("join", list_join);

    vm.dict_methods.insert("len", dict_len);
    vm.dict_methods.insert("get", dict_get);
    vm.dict_methods.insert("exists", dict_exists);
    vm.dict_methods.insert("remove", dict_remove);
    vm.dict_methods.insert("keys", dict_keys);

    vm.file_methods.insert("read", file_read);
    vm.file_methods.insert("readLine", file_read_line);
    vm.file_methods.insert("write", file_write);
    vm.file_methods.insert("writeLine", file_write_line);
    vm.file_methods.insert("close", file_close);
}

/// Register one native as a global: the function pointer goes into the
/// registry, a `Native` object wraps the index, and the global binds it.
pub(crate) fn define_global(vm: &mut Vm, name: &str, native: NativeFn) {
    let index = vm.natives.len();
    vm.natives.push(native);

    let name_id = vm.heap.intern(name);
    let obj = vm.heap.alloc(Obj::Native(ObjNative {
        name: name_id,
        native: index,
    }));
    let hash = vm.heap.string_hash(name_id).unwrap_or(0);
    vm.globals.set(name_id, hash, Value::Obj(obj));
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!(
            "{}() takes {} argument(s) ({} given)",
            name,
            expected,
            args.len()
        ));
    }
    Ok(())
}

fn receiver_string(vm: &Vm, args: &[Value]) -> Result<String, String> {
    match args[0].as_obj().and_then(|id| vm.heap().string(id)) {
        Some(s) => Ok(s.to_string()),
        None => Err("Expected a string receiver.".to_string()),
    }
}

fn argument_string(vm: &Vm, value: Value, what: &str) -> Result<String, String> {
    match value.as_obj().and_then(|id| vm.heap().string(id)) {
        Some(s) => Ok(s.to_string()),
        None => Err(format!("{} must be a string.", what)),
    }
}

// ---- globals -------------------------------------------------------------

fn native_print(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let rendered: Vec<String> = args.iter().map(|&v| vm.value_to_string(v)).collect();
    println!("{}", rendered.join(" "));
    Ok(Value::Nil)
}

fn native_assert(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("assert", args, 1)?;
    if args[0].is_falsy() {
        return Err("assert() was false!".to_string());
    }
    Ok(Value::Nil)
}

fn native_type(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("type", args, 1)?;
    let name = match args[0] {
        Value::Obj(id) => vm.heap().get(id).map(|o| o.type_name()).unwrap_or("obj"),
        other => other.type_name(),
    };
    let id = vm.heap.intern(name);
    Ok(Value::Obj(id))
}

fn native_str(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("str", args, 1)?;
    let text = vm.value_to_string(args[0]);
    let id = vm.heap.intern(&text);
    Ok(Value::Obj(id))
}

fn native_bool(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("bool", args, 1)?;
    Ok(Value::Bool(args[0].is_truthy()))
}

fn native_len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("len", args, 1)?;
    let length = match args[0].as_obj().and_then(|id| vm.heap().get(id)) {
        Some(Obj::String(s)) => s.chars.chars().count(),
        Some(Obj::List(l)) => l.items.len(),
        Some(Obj::Dict(d)) => d.items.len(),
        _ => return Err("len() requires a string, list or dict.".to_string()),
    };
    Ok(Value::Number(length as f64))
}

fn native_time(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("time", args, 0)?;
    Ok(Value::Number(SystemLib::time()))
}

// ---- string methods ------------------------------------------------------

fn string_len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("len", &args[1..], 0)?;
    let s = receiver_string(vm, args)?;
    Ok(Value::Number(s.chars().count() as f64))
}

fn string_lower(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("lower", &args[1..], 0)?;
    let s = receiver_string(vm, args)?.to_lowercase();
    Ok(Value::Obj(vm.heap.intern(&s)))
}

fn string_upper(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("upper", &args[1..], 0)?;
    let s = receiver_string(vm, args)?.to_uppercase();
    Ok(Value::Obj(vm.heap.intern(&s)))
}

fn string_contains(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("contains", &args[1..], 1)?;
    let s = receiver_string(vm, args)?;
    let needle = argument_string(vm, args[1], "Argument passed to contains()")?;
    Ok(Value::Bool(s.contains(&needle)))
}

fn string_starts_with(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("startsWith", &args[1..], 1)?;
    let s = receiver_string(vm, args)?;
    let prefix = argument_string(vm, args[1], "Argument passed to startsWith()")?;
    Ok(Value::Bool(s.starts_with(&prefix)))
}

fn string_ends_with(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("endsWith", &args[1..], 1)?;
    let s = receiver_string(vm, args)?;
    let suffix = argument_string(vm, args[1], "Argument passed to endsWith()")?;
    Ok(Value::Bool(s.ends_with(&suffix)))
}

fn string_split(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("split", &args[1..], 1)?;
    let s = receiver_string(vm, args)?;
    let separator = argument_string(vm, args[1], "Argument passed to split()")?;

    let parts: Vec<String> = if separator.is_empty() {
        s.chars().map(|c| c.to_string()).collect()
    } else {
        s.split(&separator).map(str::to_string).collect()
    };

    let mut items = Vec::with_capacity(parts.len());
    for part in parts {
        let id = vm.heap.intern(&part);
        items.push(Value::Obj(id));
    }
    let list = vm.heap.alloc(Obj::List(ObjList { items }));
    Ok(Value::Obj(list))
}

fn string_replace(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("replace", &args[1..], 2)?;
    let s = receiver_string(vm, args)?;
    let from = argument_string(vm, args[1], "First argument passed to replace()")?;
    let to = argument_string(vm, args[2], "Second argument passed to replace()")?;
    let replaced = s.replace(&from, &to);
    Ok(Value::Obj(vm.heap.intern(&replaced)))
}

fn string_find(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("find", &args[1..], 1)?;
    let s = receiver_string(vm, args)?;
    let needle = argument_string(vm, args[1], "Argument passed to find()")?;
    match s.find(&needle) {
        // Byte offset back to a character index.
        Some(byte_index) => Ok(Value::Number(s[..byte_index].chars().count() as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn string_trim(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("trim", &args[1..], 0)?;
    let s = receiver_string(vm, args)?;
    Ok(Value::Obj(vm.heap.intern(s.trim())))
}

// ---- number methods ------------------------------------------------------

fn number_to_string(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("toString", &args[1..], 0)?;
    let Value::Number(n) = args[0] else {
        return Err("Expected a number receiver.".to_string());
    };
    let id = vm.heap.intern(&core_types::format_number(n));
    Ok(Value::Obj(id))
}

// ---- list methods --------------------------------------------------------

fn receiver_list(vm: &Vm, args: &[Value]) -> Result<ObjId, String> {
    match args[0].as_obj() {
        Some(id) if matches!(vm.heap().get(id), Some(Obj::List(_))) => Ok(id),
        _ => Err("Expected a list receiver.".to_string()),
    }
}

fn list_len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("len", &args[1..], 0)?;
    let id = receiver_list(vm, args)?;
    let length = match vm.heap().get(id) {
        Some(Obj::List(l)) => l.items.len(),
        _ => 0,
    };
    Ok(Value::Number(length as f64))
}

fn list_push(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("push", &args[1..], 1)?;
    let id = receiver_list(vm, args)?;
    if let Some(Obj::List(l)) = vm.heap.get_mut(id) {
        l.items.push(args[1]);
    }
    Ok(Value::Nil)
}

fn list_pop(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("pop", &args[1..], 0)?;
    let id = receiver_list(vm, args)?;
    match vm.heap.get_mut(id) {
        Some(Obj::List(l)) => l.items.pop().ok_or_else(|| "pop() on an empty list.".to_string()),
        _ => Ok(Value::Nil),
    }
}

fn list_insert(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("insert", &args[1..], 2)?;
    let id = receiver_list(vm, args)?;
    let Value::Number(index) = args[1] else {
        return Err("First argument passed to insert() must be a number.".to_string());
    };
    if let Some(Obj::List(l)) = vm.heap.get_mut(id) {
        let index = (index as i64).clamp(0, l.items.len() as i64) as usize;
        l.items.insert(index, args[2]);
    }
    Ok(Value::Nil)
}

fn list_contains(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("contains", &args[1..], 1)?;
    let id = receiver_list(vm, args)?;
    let found = match vm.heap().get(id) {
        Some(Obj::List(l)) => l.items.contains(&args[1]),
        _ => false,
    };
    Ok(Value::Bool(found))
}

fn list_join(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() > 2 {
        return Err(format!("join() takes 0 or 1 argument(s) ({} given)", args.len() - 1));
    }
    let id = receiver_list(vm, args)?;
    let separator = if args.len() == 2 {
        argument_string(vm, args[1], "Argument passed to join()")?
    } else {
        ", ".to_string()
    };

    let items = match vm.heap().get(id) {
        Some(Obj::List(l)) => l.items.clone(),
        _ => Vec::new(),
    };
    let rendered: Vec<String> = items.iter().map(|&v| vm.value_to_string(v)).collect();
    let joined = rendered.join(&separator);
    Ok(Value::Obj(vm.heap.intern(&joined)))
}

// ---- dict methods --------------------------------------------------------

fn receiver_dict(vm: &Vm, args: &[Value]) -> Result<ObjId, String> {
    match args[0].as_obj() {
        Some(id) if matches!(vm.heap().get(id), Some(Obj::Dict(_))) => Ok(id),
        _ => Err("Expected a dict receiver.".to_string()),
    }
}

fn dict_key_hash(vm: &Vm, key: Value) -> Result<u32, String> {
    vm.heap()
        .value_hash(key)
        .ok_or_else(|| "Dictionary key must be a string, number, bool or nil.".to_string())
}

fn dict_len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("len", &args[1..], 0)?;
    let id = receiver_dict(vm, args)?;
    let length = match vm.heap().get(id) {
        Some(Obj::Dict(d)) => d.items.len(),
        _ => 0,
    };
    Ok(Value::Number(length as f64))
}

fn dict_get(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.len() < 2 || args.len() > 3 {
        return Err(format!("get() takes 1 or 2 argument(s) ({} given)", args.len() - 1));
    }
    let id = receiver_dict(vm, args)?;
    let hash = dict_key_hash(vm, args[1])?;
    let fallback = args.get(2).copied().unwrap_or(Value::Nil);

    let value = match vm.heap().get(id) {
        Some(Obj::Dict(d)) => d.items.get(args[1], hash),
        _ => None,
    };
    Ok(value.unwrap_or(fallback))
}

fn dict_exists(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("exists", &args[1..], 1)?;
    let id = receiver_dict(vm, args)?;
    let hash = dict_key_hash(vm, args[1])?;
    let exists = match vm.heap().get(id) {
        Some(Obj::Dict(d)) => d.items.get(args[1], hash).is_some(),
        _ => false,
    };
    Ok(Value::Bool(exists))
}

fn dict_remove(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("remove", &args[1..], 1)?;
    let id = receiver_dict(vm, args)?;
    let hash = dict_key_hash(vm, args[1])?;
    let removed = match vm.heap.get_mut(id) {
        Some(Obj::Dict(d)) => d.items.delete(args[1], hash),
        _ => false,
    };
    if !removed {
        let key = vm.value_repr(args[1]);
        return Err(format!("Key {} does not exist within dictionary.", key));
    }
    Ok(Value::Nil)
}

fn dict_keys(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("keys", &args[1..], 0)?;
    let id = receiver_dict(vm, args)?;
    let keys: Vec<Value> = match vm.heap().get(id) {
        Some(Obj::Dict(d)) => d.items.iter().map(|(k, _)| k).collect(),
        _ => Vec::new(),
    };
    let list = vm.heap.alloc(Obj::List(ObjList { items: keys }));
    Ok(Value::Obj(list))
}

// ---- file methods --------------------------------------------------------

fn receiver_file(vm: &Vm, args: &[Value]) -> Result<ObjId, String> {
    match args[0].as_obj() {
        Some(id) if matches!(vm.heap().get(id), Some(Obj::File(_))) => Ok(id),
        _ => Err("Expected a file receiver.".to_string()),
    }
}

fn file_read(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("read", &args[1..], 0)?;
    let id = receiver_file(vm, args)?;

    let mut contents = String::new();
    match vm.heap.get_mut(id) {
        Some(Obj::File(f)) => match f.file.as_mut() {
            Some(handle) => {
                handle
                    .read_to_string(&mut contents)
                    .map_err(|e| format!("Unable to read file: {}.", e))?;
            }
            None => return Err("File is closed.".to_string()),
        },
        _ => return Err("Expected a file receiver.".to_string()),
    }

    Ok(Value::Obj(vm.heap.intern(&contents)))
}

fn file_read_line(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("readLine", &args[1..], 0)?;
    let id = receiver_file(vm, args)?;

    let mut bytes = Vec::new();
    match vm.heap.get_mut(id) {
        Some(Obj::File(f)) => match f.file.as_mut() {
            Some(handle) => loop {
                let mut byte = [0u8; 1];
                match handle.read(&mut byte) {
                    Ok(0) => break,
                    Ok(_) if byte[0] == b'\n' => break,
                    Ok(_) => bytes.push(byte[0]),
                    Err(e) => return Err(format!("Unable to read file: {}.", e)),
                }
            },
            None => return Err("File is closed.".to_string()),
        },
        _ => return Err("Expected a file receiver.".to_string()),
    }

    if bytes.is_empty() {
        return Ok(Value::Nil);
    }
    let line = String::from_utf8_lossy(&bytes).into_owned();
    Ok(Value::Obj(vm.heap.intern(&line)))
}

fn file_write(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("write", &args[1..], 1)?;
    let id = receiver_file(vm, args)?;
    let text = argument_string(vm, args[1], "Argument passed to write()")?;

    match vm.heap.get_mut(id) {
        Some(Obj::File(f)) => match f.file.as_mut() {
            Some(handle) => {
                handle
                    .write_all(text.as_bytes())
                    .map_err(|e| format!("Unable to write to file: {}.", e))?;
                Ok(Value::Number(text.len() as f64))
            }
            None => Err("File is closed.".to_string()),
        },
        _ => Err("Expected a file receiver.".to_string()),
    }
}

fn file_write_line(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("writeLine", &args[1..], 1)?;
    let id = receiver_file(vm, args)?;
    let text = argument_string(vm, args[1], "Argument passed to writeLine()")?;

    match vm.heap.get_mut(id) {
        Some(Obj::File(f)) => match f.file.as_mut() {
            Some(handle) => {
                handle
                    .write_all(text.as_bytes())
                    .and_then(|_| handle.write_all(b"\n"))
                    .map_err(|e| format!("Unable to write to file: {}.", e))?;
                Ok(Value::Number(text.len() as f64 + 1.0))
            }
            None => Err("File is closed.".to_string()),
        },
        _ => Err("Expected a file receiver.".to_string()),
    }
}

fn file_close(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    arity("close", &args[1..], 0)?;
    let id = receiver_file(vm, args)?;
    if let Some(Obj::File(f)) = vm.heap.get_mut(id) {
        f.file.take();
    }
    Ok(Value::Nil)
}
