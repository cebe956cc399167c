//! Builtin modules and the import machinery.
//!
//! `import "Math";` and friends short-circuit to a module class whose
//! method table holds natives (and the odd constant); anything else is a
//! file path, compiled and executed exactly once, with the module cache
//! guaranteeing single-execution semantics.

use crate::vm::{NativeFn, Vm};
use builtins::{DatetimeLib, EnvLib, JsonLib, MathLib, PathLib, SystemLib};
use core_types::{ObjId, RuntimeError, Value};
use memory_manager::{Obj, ObjClass, ObjClosure, ObjDict, ObjList, ObjNative, Table};

/// Builtin module names recognised by `import`.
const BUILTIN_MODULES: &[&str] = &[
    "Math", "Env", "System", "JSON", "Path", "Datetime", "Socket", "Random", "HTTP", "Sqlite",
];

impl Vm {
    /// Import the module named by the interned `path` string, leaving
    /// the module value (or the module script's closure call) on the
    /// stack.
    pub(crate) fn import_module(&mut self, path_id: ObjId) -> Result<(), RuntimeError> {
        // Cached: already imported, nothing re-executes.
        if let Some(cached) = self.table_get(&self.modules, path_id) {
            self.push(cached);
            return Ok(());
        }

        let path = self.heap.string(path_id).unwrap_or("").to_string();

        if BUILTIN_MODULES.contains(&path.as_str()) {
            let class = self.register_builtin_module(&path, path_id);
            self.push(Value::Obj(class));
            return Ok(());
        }

        // A file import: compile the module source and call it as a
        // zero-argument closure in place; its return value (nil) becomes
        // the import's result.
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(_) => {
                return Err(self.runtime_error(format!("Unable to open module '{}'.", path)));
            }
        };

        let function = match compiler::compile(&mut self.heap, &source, false) {
            Ok(function) => function,
            Err(err) => {
                return Err(self.runtime_error(format!(
                    "Error compiling module '{}':\n{}",
                    path, err
                )));
            }
        };

        // Cache before executing so import cycles terminate.
        let hash = self.heap.string_hash(path_id).unwrap_or(0);
        self.modules.set(path_id, hash, Value::Nil);

        self.push(Value::Obj(function));
        let closure = self.heap.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop();
        self.push(Value::Obj(closure));

        self.call_closure(closure, 0)
    }

    /// Build a builtin module: a class whose method table holds natives,
    /// bound both as a global under the module's name and in the module
    /// cache.
    fn register_builtin_module(&mut self, name: &str, path_id: ObjId) -> ObjId {
        let natives: &[(&str, NativeFn)] = match name {
            "Math" => &[
                ("sqrt", math_sqrt),
                ("abs", math_abs),
                ("floor", math_floor),
                ("ceil", math_ceil),
                ("round", math_round),
                ("sin", math_sin),
                ("cos", math_cos),
                ("tan", math_tan),
                ("max", math_max),
                ("min", math_min),
            ],
            "Env" => &[("get", env_get), ("set", env_set), ("remove", env_remove)],
            "System" => &[
                ("time", system_time),
                ("clock", system_clock),
                ("platform", system_platform),
            ],
            "JSON" => &[("parse", json_parse), ("stringify", json_stringify)],
            "Path" => &[
                ("exists", path_exists),
                ("isDir", path_is_dir),
                ("basename", path_basename),
                ("dirname", path_dirname),
                ("extname", path_extname),
            ],
            "Datetime" => &[("now", datetime_now), ("strftime", datetime_strftime)],
            "Random" => &[("random", random_random), ("range", random_range)],
            // Surfaces out of scope: the natives register and report
            // through the standard error hook.
            "Socket" => &[("connect", module_unavailable), ("bind", module_unavailable)],
            "HTTP" => &[("get", module_unavailable), ("post", module_unavailable)],
            "Sqlite" => &[
                ("connect", module_unavailable),
                ("execute", module_unavailable),
            ],
            _ => &[],
        };

        let mut methods = Table::new();
        for &(method_name, native) in natives {
            let index = self.natives.len();
            self.natives.push(native);

            let name_id = self.heap.intern(method_name);
            let obj = self.heap.alloc(Obj::Native(ObjNative {
                name: name_id,
                native: index,
            }));
            let hash = self.heap.string_hash(name_id).unwrap_or(0);
            methods.set(name_id, hash, Value::Obj(obj));
        }

        // Module constants live in the same table; property access on
        // the class returns them directly.
        if name == "Math" {
            let pi = self.heap.intern("pi");
            let hash = self.heap.string_hash(pi).unwrap_or(0);
            methods.set(pi, hash, Value::Number(std::f64::consts::PI));
            let e = self.heap.intern("e");
            let hash = self.heap.string_hash(e).unwrap_or(0);
            methods.set(e, hash, Value::Number(std::f64::consts::E));
        }

        let class = self.heap.alloc(Obj::Class(ObjClass {
            name: path_id,
            methods,
            superclass: None,
        }));

        self.globals_set(path_id, Value::Obj(class));
        let hash = self.heap.string_hash(path_id).unwrap_or(0);
        self.modules.set(path_id, hash, Value::Obj(class));

        class
    }
}

fn number_arg(args: &[Value], index: usize, name: &str) -> Result<f64, String> {
    match args.get(index) {
        Some(Value::Number(n)) => Ok(*n),
        _ => Err(format!("Argument passed to {}() must be a number.", name)),
    }
}

fn string_arg(vm: &Vm, args: &[Value], index: usize, name: &str) -> Result<String, String> {
    args.get(index)
        .and_then(|v| v.as_obj())
        .and_then(|id| vm.heap().string(id))
        .map(str::to_string)
        .ok_or_else(|| format!("Argument passed to {}() must be a string.", name))
}

fn numbers(args: &[Value], name: &str) -> Result<Vec<f64>, String> {
    args.iter()
        .map(|v| match v {
            Value::Number(n) => Ok(*n),
            _ => Err(format!("Arguments passed to {}() must be numbers.", name)),
        })
        .collect()
}

// ---- Math ----------------------------------------------------------------

fn math_sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(MathLib::sqrt(number_arg(args, 0, "sqrt")?)))
}

fn math_abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(MathLib::abs(number_arg(args, 0, "abs")?)))
}

fn math_floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(MathLib::floor(number_arg(args, 0, "floor")?)))
}

fn math_ceil(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(MathLib::ceil(number_arg(args, 0, "ceil")?)))
}

fn math_round(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(MathLib::round(number_arg(args, 0, "round")?)))
}

fn math_sin(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(MathLib::sin(number_arg(args, 0, "sin")?)))
}

fn math_cos(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(MathLib::cos(number_arg(args, 0, "cos")?)))
}

fn math_tan(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(MathLib::tan(number_arg(args, 0, "tan")?)))
}

fn math_max(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.is_empty() {
        return Err("max() takes at least 1 argument (0 given)".to_string());
    }
    Ok(Value::Number(MathLib::max(&numbers(args, "max")?)))
}

fn math_min(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    if args.is_empty() {
        return Err("min() takes at least 1 argument (0 given)".to_string());
    }
    Ok(Value::Number(MathLib::min(&numbers(args, "min")?)))
}

// ---- Env -----------------------------------------------------------------

fn env_get(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = string_arg(vm, args, 0, "get")?;
    match EnvLib::get(&name) {
        Some(value) => Ok(Value::Obj(vm.heap.intern(&value))),
        None => Ok(Value::Nil),
    }
}

fn env_set(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = string_arg(vm, args, 0, "set")?;
    let value = string_arg(vm, args, 1, "set")?;
    EnvLib::set(&name, &value);
    Ok(Value::Nil)
}

fn env_remove(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let name = string_arg(vm, args, 0, "remove")?;
    EnvLib::remove(&name);
    Ok(Value::Nil)
}

// ---- System --------------------------------------------------------------

fn system_time(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(SystemLib::time()))
}

fn system_clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(SystemLib::clock()))
}

fn system_platform(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Obj(vm.heap.intern(SystemLib::platform())))
}

// ---- JSON ----------------------------------------------------------------

fn json_parse(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let text = string_arg(vm, args, 0, "parse")?;
    let parsed = JsonLib::parse(&text).map_err(|e| format!("JSON parse error: {}", e))?;
    Ok(json_to_value(vm, &parsed))
}

fn json_stringify(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let value = args
        .first()
        .copied()
        .ok_or_else(|| "stringify() takes 1 argument (0 given)".to_string())?;
    let json = value_to_json(vm, value, 0)?;
    let text = JsonLib::stringify(&json);
    Ok(Value::Obj(vm.heap.intern(&text)))
}

fn json_to_value(vm: &mut Vm, json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Value::Obj(vm.heap.intern(s)),
        serde_json::Value::Array(items) => {
            let converted: Vec<Value> = items.iter().map(|item| json_to_value(vm, item)).collect();
            Value::Obj(vm.heap.alloc(Obj::List(ObjList { items: converted })))
        }
        serde_json::Value::Object(map) => {
            let mut dict = ObjDict::default();
            for (key, item) in map {
                let key_id = vm.heap.intern(key);
                let key_value = Value::Obj(key_id);
                let converted = json_to_value(vm, item);
                if let Some(hash) = vm.heap.value_hash(key_value) {
                    dict.items.set(key_value, hash, converted);
                }
            }
            Value::Obj(vm.heap.alloc(Obj::Dict(dict)))
        }
    }
}

fn value_to_json(vm: &Vm, value: Value, depth: usize) -> Result<serde_json::Value, String> {
    if depth > 64 {
        return Err("Cannot stringify deeply nested values.".to_string());
    }

    Ok(match value {
        Value::Nil | Value::Empty => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Number(n) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Obj(id) => match vm.heap().get(id) {
            Some(Obj::String(s)) => serde_json::Value::String(s.chars.clone()),
            Some(Obj::List(l)) => {
                let mut items = Vec::with_capacity(l.items.len());
                for &item in &l.items {
                    items.push(value_to_json(vm, item, depth + 1)?);
                }
                serde_json::Value::Array(items)
            }
            Some(Obj::Dict(d)) => {
                let mut map = serde_json::Map::new();
                for (key, item) in d.items.iter() {
                    let key_text = match key.as_obj().and_then(|k| vm.heap().string(k)) {
                        Some(s) => s.to_string(),
                        None => vm.value_to_string(key),
                    };
                    map.insert(key_text, value_to_json(vm, item, depth + 1)?);
                }
                serde_json::Value::Object(map)
            }
            _ => return Err("Cannot stringify this value.".to_string()),
        },
    })
}

// ---- Path ----------------------------------------------------------------

fn path_exists(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = string_arg(vm, args, 0, "exists")?;
    Ok(Value::Bool(PathLib::exists(&path)))
}

fn path_is_dir(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = string_arg(vm, args, 0, "isDir")?;
    Ok(Value::Bool(PathLib::is_dir(&path)))
}

fn path_basename(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = string_arg(vm, args, 0, "basename")?;
    let result = PathLib::basename(&path);
    Ok(Value::Obj(vm.heap.intern(&result)))
}

fn path_dirname(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = string_arg(vm, args, 0, "dirname")?;
    let result = PathLib::dirname(&path);
    Ok(Value::Obj(vm.heap.intern(&result)))
}

fn path_extname(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let path = string_arg(vm, args, 0, "extname")?;
    let result = PathLib::extname(&path);
    Ok(Value::Obj(vm.heap.intern(&result)))
}

// ---- Datetime ------------------------------------------------------------

fn datetime_now(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Obj(vm.heap.intern(&DatetimeLib::now())))
}

fn datetime_strftime(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let timestamp = number_arg(args, 0, "strftime")?;
    let formatted = DatetimeLib::format_timestamp(timestamp as i64);
    Ok(Value::Obj(vm.heap.intern(&formatted)))
}

// ---- Random --------------------------------------------------------------

fn random_random(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.rng.random()))
}

fn random_range(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let lo = number_arg(args, 0, "range")?;
    let hi = number_arg(args, 1, "range")?;
    Ok(Value::Number(vm.rng.range(lo as i64, hi as i64) as f64))
}

// ---- unavailable surfaces ------------------------------------------------

fn module_unavailable(_vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Err("This module is not available in this build.".to_string())
}
