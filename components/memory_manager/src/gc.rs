//! Mark-and-sweep garbage collection.
//!
//! Precise, stop-the-world. The VM enumerates its roots (value stack,
//! frame closures, open upvalues, globals, modules, the `init` string)
//! into the mark phase, the heap adds its own temporary roots, and
//! [`Heap::finish_cycle`] traces the gray worklist, drops intern-pool
//! entries for unmarked strings, and sweeps.
//!
//! Marking uses an explicit worklist rather than recursion: marking an
//! object sets its bit and pushes it gray; tracing pops gray objects and
//! marks their referents until the worklist drains. Strings, natives and
//! files are leaves.

use crate::heap::Heap;
use crate::object::Obj;
use crate::table::Table;
use core_types::{ObjId, Value};

impl Heap {
    /// Mark a root value.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(id) = value {
            self.mark_object(id);
        }
    }

    /// Mark a root object and queue it for tracing.
    pub fn mark_object(&mut self, id: ObjId) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        if entry.marked {
            return;
        }
        entry.marked = true;
        self.gray.push(id);
    }

    /// Mark every key and value of an externally-owned table (globals,
    /// modules).
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    /// Trace the gray worklist to a fixpoint, then remove unmarked
    /// interned strings and sweep dead objects. The collection threshold
    /// grows geometrically from the surviving byte count.
    pub fn finish_cycle(&mut self) {
        self.mark_temp_roots();
        self.trace_references();
        self.remove_unmarked_strings();
        self.sweep_entries();
    }

    /// Drain the gray worklist, marking referents of each gray object.
    fn trace_references(&mut self) {
        while let Some(id) = self.gray.pop() {
            self.blacken(id);
        }
    }

    /// Mark everything the object behind `id` references.
    fn blacken(&mut self, id: ObjId) {
        let mut refs: Vec<Value> = Vec::new();

        match self.get(id) {
            Some(Obj::Function(function)) => {
                if let Some(name) = function.name {
                    refs.push(Value::Obj(name));
                }
                refs.extend(function.chunk.constants.iter().copied());
            }
            Some(Obj::Closure(closure)) => {
                refs.push(Value::Obj(closure.function));
                refs.extend(closure.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            Some(Obj::Upvalue(upvalue)) => {
                if let crate::object::ObjUpvalue::Closed(value) = upvalue {
                    refs.push(*value);
                }
            }
            Some(Obj::Class(class)) => {
                refs.push(Value::Obj(class.name));
                if let Some(superclass) = class.superclass {
                    refs.push(Value::Obj(superclass));
                }
                for (key, value) in class.methods.iter() {
                    refs.push(Value::Obj(key));
                    refs.push(value);
                }
            }
            Some(Obj::Trait(tr)) => {
                refs.push(Value::Obj(tr.name));
                for (key, value) in tr.methods.iter() {
                    refs.push(Value::Obj(key));
                    refs.push(value);
                }
            }
            Some(Obj::Instance(instance)) => {
                refs.push(Value::Obj(instance.class));
                for (key, value) in instance.fields.iter() {
                    refs.push(Value::Obj(key));
                    refs.push(value);
                }
            }
            Some(Obj::BoundMethod(bound)) => {
                refs.push(bound.receiver);
                refs.push(Value::Obj(bound.method));
            }
            Some(Obj::List(list)) => {
                refs.extend(list.items.iter().copied());
            }
            Some(Obj::Dict(dict)) => {
                for (key, value) in dict.items.iter() {
                    refs.push(key);
                    refs.push(value);
                }
            }
            Some(Obj::Native(native)) => {
                refs.push(Value::Obj(native.name));
            }
            // Strings and files are leaves; dead slots have nothing to do.
            Some(Obj::String(_)) | Some(Obj::File(_)) | None => {}
        }

        for value in refs {
            self.mark_value(value);
        }
    }

    /// Interned strings are weak: drop pool entries whose string was not
    /// marked, so sweep can reclaim them.
    fn remove_unmarked_strings(&mut self) {
        let Heap {
            strings, entries, ..
        } = self;
        strings.retain_keys(|key| {
            entries
                .get(key.0)
                .and_then(|e| e.as_ref())
                .is_some_and(|e| e.marked)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjClass, ObjInstance, ObjList};

    #[test]
    fn test_unreachable_object_swept() {
        let mut heap = Heap::new();
        let live = heap.alloc(Obj::List(ObjList::default()));
        let dead = heap.alloc(Obj::List(ObjList::default()));

        heap.mark_value(Value::Obj(live));
        heap.finish_cycle();

        assert!(heap.get(live).is_some());
        assert!(heap.get(dead).is_none());
    }

    #[test]
    fn test_references_keep_objects_alive() {
        let mut heap = Heap::new();
        let inner = heap.alloc(Obj::List(ObjList::default()));
        let outer = heap.alloc(Obj::List(ObjList {
            items: vec![Value::Obj(inner)],
        }));

        heap.mark_value(Value::Obj(outer));
        heap.finish_cycle();

        assert!(heap.get(inner).is_some());
        assert!(heap.get(outer).is_some());
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = Heap::new();
        let a = heap.alloc(Obj::List(ObjList::default()));
        let b = heap.alloc(Obj::List(ObjList {
            items: vec![Value::Obj(a)],
        }));
        match heap.get_mut(a) {
            Some(Obj::List(list)) => list.items.push(Value::Obj(b)),
            _ => unreachable!(),
        }

        // Nothing roots the cycle.
        heap.finish_cycle();
        assert!(heap.get(a).is_none());
        assert!(heap.get(b).is_none());
    }

    #[test]
    fn test_unmarked_strings_leave_intern_pool() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let _dropped = heap.intern("dropped");
        assert_eq!(heap.interned_count(), 2);

        heap.mark_value(Value::Obj(kept));
        heap.finish_cycle();

        assert_eq!(heap.interned_count(), 1);
        // Re-interning the dropped contents allocates a fresh object.
        let again = heap.intern("dropped");
        assert!(heap.get(again).is_some());
    }

    #[test]
    fn test_class_marks_methods_and_superclass() {
        let mut heap = Heap::new();
        let super_name = heap.intern("Base");
        let superclass = heap.alloc(Obj::Class(ObjClass {
            name: super_name,
            methods: Table::new(),
            superclass: None,
        }));
        let name = heap.intern("Derived");
        let class = heap.alloc(Obj::Class(ObjClass {
            name,
            methods: Table::new(),
            superclass: Some(superclass),
        }));
        let instance = heap.alloc(Obj::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));

        heap.mark_value(Value::Obj(instance));
        heap.finish_cycle();

        assert!(heap.get(superclass).is_some());
        assert!(heap.get(super_name).is_some());
        assert!(heap.get(class).is_some());
    }

    #[test]
    fn test_temp_roots_survive() {
        let mut heap = Heap::new();
        let mark = heap.temp_root_count();
        let rooted = heap.alloc(Obj::List(ObjList::default()));
        heap.push_temp_root(Value::Obj(rooted));

        heap.finish_cycle();
        assert!(heap.get(rooted).is_some());

        heap.truncate_temp_roots(mark);
        heap.finish_cycle();
        assert!(heap.get(rooted).is_none());
    }
}
