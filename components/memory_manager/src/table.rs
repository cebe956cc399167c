//! Open-addressing hash tables.
//!
//! Two variants share the same probing scheme: [`Table`] maps interned
//! strings (compared by handle identity) to values and backs globals,
//! fields, methods, and the intern pool itself; [`DictTable`] maps
//! hashable `Value` keys to values and backs user dictionaries.
//!
//! Linear probing, power-of-two capacity, 0.75 load factor. Deleting
//! inserts a tombstone so probe chains stay intact: tombstones count as
//! filled during lookup but are reusable during insert. Resizing rehashes
//! live entries and drops tombstones.

use core_types::{ObjId, Value};

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;
const INITIAL_CAPACITY: usize = 8;

/// One slot of a string-keyed table.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Empty,
    Tombstone,
    Full { key: ObjId, hash: u32, value: Value },
}

/// Open-addressed map from interned string to value.
///
/// Keys are compared by handle identity; the hash is the string's cached
/// content hash, stored alongside the key so resizing never needs to
/// consult the heap.
#[derive(Debug, Clone, Default)]
pub struct Table {
    slots: Vec<Slot>,
    /// Live entries plus tombstones; drives the load-factor check
    count: usize,
}

impl Table {
    /// Create an empty table. No capacity is reserved until first insert.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether the table has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Look up `key`, identified by its cached `hash`.
    pub fn get(&self, key: ObjId, hash: u32) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        match self.slots[self.find_slot(key, hash)] {
            Slot::Full { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Insert or overwrite `key`. Returns true when the key was new.
    pub fn set(&mut self, key: ObjId, hash: u32, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.capacity() * TABLE_MAX_LOAD_NUM {
            self.grow();
        }

        let idx = self.find_slot(key, hash);
        let is_new = match self.slots[idx] {
            Slot::Full { .. } => false,
            // A reused tombstone was already counted.
            Slot::Tombstone => {
                self.slots[idx] = Slot::Full { key, hash, value };
                return true;
            }
            Slot::Empty => true,
        };

        if is_new {
            self.count += 1;
        }
        self.slots[idx] = Slot::Full { key, hash, value };
        is_new
    }

    /// Remove `key`, leaving a tombstone. Returns true when it was present.
    pub fn delete(&mut self, key: ObjId, hash: u32) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let idx = self.find_slot(key, hash);
        match self.slots[idx] {
            Slot::Full { .. } => {
                self.slots[idx] = Slot::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Copy every entry of `self` into `target`, overwriting collisions.
    ///
    /// Used for inheritance (superclass methods copied before the
    /// subclass's own) and trait composition.
    pub fn copy_into(&self, target: &mut Table) {
        for (key, hash, value) in self.iter_with_hash() {
            target.set(key, hash, value);
        }
    }

    /// Iterate live (key, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ObjId, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Full { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Iterate live (key, hash, value) triples.
    pub fn iter_with_hash(&self) -> impl Iterator<Item = (ObjId, u32, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Full { key, hash, value } => Some((*key, *hash, *value)),
            _ => None,
        })
    }

    /// Remove every entry whose key fails `keep`. Used by the collector to
    /// drop intern-pool entries for unmarked strings.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(ObjId) -> bool) {
        for slot in &mut self.slots {
            if let Slot::Full { key, .. } = slot {
                if !keep(*key) {
                    *slot = Slot::Tombstone;
                }
            }
        }
    }

    /// Walk the probe chain for `key`, returning the slot to read or write:
    /// the key's own slot if present, otherwise the first reusable slot.
    fn find_slot(&self, key: ObjId, hash: u32) -> usize {
        let mask = self.capacity() - 1;
        let mut idx = hash as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            match self.slots[idx] {
                Slot::Empty => return tombstone.unwrap_or(idx),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Slot::Full { key: k, .. } => {
                    if k == key {
                        return idx;
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.slots.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.capacity() * 2
        };

        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_capacity]);
        self.count = 0;

        for slot in old {
            if let Slot::Full { key, hash, value } = slot {
                // Rehash directly; tombstones are dropped here.
                let mask = new_capacity - 1;
                let mut idx = hash as usize & mask;
                while matches!(self.slots[idx], Slot::Full { .. }) {
                    idx = (idx + 1) & mask;
                }
                self.slots[idx] = Slot::Full { key, hash, value };
                self.count += 1;
            }
        }
    }

    /// Probe for an interned string by content, not identity.
    ///
    /// This is the intern pool's lookup: `matches` receives each candidate
    /// key whose hash collides and decides whether its bytes are the ones
    /// being interned.
    pub fn find_key(&self, hash: u32, mut matches: impl FnMut(ObjId) -> bool) -> Option<ObjId> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Full { key, hash: h, .. } => {
                    if h == hash && matches(key) {
                        return Some(key);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }
}

/// One slot of a value-keyed table.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DictSlot {
    Empty,
    Tombstone,
    Full { key: Value, hash: u32, value: Value },
}

/// Open-addressed map from `Value` keys to values, backing user
/// dictionaries. Key equality follows `Value` equality: numbers by value,
/// strings and other objects by handle identity (interning makes string
/// identity equal content equality).
#[derive(Debug, Clone, Default)]
pub struct DictTable {
    slots: Vec<DictSlot>,
    count: usize,
}

impl DictTable {
    /// Create an empty dictionary table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether the dictionary has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Look up `key`, identified by its `hash`.
    pub fn get(&self, key: Value, hash: u32) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        match self.slots[self.find_slot(key, hash)] {
            DictSlot::Full { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Insert or overwrite `key`. Returns true when the key was new.
    pub fn set(&mut self, key: Value, hash: u32, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.capacity() * TABLE_MAX_LOAD_NUM {
            self.grow();
        }

        let idx = self.find_slot(key, hash);
        match self.slots[idx] {
            DictSlot::Full { .. } => {
                self.slots[idx] = DictSlot::Full { key, hash, value };
                false
            }
            DictSlot::Tombstone => {
                self.slots[idx] = DictSlot::Full { key, hash, value };
                true
            }
            DictSlot::Empty => {
                self.count += 1;
                self.slots[idx] = DictSlot::Full { key, hash, value };
                true
            }
        }
    }

    /// Remove `key`, leaving a tombstone. Returns true when it was present.
    pub fn delete(&mut self, key: Value, hash: u32) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let idx = self.find_slot(key, hash);
        match self.slots[idx] {
            DictSlot::Full { .. } => {
                self.slots[idx] = DictSlot::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Iterate live (key, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            DictSlot::Full { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    fn find_slot(&self, key: Value, hash: u32) -> usize {
        let mask = self.capacity() - 1;
        let mut idx = hash as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            match self.slots[idx] {
                DictSlot::Empty => return tombstone.unwrap_or(idx),
                DictSlot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                DictSlot::Full { key: k, .. } => {
                    if k == key {
                        return idx;
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.slots.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.capacity() * 2
        };

        let old = std::mem::replace(&mut self.slots, vec![DictSlot::Empty; new_capacity]);
        self.count = 0;

        for slot in old {
            if let DictSlot::Full { key, hash, value } = slot {
                let mask = new_capacity - 1;
                let mut idx = hash as usize & mask;
                while matches!(self.slots[idx], DictSlot::Full { .. }) {
                    idx = (idx + 1) & mask;
                }
                self.slots[idx] = DictSlot::Full { key, hash, value };
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: usize) -> ObjId {
        ObjId(n)
    }

    #[test]
    fn test_set_get() {
        let mut table = Table::new();
        assert!(table.set(key(1), 100, Value::Number(1.0)));
        assert!(!table.set(key(1), 100, Value::Number(2.0)));
        assert_eq!(table.get(key(1), 100), Some(Value::Number(2.0)));
        assert_eq!(table.get(key(2), 200), None);
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let mut table = Table::new();
        // Same hash forces a probe chain.
        table.set(key(1), 7, Value::Number(1.0));
        table.set(key(2), 7, Value::Number(2.0));
        table.set(key(3), 7, Value::Number(3.0));

        assert!(table.delete(key(2), 7));
        assert_eq!(table.get(key(2), 7), None);
        // Entries past the tombstone are still reachable.
        assert_eq!(table.get(key(3), 7), Some(Value::Number(3.0)));
    }

    #[test]
    fn test_tombstone_reused_on_insert() {
        let mut table = Table::new();
        table.set(key(1), 7, Value::Number(1.0));
        table.set(key(2), 7, Value::Number(2.0));
        table.delete(key(1), 7);

        assert!(table.set(key(4), 7, Value::Number(4.0)));
        assert_eq!(table.get(key(4), 7), Some(Value::Number(4.0)));
        assert_eq!(table.get(key(2), 7), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut table = Table::new();
        for i in 0..100 {
            table.set(key(i), i as u32 * 31, Value::Number(i as f64));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            assert_eq!(table.get(key(i), i as u32 * 31), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn test_resize_drops_tombstones() {
        let mut table = Table::new();
        for i in 0..6 {
            table.set(key(i), i as u32, Value::Nil);
        }
        for i in 0..6 {
            table.delete(key(i), i as u32);
        }
        // Force a grow; the tombstones should not survive it.
        for i in 10..20 {
            table.set(key(i), i as u32, Value::Nil);
        }
        assert_eq!(table.len(), 10);
    }

    #[test]
    fn test_copy_into_overwrites() {
        let mut a = Table::new();
        a.set(key(1), 1, Value::Number(1.0));
        a.set(key(2), 2, Value::Number(2.0));

        let mut b = Table::new();
        b.set(key(2), 2, Value::Number(20.0));

        a.copy_into(&mut b);
        assert_eq!(b.get(key(1), 1), Some(Value::Number(1.0)));
        assert_eq!(b.get(key(2), 2), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_find_key_by_content() {
        let mut table = Table::new();
        table.set(key(5), 42, Value::Nil);
        assert_eq!(table.find_key(42, |k| k == key(5)), Some(key(5)));
        assert_eq!(table.find_key(42, |_| false), None);
        assert_eq!(table.find_key(43, |_| true), None);
    }

    #[test]
    fn test_dict_table_value_keys() {
        let mut dict = DictTable::new();
        dict.set(Value::Number(1.0), 11, Value::Bool(true));
        dict.set(Value::Nil, 22, Value::Number(9.0));
        dict.set(Value::Bool(false), 33, Value::Nil);

        assert_eq!(dict.get(Value::Number(1.0), 11), Some(Value::Bool(true)));
        assert_eq!(dict.get(Value::Nil, 22), Some(Value::Number(9.0)));
        assert!(dict.delete(Value::Bool(false), 33));
        assert_eq!(dict.get(Value::Bool(false), 33), None);
        assert_eq!(dict.len(), 2);
    }
}
