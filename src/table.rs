// File: src/table.rs
//
// The hash table underlying globals, the string interner, instance
// fields and class method tables. Open addressing with linear probing;
// keys are interned string object pointers compared by identity, which
// is sound precisely because every string is interned (see object.rs).
//
// A collaborator per SPEC_FULL.md — specified here to the exact
// algorithm the spec calls for (75% load factor, doubling from a minimum
// capacity of 8, tombstone deletion) since globals/fields/interning
// correctness depends on it, but it carries no opcode-level behavior of
// its own.

use crate::object::ObjRef;
use crate::value::Value;

const MIN_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    value: Value,
}

pub struct Table {
    count: usize, // live entries + tombstones
    entries: Vec<Entry>,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self { count: 0, entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn approx_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Linear-probe starting at `key`'s hash, returning the index of the
    /// matching live entry, or the first empty/tombstone slot suitable
    /// for inserting `key` if it isn't present.
    fn find_entry(entries: &[Entry], key: ObjRef) -> usize {
        let capacity = entries.len();
        let hash = key.as_string().map(|s| s.hash).unwrap_or(0);
        let mut index = hash as usize % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if matches!(entry.value, Value::Nil) {
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k.ptr_eq(key) => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Entry { key: None, value: Value::Nil }; new_capacity];
        let mut live = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let idx = Self::find_entry(&new_entries, key);
                new_entries[idx] = Entry { key: Some(key), value: entry.value };
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    /// Returns `true` if this inserted a brand new key.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if self.capacity() == 0 || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_capacity = if self.capacity() < MIN_CAPACITY { MIN_CAPACITY } else { self.capacity() * 2 };
            self.grow(new_capacity);
        }
        let idx = Self::find_entry(&self.entries, key);
        let is_new_key = self.entries[idx].key.is_none();
        if is_new_key && matches!(self.entries[idx].value, Value::Nil) {
            self.count += 1;
        }
        self.entries[idx] = Entry { key: Some(key), value };
        is_new_key
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_entry(&self.entries, key);
        match self.entries[idx].key {
            Some(k) if k.ptr_eq(key) => Some(self.entries[idx].value),
            _ => None,
        }
    }

    pub fn contains(&self, key: ObjRef) -> bool {
        self.get(key).is_some()
    }

    /// Tombstones the slot. Reports whether the key was present at all —
    /// used by `SET_GLOBAL` to distinguish "assign" from "undefined".
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find_entry(&self.entries, key);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry { key: None, value: Value::Bool(true) };
        true
    }

    pub fn add_all(&self, to: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                to.set(key, entry.value);
            }
        }
    }

    /// Content/hash scan rather than identity, used only by the interner
    /// to find an existing string with the same bytes before allocating
    /// a new one.
    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        for _ in 0..capacity {
            let entry = &self.entries[index];
            match entry.key {
                None if matches!(entry.value, Value::Nil) => return None,
                Some(k) => {
                    if let Some(s) = k.as_string() {
                        if s.hash == hash && s.bytes.as_ref() == bytes {
                            return Some(k);
                        }
                    }
                }
                _ => {}
            }
            index = (index + 1) % capacity;
        }
        None
    }

    /// Drops entries whose key is unmarked — the weak-reference cleanup
    /// pass the string interner needs so unreachable literals can be
    /// collected (GC phase 3).
    pub fn remove_unmarked_keys(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !key.is_marked() {
                    *entry = Entry { key: None, value: Value::Bool(true) };
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}

/// FNV-1a, matching the hash the spec requires strings to precompute at
/// creation time.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    #[test]
    fn set_then_get_round_trips() {
        let mut heap = Heap::new();
        let mut roots = |_: &mut Heap| {};
        let key = heap.alloc_string(b"x", &mut roots);
        let mut table = Table::new();
        assert!(table.set(key, Value::Number(1.0)));
        assert_eq!(table.get(key), Some(Value::Number(1.0)));
        assert!(!table.set(key, Value::Number(2.0)), "re-setting an existing key isn't a new insert");
        assert_eq!(table.get(key), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_tombstones_and_reports_prior_presence() {
        let mut heap = Heap::new();
        let mut roots = |_: &mut Heap| {};
        let key = heap.alloc_string(b"x", &mut roots);
        let mut table = Table::new();
        assert!(!table.delete(key));
        table.set(key, Value::Nil);
        assert!(table.delete(key));
        assert_eq!(table.get(key), None);
    }

    #[test]
    fn grows_past_three_quarters_load() {
        let mut heap = Heap::new();
        let mut roots = |_: &mut Heap| {};
        let mut table = Table::new();
        for i in 0..20 {
            let key = heap.alloc_string(format!("k{i}").as_bytes(), &mut roots);
            table.set(key, Value::Number(i as f64));
        }
        assert_eq!(table.len(), 20);
        for i in 0..20 {
            let key = heap.alloc_string(format!("k{i}").as_bytes(), &mut roots);
            assert_eq!(table.get(key), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn find_string_matches_by_content_not_identity() {
        let mut heap = Heap::new();
        let mut roots = |_: &mut Heap| {};
        let mut table = Table::new();
        let key = heap.alloc_string(b"hello", &mut roots);
        table.set(key, Value::Nil);
        assert!(table.find_string(b"hello", fnv1a_hash(b"hello")).is_some());
        assert!(table.find_string(b"goodbye", fnv1a_hash(b"goodbye")).is_none());
    }
}
