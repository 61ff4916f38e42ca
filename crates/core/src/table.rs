//! Open-addressed hash table keyed by `Value`.
//!
//! Linear probing over a power-of-two capacity with a 0.75 load factor.
//! Empty slots hold the `empty` key with a `nil` value; tombstones hold
//! the `empty` key with `true`. `count` includes tombstones, so probe
//! sequences stay terminated; rehashing rebuilds without them.
//!
//! Callers supply each key's hash (`Heap::hash_value` computes it), and
//! entries cache it, so the table itself never touches the heap. Key
//! equality is plain `Value` equality, which is sound for strings because
//! they are interned.

use crate::object::Handle;
use crate::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Value,
    hash: u32,
    value: Value,
}

impl Entry {
    const VACANT: Entry = Entry {
        key: Value::EMPTY,
        hash: 0,
        value: Value::NIL,
    };

    #[inline]
    fn is_tombstone(&self) -> bool {
        self.key.is_empty() && !self.value.is_nil()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    /// Number of live entries (tombstones excluded).
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.key.is_empty())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: Value, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_slot(key, hash)];
        if entry.key.is_empty() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn set(&mut self, key: Value, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let index = self.find_slot(key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_empty();
        // A reused tombstone is already counted.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry { key, hash, value };
        is_new
    }

    /// Remove a key, leaving a tombstone. Returns true if it was present.
    pub fn delete(&mut self, key: Value, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.find_slot(key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_empty() {
            return false;
        }
        *entry = Entry {
            key: Value::EMPTY,
            hash: 0,
            value: Value::TRUE,
        };
        true
    }

    /// Copy every live entry into `dst`.
    pub fn add_all(&self, dst: &mut Table) {
        for entry in &self.entries {
            if !entry.key.is_empty() {
                dst.set(entry.key, entry.hash, entry.value);
            }
        }
    }

    /// Iterate live `(key, value)` pairs.
    pub fn entries(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.key.is_empty())
            .map(|e| (e.key, e.value))
    }

    /// Interning probe: find a key with this hash whose string object
    /// satisfies `matches`, without allocating. The caller compares the
    /// candidate's bytes through the heap.
    pub fn find_string_with(
        &self,
        hash: u32,
        matches: impl Fn(Handle) -> bool,
    ) -> Option<Handle> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            if entry.key.is_empty() {
                if entry.value.is_nil() {
                    return None;
                }
                // Tombstone: keep probing.
            } else if entry.hash == hash {
                if let Some(handle) = entry.key.as_object() {
                    if matches(handle) {
                        return Some(handle);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Delete entries whose key is an object the collector did not mark.
    /// Used on the intern table so unreferenced strings can be swept.
    pub fn remove_white(&mut self, is_marked: impl Fn(Handle) -> bool) {
        for entry in &mut self.entries {
            if let Some(handle) = entry.key.as_object() {
                if !is_marked(handle) {
                    *entry = Entry {
                        key: Value::EMPTY,
                        hash: 0,
                        value: Value::TRUE,
                    };
                }
            }
        }
    }

    /// Owned storage, for collection-pressure accounting.
    pub fn size(&self) -> usize {
        self.entries.capacity() * size_of::<Entry>()
    }

    /// Probe for `key`, returning the index of its entry or of the slot
    /// where it would be inserted (the first tombstone on the probe path,
    /// if any, otherwise the terminating empty slot).
    fn find_slot(&self, key: Value, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            if entry.key.is_empty() {
                if entry.value.is_nil() {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::VACANT; capacity]);
        // Rebuild without tombstones.
        self.count = 0;
        for entry in old {
            if !entry.key.is_empty() {
                let index = self.find_slot(entry.key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::number(n)
    }

    #[test]
    fn test_set_get_round_trip() {
        let mut table = Table::new();
        assert!(table.set(num(1.0), 1, num(10.0)));
        assert!(table.set(num(2.0), 2, num(20.0)));
        assert!(!table.set(num(1.0), 1, num(11.0)));
        assert_eq!(table.get(num(1.0), 1), Some(num(11.0)));
        assert_eq!(table.get(num(2.0), 2), Some(num(20.0)));
        assert_eq!(table.get(num(3.0), 3), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_colliding_hashes_probe_linearly() {
        let mut table = Table::new();
        // Same hash, different keys: all must remain reachable.
        for i in 0..5 {
            table.set(num(f64::from(i)), 42, num(f64::from(i * 100)));
        }
        for i in 0..5 {
            assert_eq!(table.get(num(f64::from(i)), 42), Some(num(f64::from(i * 100))));
        }
    }

    #[test]
    fn test_delete_leaves_usable_tombstone() {
        let mut table = Table::new();
        table.set(num(1.0), 7, num(10.0));
        table.set(num(2.0), 7, num(20.0));
        assert!(table.delete(num(1.0), 7));
        assert!(!table.delete(num(1.0), 7));
        // Entries past the tombstone stay reachable.
        assert_eq!(table.get(num(2.0), 7), Some(num(20.0)));
        // The tombstone slot is reused for new insertions.
        assert!(table.set(num(3.0), 7, num(30.0)));
        assert_eq!(table.get(num(3.0), 7), Some(num(30.0)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_growth_preserves_entries_and_drops_tombstones() {
        let mut table = Table::new();
        for i in 0..64 {
            table.set(num(f64::from(i)), i as u32, num(f64::from(i)));
        }
        for i in 0..32 {
            table.delete(num(f64::from(i)), i as u32);
        }
        // Force several growths past the deletions.
        for i in 64..200 {
            table.set(num(f64::from(i)), i as u32, num(f64::from(i)));
        }
        assert_eq!(table.len(), 32 + 136);
        for i in 32..200 {
            assert_eq!(table.get(num(f64::from(i)), i as u32), Some(num(f64::from(i))));
        }
        for i in 0..32 {
            assert_eq!(table.get(num(f64::from(i)), i as u32), None);
        }
    }

    #[test]
    fn test_add_all_copies_live_entries() {
        let mut src = Table::new();
        src.set(num(1.0), 1, num(10.0));
        src.set(num(2.0), 2, num(20.0));
        src.delete(num(2.0), 2);
        let mut dst = Table::new();
        dst.set(num(3.0), 3, num(30.0));
        src.add_all(&mut dst);
        assert_eq!(dst.get(num(1.0), 1), Some(num(10.0)));
        assert_eq!(dst.get(num(2.0), 2), None);
        assert_eq!(dst.get(num(3.0), 3), Some(num(30.0)));
    }

    #[test]
    fn test_find_string_with_skips_tombstones() {
        let mut table = Table::new();
        let key = Value::object(Handle::from_index(5));
        table.set(key, 99, Value::NIL);
        let found = table.find_string_with(99, |h| h.index() == 5);
        assert_eq!(found, Some(Handle::from_index(5)));
        assert_eq!(table.find_string_with(99, |_| false), None);
        assert_eq!(table.find_string_with(100, |_| true), None);
    }

    #[test]
    fn test_remove_white_drops_unmarked_object_keys() {
        let mut table = Table::new();
        let a = Value::object(Handle::from_index(1));
        let b = Value::object(Handle::from_index(2));
        table.set(a, 1, Value::NIL);
        table.set(b, 2, Value::NIL);
        table.set(num(5.0), 3, num(50.0));
        table.remove_white(|h| h.index() == 2);
        assert_eq!(table.get(a, 1), None);
        assert_eq!(table.get(b, 2), Some(Value::NIL));
        // Non-object keys are untouched.
        assert_eq!(table.get(num(5.0), 3), Some(num(50.0)));
    }
}
