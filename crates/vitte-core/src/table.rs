//! table.rs — open-addressed hash table, linear probing, power-of-two
//! capacity, 75% load factor, tombstones on delete.
//!
//! Used for the globals environment, class method tables and instance
//! field tables. Keys are interned strings ([`GcRef`]) compared by
//! identity; the hash used for probing is the string's own cached
//! FNV-1a hash, supplied by the caller so this module never has to look
//! inside the heap.

use crate::object::GcRef;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { key: GcRef, hash: u32, value: Value },
}

/// Open-addressed `GcRef -> Value` map.
#[derive(Clone, Default)]
pub struct Table {
    entries: Vec<Slot>,
    /// Occupied + tombstone count, used for the load-factor check —
    /// tombstones count against capacity the same as clox's `table.c`.
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Self { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_slot(entries: &[Slot], capacity: usize, key: GcRef, hash: u32) -> usize {
        let mut index = (hash as usize) & (capacity - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                Slot::Empty => return first_tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Slot::Occupied { key: k, .. } if *k == key => return index,
                Slot::Occupied { .. } => {}
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Slot::Empty; new_capacity];
        let mut new_count = 0;
        for slot in self.entries.drain(..) {
            if let Slot::Occupied { key, hash, value } = slot {
                let idx = Self::find_slot(&new_entries, new_capacity, key, hash);
                new_entries[idx] = Slot::Occupied { key, hash, value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    fn ensure_capacity(&mut self) {
        if self.capacity() == 0 {
            self.grow(8);
            return;
        }
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            self.grow(self.capacity() * 2);
        }
    }

    /// Inserts or overwrites `key`. Returns `true` if this was a new key.
    pub fn set(&mut self, key: GcRef, hash: u32, value: Value) -> bool {
        self.ensure_capacity();
        let capacity = self.capacity();
        let idx = Self::find_slot(&self.entries, capacity, key, hash);
        let is_new = !matches!(self.entries[idx], Slot::Occupied { .. });
        if is_new && !matches!(self.entries[idx], Slot::Tombstone) {
            self.count += 1;
        }
        self.entries[idx] = Slot::Occupied { key, hash, value };
        is_new
    }

    pub fn get(&self, key: GcRef, hash: u32) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        match &self.entries[Self::find_slot(&self.entries, self.capacity(), key, hash)] {
            Slot::Occupied { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn contains(&self, key: GcRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Deletes `key`, leaving a tombstone so later probes still find keys
    /// that hashed past this slot.
    pub fn delete(&mut self, key: GcRef, hash: u32) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let idx = Self::find_slot(&self.entries, self.capacity(), key, hash);
        if matches!(self.entries[idx], Slot::Occupied { .. }) {
            self.entries[idx] = Slot::Tombstone;
            true
        } else {
            false
        }
    }

    /// Copies every live entry of `self` into `dst`, overwriting on
    /// collision. Used by `OP_INHERIT` to copy a superclass's methods.
    pub fn add_all_into(&self, dst: &mut Table) {
        for slot in &self.entries {
            if let Slot::Occupied { key, hash, value } = slot {
                dst.set(*key, *hash, *value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (GcRef, Value)> + '_ {
        self.entries.iter().filter_map(|s| match s {
            Slot::Occupied { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> GcRef {
        GcRef::from_raw(n)
    }

    #[test]
    fn set_get_roundtrip() {
        let mut t = Table::new();
        assert!(t.set(key(1), 111, Value::Number(1.0)));
        assert!(!t.set(key(1), 111, Value::Number(2.0)));
        assert_eq!(t.get(key(1), 111).unwrap().as_number(), Some(2.0));
    }

    #[test]
    fn delete_then_probe_past_tombstone() {
        let mut t = Table::new();
        // force both keys into the same bucket-ish region by reusing hash
        t.set(key(1), 5, Value::Number(1.0));
        t.set(key(2), 5, Value::Number(2.0));
        assert!(t.delete(key(1), 5));
        // key 2 must still be reachable even though it probed past key 1's slot
        assert_eq!(t.get(key(2), 5).unwrap().as_number(), Some(2.0));
        assert!(t.get(key(1), 5).is_none());
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..100 {
            t.set(key(i), i, Value::Number(i as f64));
        }
        assert_eq!(t.len(), 100);
        for i in 0..100 {
            assert_eq!(t.get(key(i), i).unwrap().as_number(), Some(i as f64));
        }
    }
}
