use super::value::{StrId, Value};

// ---------------------------------------------------------------------------
// Hash table
// ---------------------------------------------------------------------------

const TABLE_MAX_LOAD_NUM: usize = 3;
const TABLE_MAX_LOAD_DEN: usize = 4;

/// One bucket. An empty bucket has no key and a `Null` value; a tombstone
/// has no key and a `Bool(true)` value.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub(crate) key: Option<StrId>,
    pub(crate) value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    value: Value::Null,
};

/// Open-addressed hash table keyed by interned strings. Keys compare by
/// handle identity; each key carries its hash, so probing never needs the
/// heap. `count` covers live entries plus tombstones and drives growth at
/// 75% load.
#[derive(Debug, Default)]
pub struct Table {
    count: usize,
    pub(crate) entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn get(&self, key: StrId) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[find_slot(&self.entries, key)];
        entry.key.map(|_| entry.value)
    }

    pub fn contains(&self, key: StrId) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn set(&mut self, key: StrId, value: Value) -> bool {
        if (self.count + 1) * TABLE_MAX_LOAD_DEN > self.entries.len() * TABLE_MAX_LOAD_NUM {
            self.grow();
        }
        let slot = find_slot(&self.entries, key);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_none();
        // A reused tombstone is already counted; only a virgin bucket grows
        // the load.
        if is_new && matches!(entry.value, Value::Null) {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    /// Replace the entry with a tombstone. Returns true if the key existed.
    pub fn delete(&mut self, key: StrId) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = find_slot(&self.entries, key);
        let entry = &mut self.entries[slot];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Copy every live entry of `self` into `to`.
    pub fn add_all_into(&self, to: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                to.set(key, entry.value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (StrId, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rough retained size for GC accounting.
    pub fn byte_size(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<Entry>()
    }

    /// Push every key and value reference into `out` (GC trace helper).
    pub fn collect_refs(&self, out: &mut Vec<Value>) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                out.push(Value::Obj(key.obj));
                out.push(entry.value);
            }
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![EMPTY; capacity]);
        // Tombstones are dropped by the rehash, so the load count resets to
        // live entries only.
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let slot = find_slot(&self.entries, key);
                self.entries[slot] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
                self.count += 1;
            }
        }
    }
}

/// Probe for `key`, returning the index of its entry, the first tombstone
/// passed on the way, or the terminating empty bucket.
fn find_slot(entries: &[Entry], key: StrId) -> usize {
    let mask = entries.len() - 1;
    let mut index = key.hash as usize & mask;
    let mut tombstone: Option<usize> = None;
    loop {
        let entry = &entries[index];
        match entry.key {
            None => {
                if matches!(entry.value, Value::Null) {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
            Some(existing) if existing.obj == key.obj => return index,
            Some(_) => {}
        }
        index = (index + 1) & mask;
    }
}

/// FNV-1a, the hash every interned string caches.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::ObjRef;

    fn key(id: u32) -> StrId {
        StrId {
            obj: ObjRef(id),
            hash: hash_bytes(id.to_le_bytes().as_slice()),
        }
    }

    #[test]
    fn set_then_get() {
        let mut table = Table::new();
        assert!(table.set(key(1), Value::Number(10.0)));
        assert_eq!(table.get(key(1)), Some(Value::Number(10.0)));
        assert_eq!(table.get(key(2)), None);
    }

    #[test]
    fn set_overwrites() {
        let mut table = Table::new();
        assert!(table.set(key(1), Value::Number(1.0)));
        assert!(!table.set(key(1), Value::Number(2.0)));
        assert_eq!(table.get(key(1)), Some(Value::Number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn delete_leaves_tombstone_that_probing_skips() {
        let mut table = Table::new();
        for id in 0..6 {
            table.set(key(id), Value::Number(id as f64));
        }
        assert!(table.delete(key(2)));
        assert!(!table.delete(key(2)));
        assert_eq!(table.get(key(2)), None);
        // Entries colliding past the tombstone are still reachable.
        for id in [0u32, 1, 3, 4, 5] {
            assert_eq!(table.get(key(id)), Some(Value::Number(id as f64)));
        }
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let mut table = Table::new();
        table.set(key(1), Value::Number(1.0));
        table.delete(key(1));
        table.set(key(1), Value::Number(9.0));
        assert_eq!(table.get(key(1)), Some(Value::Number(9.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn growth_preserves_entries() {
        let mut table = Table::new();
        for id in 0..100 {
            table.set(key(id), Value::Number(id as f64));
        }
        assert_eq!(table.len(), 100);
        for id in 0..100 {
            assert_eq!(table.get(key(id)), Some(Value::Number(id as f64)));
        }
    }

    #[test]
    fn add_all_copies_live_entries() {
        let mut from = Table::new();
        from.set(key(1), Value::Bool(true));
        from.set(key(2), Value::Bool(false));
        from.delete(key(2));

        let mut to = Table::new();
        from.add_all_into(&mut to);
        assert_eq!(to.get(key(1)), Some(Value::Bool(true)));
        assert_eq!(to.get(key(2)), None);
        assert_eq!(to.len(), 1);
    }

    #[test]
    fn iter_yields_live_entries() {
        let mut table = Table::new();
        table.set(key(1), Value::Number(1.0));
        table.set(key(2), Value::Number(2.0));
        table.delete(key(1));
        let collected: Vec<_> = table.iter().collect();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].1, Value::Number(2.0));
    }

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(hash_bytes(b""), 2166136261);
        assert_eq!(hash_bytes(b"a"), 0xe40c292c);
    }
}
