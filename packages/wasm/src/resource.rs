//! Handle tables brokering host objects across the guest boundary

use parking_lot::RwLock;
use std::collections::HashMap;

/// Maps opaque u32 handles to host-side objects of one type.
///
/// Handles are unique among live entries and never 0 (the guest-side "none"
/// sentinel). Freed handles may be reused. Lookups of unknown handles are
/// ordinary misses, never panics.
pub struct ResourceTable<T> {
    inner: RwLock<TableInner<T>>,
}

struct TableInner<T> {
    entries: HashMap<u32, T>,
    free: Vec<u32>,
    next: u32,
}

impl<T: Clone> ResourceTable<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                entries: HashMap::new(),
                free: Vec::new(),
                next: 1,
            }),
        }
    }

    /// Store `value` and mint a handle for it.
    pub fn add(&self, value: T) -> u32 {
        let mut inner = self.inner.write();
        let handle = inner.free.pop().unwrap_or_else(|| {
            let h = inner.next;
            inner.next += 1;
            h
        });
        inner.entries.insert(handle, value);
        handle
    }

    /// Store `value` under an externally-minted handle (e.g. one chosen by
    /// the guest), replacing any previous entry. Tables using this never mix
    /// in [`add`](Self::add)-minted handles.
    pub fn insert(&self, handle: u32, value: T) {
        self.inner.write().entries.insert(handle, value);
    }

    pub fn get(&self, handle: u32) -> Option<T> {
        self.inner.read().entries.get(&handle).cloned()
    }

    /// Atomic get-and-remove.
    pub fn pop(&self, handle: u32) -> Option<T> {
        let mut inner = self.inner.write();
        let value = inner.entries.remove(&handle);
        if value.is_some() {
            inner.free.push(handle);
        }
        value
    }

    pub fn remove(&self, handle: u32) -> bool {
        self.pop(handle).is_some()
    }

    /// Replace the value of a known handle. Unknown handles are ignored.
    pub fn set(&self, handle: u32, value: T) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.get_mut(&handle) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for ResourceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration of a value in a [`ResourceTable`]; the entry is removed
/// when the guard drops, on every exit path.
pub struct ScopedHandle<T: Clone> {
    table: std::sync::Arc<ResourceTable<T>>,
    handle: u32,
}

impl<T: Clone> ScopedHandle<T> {
    pub fn add(table: std::sync::Arc<ResourceTable<T>>, value: T) -> Self {
        let handle = table.add(value);
        Self { table, handle }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }
}

impl<T: Clone> Drop for ScopedHandle<T> {
    fn drop(&mut self) {
        self.table.remove(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_get_pop_lifecycle() {
        let table = ResourceTable::new();
        let h = table.add("a".to_string());
        assert_ne!(h, 0);
        assert_eq!(table.get(h), Some("a".to_string()));
        assert_eq!(table.pop(h), Some("a".to_string()));
        assert_eq!(table.get(h), None);
        assert_eq!(table.pop(h), None);
    }

    #[test]
    fn handles_unique_among_live_entries() {
        let table = ResourceTable::new();
        let handles: Vec<u32> = (0..100).map(|i| table.add(i)).collect();
        let unique: std::collections::HashSet<_> = handles.iter().collect();
        assert_eq!(unique.len(), handles.len());
    }

    #[test]
    fn freed_handles_are_reused() {
        let table = ResourceTable::new();
        let h1 = table.add(1);
        let _h2 = table.add(2);
        table.remove(h1);
        let h3 = table.add(3);
        assert_eq!(h3, h1);
        assert_eq!(table.get(h3), Some(3));
    }

    #[test]
    fn set_only_replaces_known_handles() {
        let table = ResourceTable::new();
        let h = table.add(1);
        assert!(table.set(h, 2));
        assert_eq!(table.get(h), Some(2));
        assert!(!table.set(h + 1, 3));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn insert_uses_external_handles() {
        let table = ResourceTable::new();
        table.insert(42, "x");
        assert_eq!(table.get(42), Some("x"));
        table.insert(42, "y");
        assert_eq!(table.get(42), Some("y"));
        assert!(table.remove(42));
    }

    #[test]
    fn scoped_handle_releases_on_drop() {
        let table = Arc::new(ResourceTable::new());
        let before = table.len();
        {
            let guard = ScopedHandle::add(table.clone(), 7);
            assert_eq!(table.get(guard.handle()), Some(7));
        }
        assert_eq!(table.len(), before);
    }

    #[test]
    fn concurrent_access() {
        let table = Arc::new(ResourceTable::new());
        let mut threads = Vec::new();
        for i in 0..8 {
            let table = table.clone();
            threads.push(std::thread::spawn(move || {
                for j in 0..100 {
                    let h = table.add(i * 1000 + j);
                    assert!(table.get(h).is_some());
                    assert!(table.remove(h));
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert!(table.is_empty());
    }
}
