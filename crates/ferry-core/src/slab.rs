// src/slab.rs

enum Entry<T> {
    Occupied(T),
    Vacant(Option<usize>),
}

/// Connection table owned by one reactor.
///
/// Indices are stable for the lifetime of an entry and double as readiness
/// tokens. Freed slots are threaded onto a free list and reused LIFO.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    head_free: Option<usize>,
    active_count: usize,
    limit: usize,
}

impl<T> Slab<T> {
    /// `limit` caps concurrent entries; storage grows on demand up to it.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            head_free: None,
            active_count: 0,
            limit,
        }
    }

    /// O(1) insertion. Returns `None` when the table is at its limit.
    pub fn insert(&mut self, value: T) -> Option<usize> {
        if let Some(idx) = self.head_free {
            let Entry::Vacant(next) = self.entries[idx] else {
                unreachable!("free list points at an occupied slot");
            };
            self.head_free = next;
            self.entries[idx] = Entry::Occupied(value);
            self.active_count += 1;
            return Some(idx);
        }
        if self.entries.len() >= self.limit {
            return None;
        }
        self.entries.push(Entry::Occupied(value));
        self.active_count += 1;
        Some(self.entries.len() - 1)
    }

    /// Index the next `insert` will use, if there is room.
    pub fn vacant_key(&self) -> Option<usize> {
        match self.head_free {
            Some(idx) => Some(idx),
            None if self.entries.len() < self.limit => Some(self.entries.len()),
            None => None,
        }
    }

    /// O(1) removal. Removing a vacant or unknown index is a no-op.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let slot = self.entries.get_mut(index)?;
        if matches!(slot, Entry::Vacant(_)) {
            return None;
        }
        let Entry::Occupied(value) = std::mem::replace(slot, Entry::Vacant(self.head_free)) else {
            return None;
        };
        self.head_free = Some(index);
        self.active_count -= 1;
        Some(value)
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<&T> {
        match self.entries.get(index)? {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    #[inline(always)]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.entries.get_mut(index)? {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    /// Indices of all occupied entries, collected so the caller may remove
    /// while walking them.
    pub fn keys(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e, Entry::Occupied(_)).then_some(i))
            .collect()
    }
}
