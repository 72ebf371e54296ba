use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Slot<V> = Arc<OnceCell<Arc<V>>>;

/// Compiled kernel sets keyed by serialized record bytes.
///
/// Concurrent first users of one key block on the same cell, so a key is
/// built at most once. A failed build leaves the cell empty and the next
/// caller retries.
pub struct KernelSetCache<V> {
    inner: Mutex<HashMap<Vec<u8>, Slot<V>>>,
}

impl<V> KernelSetCache<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &[u8]) -> Slot<V> {
        match self.inner.lock() {
            Ok(mut guard) => guard
                .entry(key.to_vec())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone(),
            // Poisoned: fall back to an uncached slot.
            Err(_) => Arc::new(OnceCell::new()),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Arc<V>> {
        self.inner
            .lock()
            .ok()
            .and_then(|g| g.get(key).and_then(|cell| cell.get().cloned()))
    }

    /// Returns the cached value and whether it was already present.
    pub fn get_or_try_build<E>(
        &self,
        key: &[u8],
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<(Arc<V>, bool), E> {
        let slot = self.slot(key);
        if let Some(value) = slot.get() {
            return Ok((value.clone(), true));
        }
        let mut built = false;
        let value = slot.get_or_try_init(|| {
            built = true;
            build().map(Arc::new)
        })?;
        Ok((value.clone(), !built))
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|g| g.values().filter(|cell| cell.get().is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.clear();
        }
    }
}

impl<V> Default for KernelSetCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
