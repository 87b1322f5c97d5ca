use parking_lot::Mutex;

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects created and not yet destroyed.
    pub allocated: usize,
    /// Objects handed out and not yet returned.
    pub outstanding: usize,
    /// Objects parked on the free list.
    pub free: usize,
}

#[derive(Debug)]
struct PoolInner<T> {
    initialized: bool,
    free: Vec<T>,
    allocated: usize,
    outstanding: usize,
}

/// A recycling free list. Objects are created on demand, returned with
/// `push` and handed out again by the next `pop`. The lock only covers the
/// free-list edit.
#[derive(Debug)]
pub struct ObjectPool<T> {
    name: &'static str,
    capacity: Option<usize>,
    inner: Mutex<PoolInner<T>>,
}

impl<T> ObjectPool<T> {
    /// `capacity` caps the number of live objects; reaching it is reported
    /// the same way an allocation failure would be.
    pub fn new(name: &'static str, capacity: Option<usize>) -> Self {
        ObjectPool {
            name,
            capacity,
            inner: Mutex::new(PoolInner {
                initialized: false,
                free: Vec::new(),
                allocated: 0,
                outstanding: 0,
            }),
        }
    }

    /// One-time setup. Returns `false` if the pool is already initialized.
    pub fn init(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.initialized {
            return false;
        }
        inner.initialized = true;
        inner.free.reserve(16);
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    /// Take a recycled object, or build one with `make` when the free list
    /// is empty. `None` when the pool is not initialized or exhausted.
    pub fn pop_with(&self, make: impl FnOnce() -> T) -> Option<T> {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            tracing::warn!("{} pool: pop before init", self.name);
            return None;
        }

        if let Some(item) = inner.free.pop() {
            inner.outstanding += 1;
            return Some(item);
        }

        if self.capacity.is_some_and(|cap| inner.allocated >= cap) {
            tracing::error!(
                "{} pool: memory not allocated ({} objects live, none free)",
                self.name,
                inner.allocated
            );
            return None;
        }

        inner.allocated += 1;
        inner.outstanding += 1;
        Some(make())
    }

    /// Return an object for reuse. After `cleanup` the object is destroyed
    /// instead of parked.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if inner.initialized {
            inner.free.push(item);
        } else {
            inner.allocated = inner.allocated.saturating_sub(1);
            drop(inner);
            drop(item);
        }
    }

    /// Destroy every parked object and return the pool to the uninitialized
    /// state. Returns the number of objects destroyed.
    pub fn cleanup(&self) -> usize {
        let drained: Vec<T> = {
            let mut inner = self.inner.lock();
            if inner.outstanding > 0 {
                tracing::warn!(
                    "{} pool: cleanup with {} objects still outstanding",
                    self.name,
                    inner.outstanding
                );
            }
            inner.initialized = false;
            let drained = std::mem::take(&mut inner.free);
            inner.allocated = inner.allocated.saturating_sub(drained.len());
            drained
        };
        drained.len()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            allocated: inner.allocated,
            outstanding: inner.outstanding,
            free: inner.free.len(),
        }
    }
}
