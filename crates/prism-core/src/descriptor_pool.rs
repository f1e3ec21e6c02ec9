//! Growable descriptor pools handing out contiguous slot ranges.
//!
//! Pools own the slot storage; ranges are plain `(offset, size)` handles
//! that return themselves to the pool when dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, RhiError};

/// Best-fit range allocator over a linearly growing slot array.
#[derive(Debug, Clone, Default)]
pub struct RangeAllocator {
    /// Free ranges keyed by size.
    free: BTreeMap<u32, Vec<u32>>,
    offset: u32,
    capacity: u32,
    limit: Option<u32>,
}

/// Outcome of [`RangeAllocator::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeAllocation {
    pub offset: u32,
    pub size: u32,
    /// New capacity when the allocation required growth.
    pub grown_to: Option<u32>,
}

impl RangeAllocator {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// End of the linearly allocated region.
    pub const fn high_water_mark(&self) -> u32 {
        self.offset
    }

    pub const fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Reserve `count` slots.
    ///
    /// Reuses the smallest freed range that fits, handing it out whole.
    /// Otherwise appends, growing the capacity to
    /// `max(offset + count, 2 * (capacity + 1))` clamped to the limit.
    pub fn allocate(&mut self, count: u32) -> Result<RangeAllocation> {
        if let Some(allocation) = self.take_free(count) {
            return Ok(allocation);
        }

        let end = self
            .offset
            .checked_add(count)
            .ok_or_else(|| exhausted(count, self.offset, self.limit))?;
        let mut grown_to = None;
        if end > self.capacity {
            let doubled = self.capacity.saturating_add(1).saturating_mul(2);
            let mut new_capacity = end.max(doubled);
            if let Some(limit) = self.limit {
                new_capacity = new_capacity.min(limit);
            }
            if end > new_capacity {
                return Err(exhausted(count, self.offset, self.limit));
            }
            self.capacity = new_capacity;
            grown_to = Some(new_capacity);
        }

        let offset = self.offset;
        self.offset = end;
        Ok(RangeAllocation {
            offset,
            size: count,
            grown_to,
        })
    }

    /// Return a range for reuse.
    pub fn release(&mut self, offset: u32, size: u32) {
        if size == 0 {
            return;
        }
        self.free.entry(size).or_default().push(offset);
    }

    /// Forget every allocation without shrinking.
    pub fn reset(&mut self) {
        self.free.clear();
        self.offset = 0;
    }

    fn take_free(&mut self, count: u32) -> Option<RangeAllocation> {
        let (&size, offsets) = self.free.range_mut(count..).next()?;
        let offset = offsets.pop()?;
        if offsets.is_empty() {
            self.free.remove(&size);
        }
        Some(RangeAllocation {
            offset,
            size,
            grown_to: None,
        })
    }
}

fn exhausted(count: u32, offset: u32, limit: Option<u32>) -> RhiError {
    RhiError::DescriptorPoolExhausted(format!(
        "cannot allocate {count} descriptors at offset {offset} (limit {limit:?})"
    ))
}

/// Receiver of ranges returned by [`DescriptorRange`] on drop.
pub trait RangeRelease: Send + Sync {
    fn release(&self, offset: u32, size: u32);
}

/// Slot range owned by whoever holds it; released on drop.
pub struct DescriptorRange {
    owner: Arc<dyn RangeRelease>,
    offset: u32,
    size: u32,
}

impl DescriptorRange {
    pub fn new(owner: Arc<dyn RangeRelease>, offset: u32, size: u32) -> Self {
        Self {
            owner,
            offset,
            size,
        }
    }

    pub const fn offset(&self) -> u32 {
        self.offset
    }

    pub const fn size(&self) -> u32 {
        self.size
    }
}

impl Drop for DescriptorRange {
    fn drop(&mut self) {
        self.owner.release(self.offset, self.size);
    }
}

impl std::fmt::Debug for DescriptorRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorRange")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Backend storage behind a [`DescriptorPool`].
pub trait DescriptorStorage: Send + 'static {
    /// Grow to `capacity` slots, keeping the contents of the first
    /// `preserved` slots.
    fn grow(&mut self, capacity: u32, preserved: u32) -> Result<()>;
}

struct PoolInner<S> {
    allocator: RangeAllocator,
    storage: S,
}

/// A typed, growable descriptor pool owned by a device.
pub struct DescriptorPool<S> {
    inner: Mutex<PoolInner<S>>,
}

impl<S: DescriptorStorage> DescriptorPool<S> {
    /// Create a pool, optionally capped at `limit` slots.
    pub fn new(storage: S, limit: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                allocator: RangeAllocator::new(limit),
                storage,
            }),
        })
    }

    /// Reserve `count` consecutive slots, growing the storage if needed.
    pub fn allocate(self: &Arc<Self>, count: u32) -> Result<DescriptorRange> {
        let mut inner = self.inner.lock();
        let preserved = inner.allocator.high_water_mark();
        let mut probe = inner.allocator.clone();
        let allocation = probe.allocate(count)?;
        if let Some(capacity) = allocation.grown_to {
            inner.storage.grow(capacity, preserved)?;
        }
        inner.allocator = probe;
        drop(inner);

        let owner: Arc<dyn RangeRelease> = Arc::clone(self) as Arc<dyn RangeRelease>;
        Ok(DescriptorRange::new(owner, allocation.offset, allocation.size))
    }

    pub fn capacity(&self) -> u32 {
        self.inner.lock().allocator.capacity()
    }

    /// Run `f` with exclusive access to the storage.
    pub fn with_storage<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock().storage)
    }
}

impl<S> std::fmt::Debug for DescriptorPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DescriptorPool")
            .field("capacity", &inner.allocator.capacity())
            .field("limit", &inner.allocator.limit())
            .finish_non_exhaustive()
    }
}

impl<S: DescriptorStorage> RangeRelease for DescriptorPool<S> {
    fn release(&self, offset: u32, size: u32) {
        self.inner.lock().allocator.release(offset, size);
    }
}

/// Plain slot storage for backends that keep descriptors in host memory.
#[derive(Debug, Clone)]
pub struct HostDescriptorStorage<D> {
    slots: Vec<Option<D>>,
}

impl<D> Default for HostDescriptorStorage<D> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<D> HostDescriptorStorage<D> {
    pub fn get(&self, index: u32) -> Option<&D> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    pub fn set(&mut self, index: u32, descriptor: D) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = Some(descriptor);
        }
    }

    pub fn clear(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<D: Send + 'static> DescriptorStorage for HostDescriptorStorage<D> {
    fn grow(&mut self, capacity: u32, _preserved: u32) -> Result<()> {
        self.slots.resize_with(capacity as usize, || None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_growth_doubles() {
        let mut allocator = RangeAllocator::new(None);
        let first = allocator.allocate(1).unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.grown_to, Some(2));

        let second = allocator.allocate(1).unwrap();
        assert_eq!(second.offset, 1);
        assert_eq!(second.grown_to, None);

        let third = allocator.allocate(1).unwrap();
        assert_eq!(third.offset, 2);
        assert_eq!(third.grown_to, Some(6));

        let big = allocator.allocate(100).unwrap();
        assert_eq!(big.offset, 3);
        assert_eq!(big.grown_to, Some(103));
    }

    #[test]
    fn best_fit_reuses_smallest_sufficient_range() {
        let mut allocator = RangeAllocator::new(None);
        let a = allocator.allocate(8).unwrap();
        let b = allocator.allocate(2).unwrap();
        let c = allocator.allocate(4).unwrap();
        allocator.release(a.offset, a.size);
        allocator.release(b.offset, b.size);
        allocator.release(c.offset, c.size);

        let reused = allocator.allocate(3).unwrap();
        assert_eq!(reused.offset, c.offset);
        assert_eq!(reused.size, 4);

        let reused = allocator.allocate(2).unwrap();
        assert_eq!(reused.offset, b.offset);

        let reused = allocator.allocate(5).unwrap();
        assert_eq!(reused.offset, a.offset);
        assert_eq!(reused.size, 8);
    }

    #[test]
    fn growth_is_clamped_to_limit() {
        let mut allocator = RangeAllocator::new(Some(10));
        assert_eq!(allocator.allocate(4).unwrap().grown_to, Some(4));
        assert!(allocator.allocate(6).is_ok());
        assert!(matches!(
            allocator.allocate(1),
            Err(RhiError::DescriptorPoolExhausted(_))
        ));
    }

    #[test]
    fn ranges_release_on_drop() {
        let pool = DescriptorPool::new(HostDescriptorStorage::<u32>::default(), None);
        let range = pool.allocate(4).unwrap();
        assert_eq!(range.offset(), 0);
        assert_eq!(pool.with_storage(|storage| storage.len()), 4);
        drop(range);

        let again = pool.allocate(4).unwrap();
        assert_eq!(again.offset(), 0);
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn failed_growth_leaves_pool_untouched() {
        let pool = DescriptorPool::new(HostDescriptorStorage::<u32>::default(), Some(4));
        let _range = pool.allocate(3).unwrap();
        assert!(pool.allocate(2).is_err());
        let next = pool.allocate(1).unwrap();
        assert_eq!(next.offset(), 3);
    }

    #[test]
    fn host_storage_slots() {
        let pool = DescriptorPool::new(HostDescriptorStorage::<&'static str>::default(), None);
        let range = pool.allocate(2).unwrap();
        pool.with_storage(|storage| {
            storage.set(range.offset() + 1, "texture");
            assert_eq!(storage.get(range.offset() + 1), Some(&"texture"));
            assert_eq!(storage.get(range.offset()), None);
            storage.clear(range.offset() + 1);
            assert_eq!(storage.get(range.offset() + 1), None);
        });
    }
}
