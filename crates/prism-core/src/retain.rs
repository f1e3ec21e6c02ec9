//! Keeping objects alive until the GPU is done with them.

use std::sync::Arc;

/// Objects tagged with the fence value after which they may be released.
///
/// Anything referenced by submitted work goes in here together with the
/// value the queue will signal once that work completes.
#[derive(Default)]
pub struct RetainList {
    pending: Vec<(u64, Box<dyn Send + Sync>)>,
}

impl RetainList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `object` alive until a fence reaches `fence_value`.
    pub fn retain<T>(&mut self, fence_value: u64, object: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.pending.push((fence_value, Box::new(object)));
    }

    /// Drop everything whose fence value has been reached. Returns the
    /// number of released objects.
    pub fn release_completed(&mut self, completed_value: u64) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(value, _)| *value > completed_value);
        before - self.pending.len()
    }

    /// Drop everything. Only call after the device is idle.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl std::fmt::Debug for RetainList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetainList")
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_only_completed_values() {
        let first = Arc::new(1u32);
        let second = Arc::new(2u32);
        let mut list = RetainList::new();
        list.retain(1, Arc::clone(&first));
        list.retain(2, Arc::clone(&second));
        assert_eq!(Arc::strong_count(&first), 2);

        assert_eq!(list.release_completed(1), 1);
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(Arc::strong_count(&second), 2);
        assert_eq!(list.len(), 1);

        assert_eq!(list.release_completed(5), 1);
        assert!(list.is_empty());
        assert_eq!(Arc::strong_count(&second), 1);
    }

    #[test]
    fn accepts_trait_objects() {
        let object: Arc<dyn Send + Sync> = Arc::new(String::from("buffer"));
        let mut list = RetainList::new();
        list.retain(3, object);
        list.clear();
        assert!(list.is_empty());
    }
}
