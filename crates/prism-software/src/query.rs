//! Query heaps holding 64-bit results in host memory.

use parking_lot::Mutex;
use prism_core::query::{QueryHeap, QueryHeapType};
use prism_core::{impl_query_interface, require};

pub struct SoftwareQueryHeap {
    heap_type: QueryHeapType,
    results: Mutex<Vec<u64>>,
}

impl_query_interface!(SoftwareQueryHeap);

impl SoftwareQueryHeap {
    pub fn new(heap_type: QueryHeapType, count: u32) -> Self {
        Self {
            heap_type,
            results: Mutex::new(vec![0; count as usize]),
        }
    }

    fn check_range(&self, first: u32, count: u32) {
        require!(
            first.checked_add(count).is_some_and(|end| end <= self.count()),
            "queries {first}..{} outside a heap of {}",
            first.saturating_add(count),
            self.count()
        );
    }

    pub fn write(&self, first: u32, values: &[u64]) {
        self.check_range(first, values.len() as u32);
        let start = first as usize;
        self.results.lock()[start..start + values.len()].copy_from_slice(values);
    }

    pub fn read(&self, first: u32, count: u32) -> Vec<u64> {
        self.check_range(first, count);
        let start = first as usize;
        self.results.lock()[start..start + count as usize].to_vec()
    }
}

impl QueryHeap for SoftwareQueryHeap {
    fn heap_type(&self) -> QueryHeapType {
        self.heap_type
    }

    fn count(&self) -> u32 {
        self.results.lock().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_start_zeroed() {
        let heap = SoftwareQueryHeap::new(QueryHeapType::AccelerationStructureCompactedSize, 4);
        heap.write(1, &[42, 7]);
        assert_eq!(heap.read(0, 4), vec![0, 42, 7, 0]);
    }

    #[test]
    #[should_panic(expected = "outside a heap")]
    fn out_of_range_writes_are_fatal() {
        let heap = SoftwareQueryHeap::new(QueryHeapType::AccelerationStructureCompactedSize, 2);
        heap.write(1, &[1, 2]);
    }
}
