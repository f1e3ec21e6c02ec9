//! Query heaps.

use crate::interface::QueryInterface;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryHeapType {
    AccelerationStructureCompactedSize,
}

/// Fixed-size array of queries. Results resolve as 64-bit values.
pub trait QueryHeap: QueryInterface {
    fn heap_type(&self) -> QueryHeapType;
    fn count(&self) -> u32;
}

/// Size of one resolved query result.
pub const QUERY_RESULT_SIZE: u64 = 8;
