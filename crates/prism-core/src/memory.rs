//! Memory blocks and memory-type hints.

use crate::interface::QueryInterface;

/// Where a resource's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryType {
    /// Device-local, not CPU visible.
    #[default]
    Default,
    /// CPU-writable staging memory, persistently mapped.
    Upload,
    /// CPU-readable memory for copying results back.
    Readback,
}

impl MemoryType {
    /// Whether `Map`/`Unmap` are legal on resources of this type.
    pub const fn is_host_visible(self) -> bool {
        matches!(self, Self::Upload | Self::Readback)
    }
}

/// Size, alignment and compatible memory types of an unbound resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    /// Bit `i` set means native memory type `i` may back the resource.
    pub memory_type_bits: u32,
}

/// Device-local memory usage as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBudget {
    pub budget: u64,
    pub usage: u64,
}

impl MemoryBudget {
    /// Bytes that can still be allocated before the budget is exceeded.
    pub const fn available(&self) -> u64 {
        self.budget.saturating_sub(self.usage)
    }
}

/// A block of GPU memory that placed resources can be bound into.
pub trait Memory: QueryInterface {
    fn memory_type(&self) -> MemoryType;
    fn size(&self) -> u64;
}

/// Round `value` up to a multiple of the power-of-two `alignment`.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_test() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn budget_available_saturates() {
        let budget = MemoryBudget {
            budget: 100,
            usage: 130,
        };
        assert_eq!(budget.available(), 0);
        assert!(MemoryType::Upload.is_host_visible());
        assert!(!MemoryType::Default.is_host_visible());
    }
}
