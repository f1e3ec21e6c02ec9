//! Device-wide descriptor heaps.
//!
//! Slots hold weak references: a heap never keeps a view alive, and a slot
//! whose view was dropped reads back as empty.

use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;
use prism_core::descriptor_pool::{DescriptorPool, DescriptorRange, HostDescriptorStorage};
use prism_core::layout::descriptor_set::DescriptorKind;
use prism_core::layout::root_table::{DescriptorHeapType, DescriptorRangeType};
use prism_core::view::ViewType;
use prism_core::Result;

use crate::config::{BindingModel, MAX_BINDLESS_DESCRIPTORS};
use crate::view::SoftwareView;

pub type DescriptorHeap = DescriptorPool<HostDescriptorStorage<Weak<SoftwareView>>>;

/// Which device-wide heap serves a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKey {
    /// Root-table model: one heap per descriptor heap type, shared by
    /// binding-set ranges and bindless views.
    Root(DescriptorHeapType),
    /// Descriptor-set model: one bindless pool per descriptor kind.
    Set(DescriptorKind),
}

impl HeapKey {
    pub fn for_view(binding_model: &BindingModel, view_type: ViewType) -> Self {
        match binding_model {
            BindingModel::RootTables { .. } => Self::Root(DescriptorRangeType::of(view_type).heap_type()),
            BindingModel::DescriptorSets { .. } => Self::Set(DescriptorKind::of(view_type)),
        }
    }
}

/// A contiguous run of slots inside one heap.
#[derive(Debug)]
pub struct HeapAllocation {
    pub heap: Arc<DescriptorHeap>,
    pub range: DescriptorRange,
}

impl HeapAllocation {
    pub fn offset(&self) -> u32 {
        self.range.offset()
    }

    pub fn size(&self) -> u32 {
        self.range.size()
    }

    /// Point slot `index` of the allocation at `view`.
    pub fn write(&self, index: u32, view: &Arc<SoftwareView>) {
        prism_core::require!(
            index < self.size(),
            "descriptor index {index} outside a range of {}",
            self.size()
        );
        let slot = self.offset() + index;
        self.heap.with_storage(|storage| storage.set(slot, Arc::downgrade(view)));
    }

    pub fn read(&self, index: u32) -> Option<Arc<SoftwareView>> {
        if index >= self.size() {
            return None;
        }
        let slot = self.offset() + index;
        self.heap
            .with_storage(|storage| storage.get(slot).and_then(Weak::upgrade))
    }
}

#[derive(Debug)]
pub struct DescriptorHeaps {
    binding_model: BindingModel,
    heaps: Mutex<HashMap<HeapKey, Arc<DescriptorHeap>>>,
}

impl DescriptorHeaps {
    pub fn new(binding_model: BindingModel) -> Self {
        Self {
            binding_model,
            heaps: Mutex::new(HashMap::new()),
        }
    }

    pub const fn binding_model(&self) -> &BindingModel {
        &self.binding_model
    }

    pub fn heap(&self, key: HeapKey) -> Arc<DescriptorHeap> {
        let mut heaps = self.heaps.lock();
        Arc::clone(heaps.entry(key).or_insert_with(|| {
            DescriptorPool::new(HostDescriptorStorage::default(), Some(MAX_BINDLESS_DESCRIPTORS))
        }))
    }

    pub fn allocate(&self, key: HeapKey, count: u32) -> Result<HeapAllocation> {
        let heap = self.heap(key);
        let range = heap.allocate(count)?;
        tracing::trace!(?key, offset = range.offset(), count, "Descriptor range allocated");
        Ok(HeapAllocation { heap, range })
    }

    pub fn allocate_for_view(&self, view_type: ViewType, count: u32) -> Result<HeapAllocation> {
        self.allocate(HeapKey::for_view(&self.binding_model, view_type), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_model_shares_heap_between_resource_views() {
        let model = BindingModel::default();
        assert_eq!(
            HeapKey::for_view(&model, ViewType::Texture),
            HeapKey::for_view(&model, ViewType::ConstantBuffer)
        );
        assert_ne!(
            HeapKey::for_view(&model, ViewType::Texture),
            HeapKey::for_view(&model, ViewType::Sampler)
        );
    }

    #[test]
    fn set_model_keeps_one_pool_per_kind() {
        let model = BindingModel::descriptor_sets();
        assert_eq!(
            HeapKey::for_view(&model, ViewType::StructuredBuffer),
            HeapKey::for_view(&model, ViewType::RWStructuredBuffer)
        );
        assert_ne!(
            HeapKey::for_view(&model, ViewType::Texture),
            HeapKey::for_view(&model, ViewType::RWTexture)
        );
    }

    #[test]
    fn allocations_from_one_heap_do_not_overlap() {
        let heaps = DescriptorHeaps::new(BindingModel::default());
        let first = heaps.allocate_for_view(ViewType::Texture, 3).unwrap();
        let second = heaps.allocate_for_view(ViewType::Buffer, 2).unwrap();
        assert!(Arc::ptr_eq(&first.heap, &second.heap));
        let (low, high) = if first.offset() < second.offset() {
            (&first, &second)
        } else {
            (&second, &first)
        };
        assert!(low.offset() + low.size() <= high.offset());
        assert!(first.read(0).is_none());
        assert!(first.read(7).is_none());
    }
}
