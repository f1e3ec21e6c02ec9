//! Query pools.

use std::sync::Arc;

use ash::vk;
use prism_core::query::{QueryHeap, QueryHeapType};
use prism_core::{impl_query_interface, Result, RhiError};

use crate::context::DeviceContext;
use crate::error::VulkanError;

pub struct VulkanQueryHeap {
    context: Arc<DeviceContext>,
    heap_type: QueryHeapType,
    count: u32,
    pool: vk::QueryPool,
}

impl_query_interface!(VulkanQueryHeap);

const fn query_type(heap_type: QueryHeapType) -> vk::QueryType {
    match heap_type {
        QueryHeapType::AccelerationStructureCompactedSize => {
            vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR
        }
    }
}

impl VulkanQueryHeap {
    pub fn new(context: &Arc<DeviceContext>, heap_type: QueryHeapType, count: u32) -> Result<Arc<Self>> {
        if heap_type == QueryHeapType::AccelerationStructureCompactedSize
            && context.acceleration_structure_loader.is_none()
        {
            return Err(RhiError::ExtensionNotSupported(
                "VK_KHR_acceleration_structure".to_string(),
            ));
        }
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(query_type(heap_type))
            .query_count(count.max(1));
        let pool = unsafe { context.device.create_query_pool(&create_info, None) }
            .map_err(VulkanError::from)?;
        Ok(Arc::new(Self {
            context: Arc::clone(context),
            heap_type,
            count,
            pool,
        }))
    }

    pub const fn native(&self) -> vk::QueryPool {
        self.pool
    }

    pub const fn query_type(&self) -> vk::QueryType {
        query_type(self.heap_type)
    }
}

impl QueryHeap for VulkanQueryHeap {
    fn heap_type(&self) -> QueryHeapType {
        self.heap_type
    }

    fn count(&self) -> u32 {
        self.count
    }
}

impl Drop for VulkanQueryHeap {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_query_pool(self.pool, None) };
    }
}
