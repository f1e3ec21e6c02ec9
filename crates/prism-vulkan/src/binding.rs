//! Binding-set layouts and binding sets on descriptor sets.
//!
//! Every register space is one descriptor set. Bindless spaces borrow the
//! set of the device-wide pool of their descriptor kind; everything else is
//! allocated from a small pool owned by the binding set.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use prism_core::binding::{
    validate_writes, BindKey, BindingSet, BindingSetLayout, BindingSetLayoutDesc, WriteBindingsDesc,
};
use prism_core::interface::cast_arc;
use prism_core::layout::descriptor_set::{DescriptorKind, DescriptorSetPlan, SetLayout};
use prism_core::layout::fallback_bind_key;
use prism_core::memory::MemoryType;
use prism_core::resource::{BindFlag, BufferDesc, Resource};
use prism_core::{impl_query_interface, require, Result};

use crate::context::DeviceContext;
use crate::descriptor::{
    descriptor_type, shader_stage_flags, write_descriptor, write_inline_uniform_block, BindlessPool,
    DescriptorWrite,
};
use crate::error::VulkanError;
use crate::resource::VulkanResource;
use crate::view::VulkanView;

pub struct VulkanBindingSetLayout {
    context: Arc<DeviceContext>,
    desc: BindingSetLayoutDesc,
    plan: DescriptorSetPlan,
    /// One per space; bindless entries belong to their pool.
    set_layouts: Vec<vk::DescriptorSetLayout>,
    bindless_pools: BTreeMap<u32, Arc<BindlessPool>>,
    pipeline_layout: vk::PipelineLayout,
}

impl_query_interface!(VulkanBindingSetLayout);

pub(crate) fn vulkan_layout(layout: &Arc<dyn BindingSetLayout>) -> Arc<VulkanBindingSetLayout> {
    cast_arc::<VulkanBindingSetLayout>(Arc::clone(layout).into_any())
}

unsafe fn create_set_layout(
    device: &ash::Device,
    set: &SetLayout,
) -> std::result::Result<vk::DescriptorSetLayout, VulkanError> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = set
        .bindings
        .iter()
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding.binding)
                .descriptor_type(descriptor_type(binding.kind))
                .descriptor_count(binding.count)
                .stage_flags(shader_stage_flags(binding.stages))
        })
        .collect();
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    Ok(unsafe { device.create_descriptor_set_layout(&create_info, None) }?)
}

impl VulkanBindingSetLayout {
    pub fn new(context: &Arc<DeviceContext>, desc: &BindingSetLayoutDesc) -> Result<Arc<Self>> {
        let plan = DescriptorSetPlan::plan(desc, &context.descriptor_set_limits);
        let mut layout = Self {
            context: Arc::clone(context),
            desc: desc.clone(),
            plan,
            set_layouts: Vec::new(),
            bindless_pools: BTreeMap::new(),
            pipeline_layout: vk::PipelineLayout::null(),
        };

        for (space, set) in layout.plan.sets().iter().enumerate() {
            let space = space as u32;
            if let Some(kind) = set.bindless_kind {
                require!(
                    set.bindings.iter().all(|binding| binding.binding == 0),
                    "bindless {kind:?} bindings must use slot 0 of space {space}"
                );
                let pool = context.bindless_pool(kind)?;
                layout.set_layouts.push(pool.with_storage(|storage| storage.layout()));
                layout.bindless_pools.insert(space, pool);
            } else {
                // Dropping `layout` on error destroys what was created so far.
                let set_layout = unsafe { create_set_layout(&context.device, set) }?;
                layout.set_layouts.push(set_layout);
            }
        }

        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&layout.set_layouts);
        layout.pipeline_layout = unsafe { context.device.create_pipeline_layout(&create_info, None) }
            .map_err(VulkanError::from)?;

        tracing::debug!(
            sets = layout.set_layouts.len(),
            bindless_sets = layout.bindless_pools.len(),
            inline_uniform_blocks = layout.plan.inline_uniform_block_count(),
            fallback_bytes = layout.plan.fallback_constants().buffer_size(),
            "Binding set layout created"
        );
        Ok(Arc::new(layout))
    }

    pub const fn plan(&self) -> &DescriptorSetPlan {
        &self.plan
    }

    pub const fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    fn is_bindless_space(&self, space: u32) -> bool {
        self.bindless_pools.contains_key(&space)
    }
}

impl BindingSetLayout for VulkanBindingSetLayout {
    fn desc(&self) -> &BindingSetLayoutDesc {
        &self.desc
    }
}

impl Drop for VulkanBindingSetLayout {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            for (space, set_layout) in self.set_layouts.iter().enumerate() {
                if !self.is_bindless_space(space as u32) {
                    device.destroy_descriptor_set_layout(*set_layout, None);
                }
            }
        }
    }
}

pub struct VulkanBindingSet {
    context: Arc<DeviceContext>,
    layout: Arc<VulkanBindingSetLayout>,
    pool: vk::DescriptorPool,
    /// Null for bindless spaces.
    sets: Vec<vk::DescriptorSet>,
    fallback_buffer: Option<Arc<VulkanResource>>,
    views: Mutex<BTreeMap<BindKey, Arc<VulkanView>>>,
}

impl_query_interface!(VulkanBindingSet);

impl VulkanBindingSet {
    pub fn new(context: &Arc<DeviceContext>, layout: &Arc<dyn BindingSetLayout>) -> Result<Arc<Self>> {
        let layout = vulkan_layout(layout);
        let mut set = Self {
            context: Arc::clone(context),
            layout: Arc::clone(&layout),
            pool: vk::DescriptorPool::null(),
            sets: vec![vk::DescriptorSet::null(); layout.set_layouts.len()],
            fallback_buffer: None,
            views: Mutex::new(BTreeMap::new()),
        };
        set.allocate_sets()?;
        set.create_fallback_buffer()?;
        Ok(Arc::new(set))
    }

    fn allocate_sets(&mut self) -> Result<()> {
        let plan = self.layout.plan();
        let mut counts: BTreeMap<DescriptorKind, u32> = BTreeMap::new();
        let mut inline_blocks = 0;
        let mut spaces = Vec::new();
        for (space, set) in plan.sets().iter().enumerate() {
            if set.bindless_kind.is_some() {
                continue;
            }
            for (kind, count) in set.descriptor_counts() {
                *counts.entry(kind).or_insert(0) += count;
            }
            inline_blocks += set.inline_uniform_block_count();
            spaces.push(space);
        }
        if spaces.is_empty() {
            return Ok(());
        }

        let pool_sizes: Vec<vk::DescriptorPoolSize> = counts
            .iter()
            .map(|(&kind, &count)| vk::DescriptorPoolSize {
                ty: descriptor_type(kind),
                descriptor_count: count,
            })
            .collect();
        let mut inline_info = vk::DescriptorPoolInlineUniformBlockCreateInfo::default()
            .max_inline_uniform_block_bindings(inline_blocks);
        let mut pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(spaces.len() as u32)
            .pool_sizes(&pool_sizes);
        if inline_blocks > 0 {
            pool_info = pool_info.push_next(&mut inline_info);
        }
        let device = &self.context.device;
        self.pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(VulkanError::from)?;

        let set_layouts: Vec<vk::DescriptorSetLayout> = spaces
            .iter()
            .map(|&space| self.layout.set_layouts[space])
            .collect();
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&set_layouts);
        let allocated = unsafe { device.allocate_descriptor_sets(&allocate_info) }
            .map_err(VulkanError::from)?;
        for (space, set) in spaces.into_iter().zip(allocated) {
            self.sets[space] = set;
        }
        Ok(())
    }

    fn create_fallback_buffer(&mut self) -> Result<()> {
        let fallback = self.layout.plan().fallback_constants();
        if fallback.is_empty() {
            return Ok(());
        }
        let buffer = VulkanResource::new_buffer(
            &self.context,
            &BufferDesc::new(fallback.buffer_size(), BindFlag::CONSTANT_BUFFER, MemoryType::Upload),
        )?;
        buffer.set_name("fallback constants");
        for (key, region) in fallback.regions() {
            let (space, slot) = DescriptorSetPlan::location(&fallback_bind_key(key));
            let descriptor = DescriptorWrite::Buffer(vk::DescriptorBufferInfo {
                buffer: buffer.buffer(),
                offset: region.offset,
                range: u64::from(region.size),
            });
            unsafe {
                write_descriptor(
                    &self.context.device,
                    self.sets[space as usize],
                    slot,
                    0,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    &descriptor,
                );
            }
        }
        self.fallback_buffer = Some(buffer);
        Ok(())
    }

    pub const fn vulkan_layout(&self) -> &Arc<VulkanBindingSetLayout> {
        &self.layout
    }

    /// Sets to bind, indexed by space. Bindless spaces resolve to the
    /// current generation of their pool's set.
    pub fn descriptor_sets(&self) -> Vec<vk::DescriptorSet> {
        self.sets
            .iter()
            .enumerate()
            .map(|(space, set)| {
                self.layout
                    .bindless_pools
                    .get(&(space as u32))
                    .map_or(*set, |pool| pool.with_storage(|storage| storage.set()))
            })
            .collect()
    }
}

impl BindingSet for VulkanBindingSet {
    fn layout(&self) -> Arc<dyn BindingSetLayout> {
        Arc::clone(&self.layout) as Arc<dyn BindingSetLayout>
    }

    fn write_bindings_and_constants(&self, desc: &WriteBindingsDesc<'_>) -> Result<()> {
        validate_writes(&self.layout.desc, desc);
        let device = &self.context.device;
        let mut views = self.views.lock();
        for binding in desc.bindings {
            let Some(view) = &binding.view else {
                continue;
            };
            let key = binding.bind_key;
            require!(
                !key.is_bindless(),
                "bindless binding {key:?} is indexed by descriptor id, not written"
            );
            let view = cast_arc::<VulkanView>(Arc::clone(view).into_any());
            let (space, slot) = DescriptorSetPlan::location(&key);
            unsafe {
                write_descriptor(
                    device,
                    self.sets[space as usize],
                    slot,
                    0,
                    descriptor_type(DescriptorKind::of(key.view_type)),
                    &view.descriptor(),
                );
            }
            views.insert(key, view);
        }

        let plan = self.layout.plan();
        for constants in desc.constants {
            let key = constants.bind_key;
            if plan.is_inline_uniform_block(&key) {
                let (space, slot) = DescriptorSetPlan::location(&key);
                unsafe {
                    write_inline_uniform_block(device, self.sets[space as usize], slot, &constants.data);
                }
            } else {
                let Some(region) = plan.fallback_constants().region(&key) else {
                    prism_core::contract_violation!("constants {key:?} have no storage");
                };
                let Some(buffer) = &self.fallback_buffer else {
                    prism_core::contract_violation!("constants {key:?} have no fallback buffer");
                };
                buffer.update_upload_buffer(region.offset, &constants.data)?;
            }
        }
        Ok(())
    }
}

impl Drop for VulkanBindingSet {
    fn drop(&mut self) {
        if self.pool != vk::DescriptorPool::null() {
            unsafe { self.context.device.destroy_descriptor_pool(self.pool, None) };
        }
    }
}
