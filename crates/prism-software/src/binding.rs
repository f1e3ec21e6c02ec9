//! Binding-set layouts and binding sets for both emulated binding models.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use prism_core::binding::{
    validate_writes, BindKey, BindingSet, BindingSetLayout, BindingSetLayoutDesc, WriteBindingsDesc,
};
use prism_core::interface::cast_arc;
use prism_core::layout::descriptor_set::DescriptorSetPlan;
use prism_core::layout::root_table::{DescriptorHeapType, RootTableLayout};
use prism_core::layout::{fallback_bind_key, FallbackConstantsLayout, CONSTANT_BUFFER_ALIGNMENT};
use prism_core::memory::{align_up, MemoryType};
use prism_core::resource::{BindFlag, BufferDesc, Resource};
use prism_core::view::{ViewDesc, ViewDimension, ViewType};
use prism_core::{impl_query_interface, require, Result};

use crate::config::BindingModel;
use crate::context::DeviceContext;
use crate::descriptor::{HeapAllocation, HeapKey};
use crate::resource::SoftwareResource;
use crate::view::SoftwareView;

/// Native layout a binding-set layout was planned into.
#[derive(Debug)]
pub enum LayoutPlan {
    RootTables(RootTableLayout),
    DescriptorSets(DescriptorSetPlan),
}

impl LayoutPlan {
    pub const fn fallback_constants(&self) -> &FallbackConstantsLayout {
        match self {
            Self::RootTables(plan) => plan.fallback_constants(),
            Self::DescriptorSets(plan) => plan.fallback_constants(),
        }
    }

    /// Whether constants at `bind_key` are stored natively rather than in
    /// the fallback buffer.
    fn is_native_constants(&self, bind_key: &BindKey) -> bool {
        match self {
            Self::RootTables(plan) => plan.root_constants_index(bind_key).is_some(),
            Self::DescriptorSets(plan) => plan.is_inline_uniform_block(bind_key),
        }
    }
}

#[derive(Debug)]
pub struct SoftwareBindingSetLayout {
    desc: BindingSetLayoutDesc,
    plan: LayoutPlan,
}

impl_query_interface!(SoftwareBindingSetLayout);

impl SoftwareBindingSetLayout {
    pub fn new(desc: &BindingSetLayoutDesc, binding_model: &BindingModel) -> Result<Arc<Self>> {
        let plan = match *binding_model {
            BindingModel::RootTables { root_cost_limit } => {
                LayoutPlan::RootTables(RootTableLayout::plan(desc, root_cost_limit)?)
            }
            BindingModel::DescriptorSets {
                max_inline_uniform_block_size,
                max_inline_uniform_blocks,
            } => LayoutPlan::DescriptorSets(DescriptorSetPlan::plan(
                desc,
                &BindingModel::descriptor_set_limits(
                    max_inline_uniform_block_size,
                    max_inline_uniform_blocks,
                ),
            )),
        };
        tracing::debug!(
            bind_keys = desc.bind_keys.len(),
            constants = desc.constants.len(),
            spilled = plan.fallback_constants().regions().count(),
            "Binding set layout planned"
        );
        Ok(Arc::new(Self {
            desc: desc.clone(),
            plan,
        }))
    }

    pub const fn plan(&self) -> &LayoutPlan {
        &self.plan
    }
}

impl BindingSetLayout for SoftwareBindingSetLayout {
    fn desc(&self) -> &BindingSetLayoutDesc {
        &self.desc
    }
}

/// Descriptor storage of one binding set.
enum SetStorage {
    /// Ranges of the device heaps, one per heap type the layout uses.
    Heaps(BTreeMap<DescriptorHeapType, HeapAllocation>),
    /// Descriptors keyed by `(set, binding)`.
    Sets(Mutex<BTreeMap<(u32, u32), Arc<SoftwareView>>>),
}

pub struct SoftwareBindingSet {
    layout: Arc<SoftwareBindingSetLayout>,
    storage: SetStorage,
    /// Every view written into the set, fallback constant views included.
    /// Heap slots only hold weak references, so the set keeps them alive.
    views: Mutex<BTreeMap<BindKey, Arc<SoftwareView>>>,
    native_constants: Mutex<BTreeMap<BindKey, Vec<u8>>>,
    /// Upload buffer holding constants that did not fit the native path.
    fallback: Option<Arc<SoftwareResource>>,
}

impl_query_interface!(SoftwareBindingSet);

impl SoftwareBindingSet {
    pub fn new(layout: Arc<SoftwareBindingSetLayout>, context: &DeviceContext) -> Result<Arc<Self>> {
        let storage = match &layout.plan {
            LayoutPlan::RootTables(plan) => {
                let mut ranges = BTreeMap::new();
                for (&heap_type, &count) in plan.heap_descs() {
                    if count > 0 {
                        let allocation = context.heaps.allocate(HeapKey::Root(heap_type), count)?;
                        ranges.insert(heap_type, allocation);
                    }
                }
                SetStorage::Heaps(ranges)
            }
            LayoutPlan::DescriptorSets(_) => SetStorage::Sets(Mutex::new(BTreeMap::new())),
        };

        let mut set = Self {
            layout,
            storage,
            views: Mutex::new(BTreeMap::new()),
            native_constants: Mutex::new(BTreeMap::new()),
            fallback: None,
        };
        set.create_fallback_buffer(context)?;
        Ok(Arc::new(set))
    }

    fn create_fallback_buffer(&mut self, context: &DeviceContext) -> Result<()> {
        let fallback_layout = self.layout.plan.fallback_constants();
        if fallback_layout.is_empty() {
            return Ok(());
        }
        let buffer = SoftwareResource::new_buffer(
            &BufferDesc::new(
                fallback_layout.buffer_size(),
                BindFlag::CONSTANT_BUFFER,
                MemoryType::Upload,
            ),
            context.next_id(),
            &context.accounting,
        )?;
        buffer.set_name("fallback constants");

        for (key, region) in fallback_layout.regions() {
            let desc = ViewDesc::new(ViewType::ConstantBuffer, ViewDimension::Buffer)
                .with_offset(region.offset)
                .with_buffer_size(align_up(u64::from(region.size), CONSTANT_BUFFER_ALIGNMENT));
            let view = SoftwareView::new(Arc::clone(&buffer), &desc, &context.heaps)?;
            self.store(&fallback_bind_key(key), &view);
        }
        self.fallback = Some(buffer);
        Ok(())
    }

    fn store(&self, bind_key: &BindKey, view: &Arc<SoftwareView>) {
        match (&self.storage, &self.layout.plan) {
            (SetStorage::Heaps(ranges), LayoutPlan::RootTables(plan)) => {
                let Some(location) = plan.location(bind_key) else {
                    prism_core::contract_violation!("binding {bind_key:?} has no heap location");
                };
                match ranges.get(&location.heap_type) {
                    Some(allocation) => allocation.write(location.heap_offset, view),
                    None => prism_core::contract_violation!("binding {bind_key:?} has no heap range"),
                }
            }
            (SetStorage::Sets(descriptors), LayoutPlan::DescriptorSets(_)) => {
                descriptors
                    .lock()
                    .insert(DescriptorSetPlan::location(bind_key), Arc::clone(view));
            }
            _ => prism_core::contract_violation!("binding set storage does not match its layout"),
        }
        self.views.lock().insert(*bind_key, Arc::clone(view));
    }

    /// View currently bound at `bind_key`.
    pub fn bound_view(&self, bind_key: &BindKey) -> Option<Arc<SoftwareView>> {
        match (&self.storage, &self.layout.plan) {
            (SetStorage::Heaps(ranges), LayoutPlan::RootTables(plan)) => {
                let location = plan.location(bind_key)?;
                ranges.get(&location.heap_type)?.read(location.heap_offset)
            }
            (SetStorage::Sets(descriptors), LayoutPlan::DescriptorSets(_)) => descriptors
                .lock()
                .get(&DescriptorSetPlan::location(bind_key))
                .cloned(),
            _ => None,
        }
    }

    /// Constants last written at `bind_key`, read back from wherever the
    /// layout placed them.
    pub fn constants(&self, bind_key: &BindKey) -> Option<Vec<u8>> {
        if self.layout.plan.is_native_constants(bind_key) {
            return self.native_constants.lock().get(bind_key).cloned();
        }
        let region = self.layout.plan.fallback_constants().region(bind_key)?;
        let fallback = self.fallback.as_ref()?;
        Some(fallback.read(region.offset, u64::from(region.size)))
    }

    /// Whether constants at `bind_key` went through the fallback buffer.
    pub fn is_spilled(&self, bind_key: &BindKey) -> bool {
        self.layout.plan.fallback_constants().contains(bind_key)
    }

    pub const fn software_layout(&self) -> &Arc<SoftwareBindingSetLayout> {
        &self.layout
    }

    /// Resources the set refers to that must outlive submitted work.
    pub fn referenced_resources(&self) -> Vec<Arc<SoftwareResource>> {
        self.views
            .lock()
            .values()
            .map(|view| Arc::clone(view.software_resource()))
            .collect()
    }
}

impl BindingSet for SoftwareBindingSet {
    fn layout(&self) -> Arc<dyn BindingSetLayout> {
        Arc::clone(&self.layout) as Arc<dyn BindingSetLayout>
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn write_bindings_and_constants(&self, desc: &WriteBindingsDesc<'_>) -> Result<()> {
        validate_writes(&self.layout.desc, desc);
        for binding in desc.bindings {
            require!(
                !binding.bind_key.is_bindless(),
                "bindless binding {:?} is addressed through descriptor ids, not written",
                binding.bind_key
            );
            let Some(view) = &binding.view else {
                continue;
            };
            let view = cast_arc::<SoftwareView>(Arc::clone(view).into_any());
            self.store(&binding.bind_key, &view);
        }

        for constants in desc.constants {
            let key = &constants.bind_key;
            if self.layout.plan.is_native_constants(key) {
                self.native_constants.lock().insert(*key, constants.data.clone());
                continue;
            }
            let region = self.layout.plan.fallback_constants().region(key);
            match (region, &self.fallback) {
                (Some(region), Some(fallback)) => fallback.write(region.offset, &constants.data),
                _ => prism_core::contract_violation!("constants {key:?} have no storage"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::binding::{BindingConstants, BindingConstantsData, BindingDesc, ShaderType};
    use prism_core::config::ValidationFilterConfig;
    use prism_core::interface::same_object;
    use prism_core::validation::ValidationFilter;
    use prism_core::view::View;

    use crate::config::SoftwareDeviceConfig;

    fn context(binding_model: BindingModel) -> Arc<DeviceContext> {
        DeviceContext::new(
            SoftwareDeviceConfig::default().with_binding_model(binding_model),
            Arc::new(ValidationFilter::new(ValidationFilterConfig::default())),
        )
    }

    fn buffer_view(context: &DeviceContext, view_type: ViewType) -> Arc<SoftwareView> {
        let buffer = SoftwareResource::new_buffer(
            &BufferDesc::new(256, BindFlag::SHADER_RESOURCE | BindFlag::UNORDERED_ACCESS, MemoryType::Default),
            context.next_id(),
            &context.accounting,
        )
        .unwrap();
        SoftwareView::new(buffer, &ViewDesc::new(view_type, ViewDimension::Buffer), &context.heaps).unwrap()
    }

    fn models() -> [BindingModel; 2] {
        [BindingModel::default(), BindingModel::descriptor_sets()]
    }

    #[test]
    fn written_views_read_back_at_their_keys() {
        let srv = BindKey::new(ShaderType::Pixel, ViewType::Buffer, 0, 0);
        let uav = BindKey::new(ShaderType::Pixel, ViewType::RWBuffer, 1, 0);
        let compute = BindKey::new(ShaderType::Compute, ViewType::Buffer, 0, 1);
        for model in models() {
            let context = context(model);
            let layout = SoftwareBindingSetLayout::new(&BindingSetLayoutDesc::new([srv, uav, compute]), &model).unwrap();
            let set = SoftwareBindingSet::new(layout, &context).unwrap();

            let views: Vec<Arc<dyn View>> = vec![
                buffer_view(&context, ViewType::Buffer),
                buffer_view(&context, ViewType::RWBuffer),
                buffer_view(&context, ViewType::Buffer),
            ];
            let bindings: Vec<BindingDesc> = [srv, uav, compute]
                .iter()
                .zip(&views)
                .map(|(key, view)| BindingDesc::new(*key, view))
                .collect();
            set.write_bindings(&bindings).unwrap();

            for (key, view) in [srv, uav, compute].iter().zip(&views) {
                assert!(same_object(&set.bound_view(key).unwrap(), view), "{model:?} {key:?}");
            }
        }
    }

    #[test]
    fn absent_view_keeps_previous_binding() {
        let key = BindKey::new(ShaderType::Vertex, ViewType::Buffer, 0, 0);
        for model in models() {
            let context = context(model);
            let layout = SoftwareBindingSetLayout::new(&BindingSetLayoutDesc::new([key]), &model).unwrap();
            let set = SoftwareBindingSet::new(layout, &context).unwrap();
            let view: Arc<dyn View> = buffer_view(&context, ViewType::Buffer);
            set.write_bindings(&[BindingDesc::new(key, &view)]).unwrap();
            set.write_bindings(&[BindingDesc { bind_key: key, view: None }]).unwrap();
            assert!(same_object(&set.bound_view(&key).unwrap(), &view));
        }
    }

    #[test]
    fn set_keeps_written_views_alive() {
        let key = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 0, 0);
        for model in models() {
            let context = context(model);
            let layout = SoftwareBindingSetLayout::new(&BindingSetLayoutDesc::new([key]), &model).unwrap();
            let set = SoftwareBindingSet::new(layout, &context).unwrap();
            let view = buffer_view(&context, ViewType::ConstantBuffer);
            let resource = Arc::clone(view.software_resource());
            let view: Arc<dyn View> = view;
            set.write_bindings(&[BindingDesc::new(key, &view)]).unwrap();
            drop(view);

            let bound = set.bound_view(&key).unwrap();
            assert!(Arc::ptr_eq(bound.software_resource(), &resource), "{model:?}");
            let referenced = set.referenced_resources();
            assert_eq!(referenced.len(), 1);
            assert!(Arc::ptr_eq(&referenced[0], &resource));
        }
    }

    #[test]
    fn stage_keys_sharing_a_slot_stay_apart_on_root_tables() {
        let vertex = BindKey::new(ShaderType::Vertex, ViewType::ConstantBuffer, 0, 0);
        let pixel = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 0, 0);
        let model = BindingModel::default();
        let context = context(model);
        let layout = SoftwareBindingSetLayout::new(&BindingSetLayoutDesc::new([vertex, pixel]), &model).unwrap();
        let set = SoftwareBindingSet::new(layout, &context).unwrap();
        let a: Arc<dyn View> = buffer_view(&context, ViewType::ConstantBuffer);
        let b: Arc<dyn View> = buffer_view(&context, ViewType::ConstantBuffer);
        set.write_bindings(&[BindingDesc::new(vertex, &a), BindingDesc::new(pixel, &b)]).unwrap();
        assert!(same_object(&set.bound_view(&vertex).unwrap(), &a));
        assert!(same_object(&set.bound_view(&pixel).unwrap(), &b));
    }

    #[test]
    #[should_panic(expected = "both map to set 0 binding 0")]
    fn stage_keys_sharing_a_slot_are_rejected_on_descriptor_sets() {
        let model = BindingModel::descriptor_sets();
        let desc = BindingSetLayoutDesc::new([
            BindKey::new(ShaderType::Vertex, ViewType::ConstantBuffer, 0, 0),
            BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 0, 0),
        ]);
        let _ = SoftwareBindingSetLayout::new(&desc, &model);
    }

    #[test]
    fn constants_read_back_whether_native_or_spilled() {
        let small = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 0, 0);
        let large = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 1, 0);
        let desc = BindingSetLayoutDesc::new(Vec::new()).with_constants([
            BindingConstants { bind_key: small, size: 16 },
            BindingConstants { bind_key: large, size: 512 },
        ]);
        for model in models() {
            let context = context(model);
            let layout = SoftwareBindingSetLayout::new(&desc, &model).unwrap();
            let set = SoftwareBindingSet::new(layout, &context).unwrap();
            assert!(!set.is_spilled(&small));
            assert!(set.is_spilled(&large));

            let small_data = BindingConstantsData::from_pod(small, &[1.0_f32, 2.0, 3.0, 4.0]);
            let large_data = BindingConstantsData {
                bind_key: large,
                data: (0..512).map(|i| (i % 251) as u8).collect(),
            };
            set.write_bindings_and_constants(&WriteBindingsDesc {
                bindings: &[],
                constants: &[small_data.clone(), large_data.clone()],
            })
            .unwrap();

            assert_eq!(set.constants(&small).unwrap(), small_data.data);
            assert_eq!(set.constants(&large).unwrap(), large_data.data);
            let fallback = set.bound_view(&fallback_bind_key(&large)).unwrap();
            assert_eq!(fallback.desc().view_type, ViewType::ConstantBuffer);
        }
    }

    #[test]
    fn root_table_sets_do_not_share_heap_slots() {
        let model = BindingModel::default();
        let context = context(model);
        let key = BindKey::new(ShaderType::Pixel, ViewType::Buffer, 0, 0);
        let layout = SoftwareBindingSetLayout::new(&BindingSetLayoutDesc::new([key]), &model).unwrap();
        let first = SoftwareBindingSet::new(Arc::clone(&layout), &context).unwrap();
        let second = SoftwareBindingSet::new(layout, &context).unwrap();
        let a: Arc<dyn View> = buffer_view(&context, ViewType::Buffer);
        let b: Arc<dyn View> = buffer_view(&context, ViewType::Buffer);
        first.write_bindings(&[BindingDesc::new(key, &a)]).unwrap();
        second.write_bindings(&[BindingDesc::new(key, &b)]).unwrap();
        assert!(same_object(&first.bound_view(&key).unwrap(), &a));
        assert!(same_object(&second.bound_view(&key).unwrap(), &b));
    }

    #[test]
    #[should_panic(expected = "not part of the layout")]
    fn writing_an_undeclared_key_is_fatal() {
        let model = BindingModel::default();
        let context = context(model);
        let declared = BindKey::new(ShaderType::Pixel, ViewType::Buffer, 0, 0);
        let other = BindKey::new(ShaderType::Pixel, ViewType::Buffer, 5, 0);
        let layout = SoftwareBindingSetLayout::new(&BindingSetLayoutDesc::new([declared]), &model).unwrap();
        let set = SoftwareBindingSet::new(layout, &context).unwrap();
        let view: Arc<dyn View> = buffer_view(&context, ViewType::Buffer);
        let _ = set.write_bindings(&[BindingDesc::new(other, &view)]);
    }
}
