//! Binding keys, binding-set layouts and binding sets.

use std::sync::Arc;

use bitflags::bitflags;

use crate::error::Result;
use crate::interface::QueryInterface;
use crate::require;
use crate::view::{View, ViewType};

/// `BindKey::count` marking an unbounded (bindless) array.
pub const BINDLESS_COUNT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ShaderType {
    #[default]
    Unknown,
    Vertex,
    Pixel,
    Compute,
    Geometry,
    Amplification,
    Mesh,
    Library,
}

bitflags! {
    /// Pipeline stages a binding is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const PIXEL = 1 << 1;
        const GEOMETRY = 1 << 2;
        const COMPUTE = 1 << 3;
        const AMPLIFICATION = 1 << 4;
        const MESH = 1 << 5;
        const RAY_TRACING = 1 << 6;
        const ALL = Self::VERTEX.bits()
            | Self::PIXEL.bits()
            | Self::GEOMETRY.bits()
            | Self::COMPUTE.bits()
            | Self::AMPLIFICATION.bits()
            | Self::MESH.bits()
            | Self::RAY_TRACING.bits();
    }
}

impl ShaderType {
    /// Stages that see a binding declared for this shader type.
    pub const fn stages(self) -> ShaderStages {
        match self {
            Self::Vertex => ShaderStages::VERTEX,
            Self::Pixel => ShaderStages::PIXEL,
            Self::Compute => ShaderStages::COMPUTE,
            Self::Geometry => ShaderStages::GEOMETRY,
            Self::Amplification => ShaderStages::AMPLIFICATION,
            Self::Mesh => ShaderStages::MESH,
            Self::Library => ShaderStages::RAY_TRACING,
            Self::Unknown => ShaderStages::ALL,
        }
    }

    /// Whether bindings of this shader type belong to the compute root.
    pub const fn is_compute(self) -> bool {
        matches!(self, Self::Compute | Self::Library)
    }
}

/// Abstract coordinate of one binding point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindKey {
    pub shader_type: ShaderType,
    pub view_type: ViewType,
    pub slot: u32,
    pub space: u32,
    pub count: u32,
}

impl BindKey {
    pub const fn new(shader_type: ShaderType, view_type: ViewType, slot: u32, space: u32) -> Self {
        Self {
            shader_type,
            view_type,
            slot,
            space,
            count: 1,
        }
    }

    pub const fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub const fn is_bindless(&self) -> bool {
        self.count == BINDLESS_COUNT
    }
}

/// One view written to one binding point.
///
/// `view: None` leaves whatever the binding held before in place.
#[derive(Clone)]
pub struct BindingDesc {
    pub bind_key: BindKey,
    pub view: Option<Arc<dyn View>>,
}

impl BindingDesc {
    pub fn new(bind_key: BindKey, view: &Arc<dyn View>) -> Self {
        Self {
            bind_key,
            view: Some(Arc::clone(view)),
        }
    }
}

impl std::fmt::Debug for BindingDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingDesc")
            .field("bind_key", &self.bind_key)
            .field("view", &self.view.as_ref().map(|view| view.desc().view_type))
            .finish()
    }
}

/// Inline 32-bit constants requested at a binding point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingConstants {
    pub bind_key: BindKey,
    /// Size in bytes; a multiple of four.
    pub size: u32,
}

impl BindingConstants {
    pub const fn dword_count(&self) -> u32 {
        self.size.div_ceil(4)
    }
}

/// Constant data written alongside bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingConstantsData {
    pub bind_key: BindKey,
    pub data: Vec<u8>,
}

impl BindingConstantsData {
    pub fn from_pod<T: bytemuck::Pod>(bind_key: BindKey, value: &T) -> Self {
        Self {
            bind_key,
            data: bytemuck::bytes_of(value).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingSetLayoutDesc {
    pub bind_keys: Vec<BindKey>,
    pub constants: Vec<BindingConstants>,
}

impl BindingSetLayoutDesc {
    pub fn new(bind_keys: impl Into<Vec<BindKey>>) -> Self {
        Self {
            bind_keys: bind_keys.into(),
            constants: Vec::new(),
        }
    }

    pub fn with_constants(mut self, constants: impl Into<Vec<BindingConstants>>) -> Self {
        self.constants = constants.into();
        self
    }

    /// Declared size of the constants at `bind_key`, if any.
    pub fn constants_size(&self, bind_key: &BindKey) -> Option<u32> {
        self.constants
            .iter()
            .find(|constants| constants.bind_key == *bind_key)
            .map(|constants| constants.size)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteBindingsDesc<'a> {
    pub bindings: &'a [BindingDesc],
    pub constants: &'a [BindingConstantsData],
}

/// Immutable translation of bind keys into a backend's binding points.
pub trait BindingSetLayout: QueryInterface {
    fn desc(&self) -> &BindingSetLayoutDesc;
}

/// Live instantiation of a layout.
pub trait BindingSet: QueryInterface {
    fn layout(&self) -> Arc<dyn BindingSetLayout>;

    fn write_bindings_and_constants(&self, desc: &WriteBindingsDesc<'_>) -> Result<()>;

    fn write_bindings(&self, bindings: &[BindingDesc]) -> Result<()> {
        self.write_bindings_and_constants(&WriteBindingsDesc {
            bindings,
            constants: &[],
        })
    }
}

/// Check every write in `desc` against `layout`.
///
/// Writes to keys the layout does not declare, views whose type differs from
/// the key's, and constants of the wrong size are contract violations.
pub fn validate_writes(layout: &BindingSetLayoutDesc, desc: &WriteBindingsDesc<'_>) {
    for binding in desc.bindings {
        let key = &binding.bind_key;
        require!(
            layout.bind_keys.contains(key) || layout.constants_size(key).is_some(),
            "binding {key:?} is not part of the layout"
        );
        if let Some(view) = &binding.view {
            let view_type = view.desc().view_type;
            require!(
                view_type == key.view_type,
                "view of type {view_type:?} written to binding of type {:?}",
                key.view_type
            );
        }
    }
    for constants in desc.constants {
        let key = &constants.bind_key;
        let Some(size) = layout.constants_size(key) else {
            crate::contract_violation!("constants {key:?} are not part of the layout");
        };
        require!(
            constants.data.len() == size as usize,
            "constants {key:?} declared as {size} bytes, written with {}",
            constants.data.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_keys_order_by_stage_then_type() {
        let pixel = BindKey::new(ShaderType::Pixel, ViewType::Texture, 0, 0);
        let vertex = BindKey::new(ShaderType::Vertex, ViewType::ConstantBuffer, 5, 0);
        assert!(vertex < pixel);
        assert!(pixel.with_count(BINDLESS_COUNT).is_bindless());
        assert!(!pixel.is_bindless());
    }

    #[test]
    fn compute_root_membership() {
        assert!(ShaderType::Compute.is_compute());
        assert!(ShaderType::Library.is_compute());
        assert!(!ShaderType::Pixel.is_compute());
        assert_eq!(ShaderType::Unknown.stages(), ShaderStages::ALL);
    }

    #[test]
    fn constants_lookup_and_dwords() {
        let key = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 1, 0);
        let desc = BindingSetLayoutDesc::default().with_constants([BindingConstants {
            bind_key: key,
            size: 12,
        }]);
        assert_eq!(desc.constants_size(&key), Some(12));
        assert_eq!(desc.constants[0].dword_count(), 3);
    }

    #[test]
    #[should_panic(expected = "declared as 16 bytes")]
    fn wrong_constant_size_is_fatal() {
        let key = BindKey::new(ShaderType::Pixel, ViewType::ConstantBuffer, 0, 0);
        let layout = BindingSetLayoutDesc::default().with_constants([BindingConstants {
            bind_key: key,
            size: 16,
        }]);
        let data = [BindingConstantsData {
            bind_key: key,
            data: vec![0; 8],
        }];
        validate_writes(
            &layout,
            &WriteBindingsDesc {
                bindings: &[],
                constants: &data,
            },
        );
    }
}
