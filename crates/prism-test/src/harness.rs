//! Device setup shared by every scenario.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prism::software::{BindingModel, SoftwareDeviceConfig, SoftwareInstance};
use prism::{
    ApiType, BindFlag, BufferDesc, CommandList, CommandListType, Device, DeviceConfig, Fence,
    Instance, InstanceConfig, MemoryType, Resource,
};

use crate::shaders::ShaderSet;
use crate::{Result, TestError};

/// Backend a scenario runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestBackend {
    Software(BindingModel),
    Vulkan,
}

impl TestBackend {
    /// Software device emulating root tables.
    pub fn root_tables() -> Self {
        Self::Software(BindingModel::default())
    }

    /// Software device emulating descriptor sets.
    pub const fn descriptor_sets() -> Self {
        Self::Software(BindingModel::descriptor_sets())
    }
}

/// An instance, its device and the shaders the scenarios need.
pub struct TestContext {
    backend: TestBackend,
    instance: Arc<dyn Instance>,
    device: Arc<dyn Device>,
    shaders: ShaderSet,
    fence: Arc<dyn Fence>,
    fence_value: AtomicU64,
}

impl TestContext {
    pub fn new(backend: TestBackend) -> Result<Self> {
        prism::logging::init_logging("warn");
        let config = InstanceConfig::default()
            .with_app_name("prism-test")
            .with_validation(true);
        let (instance, shaders): (Arc<dyn Instance>, _) = match backend {
            TestBackend::Software(binding_model) => {
                let device_config = SoftwareDeviceConfig::default()
                    .with_binding_model(binding_model)
                    .with_fence_timeout_ms(2_000);
                (
                    Arc::new(SoftwareInstance::with_device_config(&config, device_config)),
                    ShaderSet::placeholder(),
                )
            }
            TestBackend::Vulkan => {
                let shaders = ShaderSet::from_env()?;
                (prism::create_instance(ApiType::Vulkan, &config)?, shaders)
            }
        };
        let device = prism::create_device(&instance, &DeviceConfig::default())?;
        let fence = device.create_fence(0)?;
        tracing::debug!(?backend, "Test context ready");
        Ok(Self {
            backend,
            instance,
            device,
            shaders,
            fence,
            fence_value: AtomicU64::new(0),
        })
    }

    pub const fn backend(&self) -> TestBackend {
        self.backend
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn instance(&self) -> &Arc<dyn Instance> {
        &self.instance
    }

    pub const fn shaders(&self) -> &ShaderSet {
        &self.shaders
    }

    pub fn validation_errors(&self) -> u64 {
        self.instance.validation().error_count()
    }

    pub fn ensure_no_validation_errors(&self) -> Result<()> {
        match self.validation_errors() {
            0 => Ok(()),
            count => Err(TestError::Validation(count)),
        }
    }

    pub fn buffer(&self, size: u64, usage: BindFlag, memory_type: MemoryType) -> Result<Arc<dyn Resource>> {
        Ok(self.device.create_buffer(&BufferDesc::new(size, usage, memory_type))?)
    }

    /// Close `list`, execute it on its own queue and block until it is done.
    pub fn submit_and_wait(&self, list: &Arc<dyn CommandList>) -> Result<()> {
        list.close()?;
        let queue = self.device.command_queue(list.list_type());
        queue.execute_command_lists(std::slice::from_ref(list))?;
        self.flush(list.list_type())
    }

    /// Signal the harness fence on `queue_type` and wait for it.
    pub fn flush(&self, queue_type: CommandListType) -> Result<()> {
        let value = self.fence_value.fetch_add(1, Ordering::AcqRel) + 1;
        self.device.command_queue(queue_type).signal(&self.fence, value)?;
        self.fence.wait(value)?;
        Ok(())
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::warn!("Test device dropped with pending work: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_binding_models_create_devices() {
        for backend in [TestBackend::root_tables(), TestBackend::descriptor_sets()] {
            let context = TestContext::new(backend).unwrap();
            assert_eq!(context.backend(), backend);
            assert_eq!(context.instance().api_type(), ApiType::Software);
            context.flush(CommandListType::Copy).unwrap();
            context.ensure_no_validation_errors().unwrap();
        }
    }

    #[test]
    fn empty_lists_round_trip() {
        let context = TestContext::new(TestBackend::root_tables()).unwrap();
        let list = context.device().create_command_list(CommandListType::Compute).unwrap();
        context.submit_and_wait(&list).unwrap();
        list.reset().unwrap();
        context.submit_and_wait(&list).unwrap();
    }
}
