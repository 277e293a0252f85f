// Device context - the shared GPU connection
//
// Responsibilities:
// - Own the driver (instance, surface, logical device)
// - Hand out graphics / present queues, serialized behind one lock
// - One command pool per unique queue family
// - First-fit memory type lookup over cached memory properties
// - The fence timeout every bounded wait uses
//
// Everything else holds an `Arc<DeviceContext>`. Pools are destroyed in `Drop`,
// which only runs once the last command buffer owner is gone; the driver is
// dropped after the pools.

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::command::CommandPool;
use super::driver::{Driver, Submission};
use super::surface::SurfaceProvider;
use super::vulkan::{QueueFamilies, VulkanDriver};
use crate::error::{vk_check, RenderError, Result};

/// Default bound on every CPU-side fence wait.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// How to open the device.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub app_name: String,
    pub enable_validation: bool,
    pub fence_timeout: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            app_name: "vks-frame".to_string(),
            enable_validation: cfg!(debug_assertions),
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
        }
    }
}

pub struct DeviceContext {
    // Declared before `driver` so the pools go first if `Drop` is bypassed.
    pools: Vec<CommandPool>,
    graphics_pool: usize,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    queue_lock: Mutex<()>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    fence_timeout: Duration,
    driver: Arc<dyn Driver>,
}

impl DeviceContext {
    /// Open the GPU behind `platform`'s surface.
    pub fn create(settings: &DeviceSettings, platform: &dyn SurfaceProvider) -> Result<Arc<Self>> {
        let (driver, families) =
            VulkanDriver::new(&settings.app_name, settings.enable_validation, platform)?;
        Self::with_driver(Arc::new(driver), families, settings.fence_timeout)
    }

    /// Build a context over an already opened driver.
    pub fn with_driver(
        driver: Arc<dyn Driver>,
        families: QueueFamilies,
        fence_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let mut pools = Vec::new();
        for family in families.unique() {
            match CommandPool::new(driver.as_ref(), family) {
                Ok(pool) => pools.push(pool),
                Err(e) => {
                    for pool in &pools {
                        pool.destroy(driver.as_ref());
                    }
                    return Err(e);
                }
            }
        }

        let graphics_pool = pools
            .iter()
            .position(|pool| pool.family() == families.graphics)
            .ok_or_else(|| {
                RenderError::Initialization("no command pool for the graphics family".into())
            })?;

        let graphics_queue = driver.queue(families.graphics);
        let present_queue = driver.queue(families.present);
        let memory_properties = driver.memory_properties();

        log::debug!(
            "Device context ready: {} command pool(s), {} memory types, fence timeout {:?}",
            pools.len(),
            memory_properties.memory_type_count,
            fence_timeout
        );

        Ok(Arc::new(Self {
            pools,
            graphics_pool,
            families,
            graphics_queue,
            present_queue,
            queue_lock: Mutex::new(()),
            memory_properties,
            fence_timeout,
            driver,
        }))
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn fence_timeout(&self) -> Duration {
        self.fence_timeout
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn graphics_pool(&self) -> &CommandPool {
        &self.pools[self.graphics_pool]
    }

    pub fn command_pool(&self, family: u32) -> Option<&CommandPool> {
        self.pools.iter().find(|pool| pool.family() == family)
    }

    /// First memory type allowed by `type_bits` whose flags include `properties`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        find_memory_type(&self.memory_properties, type_bits, properties)
    }

    /// Property flags of memory type `index`.
    pub fn memory_type_flags(&self, index: u32) -> vk::MemoryPropertyFlags {
        self.memory_properties
            .memory_types
            .get(index as usize)
            .map(|t| t.property_flags)
            .unwrap_or_default()
    }

    pub fn submit(
        &self,
        queue: vk::Queue,
        submissions: &[Submission<'_>],
        fence: vk::Fence,
    ) -> Result<()> {
        let _guard = self.queue_lock.lock();
        vk_check(
            self.driver.queue_submit(queue, submissions, fence),
            "vkQueueSubmit",
        )
    }

    pub fn submit_graphics(&self, submissions: &[Submission<'_>], fence: vk::Fence) -> Result<()> {
        self.submit(self.graphics_queue, submissions, fence)
    }

    /// Present on the present queue. Returns `true` when suboptimal.
    pub fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let _guard = self.queue_lock.lock();
        vk_check(
            self.driver
                .queue_present(self.present_queue, swapchain, image_index, wait_semaphores),
            "vkQueuePresentKHR",
        )
    }

    /// Drain all GPU work.
    pub fn wait_idle(&self) -> Result<()> {
        let _guard = self.queue_lock.lock();
        vk_check(self.driver.device_wait_idle(), "vkDeviceWaitIdle")
    }
}

/// First-fit memory type selection.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(RenderError::NoSuitableMemoryType {
            type_bits,
            properties,
        })
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying device context...");

        if let Err(e) = self.driver.device_wait_idle() {
            log::warn!("vkDeviceWaitIdle failed during teardown: {:?}", e);
        }

        for pool in &self.pools {
            pool.destroy(self.driver.as_ref());
        }
        self.pools.clear();
    }
}
