// Command pools and one-shot submission
//
// One pool per queue family, owned by the `DeviceContext`. Pools are created
// with RESET_COMMAND_BUFFER so every primary buffer can be re-recorded
// individually. Access to a pool is serialized with its own lock.

use ash::vk;
use parking_lot::Mutex;

use super::device::DeviceContext;
use super::driver::{Driver, Submission};
use super::sync::timeout_ns;
use crate::error::{vk_check, wait_check, Result};

pub struct CommandPool {
    handle: vk::CommandPool,
    family: u32,
    lock: Mutex<()>,
}

impl CommandPool {
    pub(crate) fn new(driver: &dyn Driver, family: u32) -> Result<Self> {
        let handle = vk_check(driver.create_command_pool(family), "vkCreateCommandPool")?;
        log::debug!("Created command pool for queue family {}", family);
        Ok(Self {
            handle,
            family,
            lock: Mutex::new(()),
        })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn allocate(&self, driver: &dyn Driver, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let _guard = self.lock.lock();
        vk_check(
            driver.allocate_command_buffers(self.handle, count),
            "vkAllocateCommandBuffers",
        )
    }

    pub fn free(&self, driver: &dyn Driver, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        let _guard = self.lock.lock();
        driver.free_command_buffers(self.handle, buffers);
    }

    /// Also frees every buffer still allocated from the pool.
    pub(crate) fn destroy(&self, driver: &dyn Driver) {
        let _guard = self.lock.lock();
        driver.destroy_command_pool(self.handle);
    }
}

impl DeviceContext {
    /// One primary command buffer from the graphics pool.
    pub fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let buffers = self.graphics_pool().allocate(self.driver(), 1)?;
        buffers.into_iter().next().ok_or(crate::error::RenderError::AllocationFailure {
            call: "vkAllocateCommandBuffers",
            result: vk::Result::ERROR_UNKNOWN,
        })
    }

    pub fn free_command_buffer(&self, buffer: vk::CommandBuffer) {
        self.graphics_pool().free(self.driver(), &[buffer]);
    }

    /// Record with `record`, submit on the graphics queue and block until the
    /// GPU is done (bounded by the fence timeout).
    pub fn run_one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&dyn Driver, vk::CommandBuffer),
    {
        let driver = self.driver();
        let buffer = self.allocate_command_buffer()?;
        let fence = match vk_check(driver.create_fence(false), "vkCreateFence") {
            Ok(fence) => fence,
            Err(e) => {
                self.free_command_buffer(buffer);
                return Err(e);
            }
        };

        let result = self.record_and_wait(buffer, fence, record);

        match &result {
            // The buffer may still be pending; freeing it would be a use-after-free.
            Err(e) if e.is_timeout() => {
                log::error!("One-shot submission did not finish; leaking its command buffer");
            }
            _ => {
                driver.destroy_fence(fence);
                self.free_command_buffer(buffer);
            }
        }

        result
    }

    fn record_and_wait<F>(&self, buffer: vk::CommandBuffer, fence: vk::Fence, record: F) -> Result<()>
    where
        F: FnOnce(&dyn Driver, vk::CommandBuffer),
    {
        let driver = self.driver();
        vk_check(
            driver.begin_command_buffer(buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            "vkBeginCommandBuffer",
        )?;
        record(driver, buffer);
        vk_check(driver.end_command_buffer(buffer), "vkEndCommandBuffer")?;

        let command_buffers = [buffer];
        self.submit_graphics(
            &[Submission {
                command_buffers: &command_buffers,
                ..Default::default()
            }],
            fence,
        )?;

        let timeout = self.fence_timeout();
        wait_check(
            driver.wait_for_fences(&[fence], timeout_ns(timeout)),
            "one-shot submission",
            timeout,
        )
    }
}
