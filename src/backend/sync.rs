// Synchronization primitives
//
// Fences (GPU -> CPU) and semaphores (GPU -> GPU) with RAII cleanup.
// Every CPU wait is bounded; the timeout surfaces as `RenderError::Timeout`.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::device::DeviceContext;
use crate::error::{vk_check, wait_check, Result};

/// Nanoseconds for a driver timeout, saturating at `u64::MAX` (wait forever).
pub fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

pub struct Fence {
    ctx: Arc<DeviceContext>,
    handle: vk::Fence,
}

impl Fence {
    pub fn new(ctx: &Arc<DeviceContext>, signaled: bool) -> Result<Self> {
        let handle = vk_check(ctx.driver().create_fence(signaled), "vkCreateFence")?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            handle,
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until signaled or until `timeout` elapses.
    pub fn wait(&self, what: &'static str, timeout: Duration) -> Result<()> {
        wait_check(
            self.ctx
                .driver()
                .wait_for_fences(&[self.handle], timeout_ns(timeout)),
            what,
            timeout,
        )
    }

    pub fn reset(&self) -> Result<()> {
        vk_check(self.ctx.driver().reset_fences(&[self.handle]), "vkResetFences")
    }

    pub fn is_signaled(&self) -> Result<bool> {
        vk_check(self.ctx.driver().fence_status(self.handle), "vkGetFenceStatus")
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.ctx.driver().destroy_fence(self.handle);
    }
}

pub struct Semaphore {
    ctx: Arc<DeviceContext>,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(ctx: &Arc<DeviceContext>) -> Result<Self> {
        let handle = vk_check(ctx.driver().create_semaphore(), "vkCreateSemaphore")?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            handle,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.ctx.driver().destroy_semaphore(self.handle);
    }
}

/// Frame-in-flight slot - one per entry of the scheduler's ring
pub struct FrameSlot {
    /// Signaled by the presentation engine when the acquired image is free.
    pub image_available: Semaphore,
    /// Signaled once everything submitted for the slot's last frame finished.
    /// Starts signaled so the first use of the slot does not block.
    pub in_flight: Fence,
}

impl FrameSlot {
    pub fn new(ctx: &Arc<DeviceContext>) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(ctx)?,
            in_flight: Fence::new(ctx, true)?,
        })
    }
}
