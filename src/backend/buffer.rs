// GPU buffers - vertex, index, uniform, storage and staging
//
// Each `Buffer` owns one dedicated allocation chosen first-fit from the
// device's memory types. Host access goes through a scoped `MappedMemory`
// guard; device-side copies use the blocking one-shot path.

use ash::vk;
use bytemuck::Pod;
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::device::DeviceContext;
use crate::error::{vk_check, RenderError, Result};

/// Allocate memory for `requirements` from the first type that has `properties`.
/// Returns the allocation and the actual flags of the chosen type.
pub(crate) fn allocate_memory(
    ctx: &DeviceContext,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<(vk::DeviceMemory, vk::MemoryPropertyFlags)> {
    let index = ctx.find_memory_type(requirements.memory_type_bits, properties)?;
    let memory = vk_check(
        ctx.driver().allocate_memory(requirements.size, index),
        "vkAllocateMemory",
    )?;
    Ok((memory, ctx.memory_type_flags(index)))
}

pub struct Buffer {
    ctx: Arc<DeviceContext>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
    map_lock: Mutex<()>,
}

impl Buffer {
    /// Create a buffer with its own memory. On any failure nothing is left
    /// allocated.
    pub fn new(
        ctx: &Arc<DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let driver = ctx.driver();
        let handle = vk_check(driver.create_buffer(size, usage), "vkCreateBuffer")?;

        let requirements = driver.buffer_memory_requirements(handle);
        let (memory, memory_flags) = match allocate_memory(ctx, requirements, properties) {
            Ok(allocation) => allocation,
            Err(e) => {
                driver.destroy_buffer(handle);
                return Err(e);
            }
        };

        if let Err(e) = vk_check(driver.bind_buffer_memory(handle, memory), "vkBindBufferMemory")
        {
            driver.free_memory(memory);
            driver.destroy_buffer(handle);
            return Err(e);
        }

        log::debug!(
            "Created buffer: {} bytes, usage {:?}, memory {:?}",
            size,
            usage,
            memory_flags
        );

        Ok(Self {
            ctx: Arc::clone(ctx),
            handle,
            memory,
            size,
            usage,
            memory_flags,
            map_lock: Mutex::new(()),
        })
    }

    /// Host-visible, coherent buffer filled with `data`.
    pub fn with_data<T: Pod>(
        ctx: &Arc<DeviceContext>,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new(
            ctx,
            bytes.len() as vk::DeviceSize,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.copy_host_data(bytes, 0)?;
        Ok(buffer)
    }

    /// Device-local buffer filled with `data` through a staging buffer.
    pub fn device_local_with_data<T: Pod>(
        ctx: &Arc<DeviceContext>,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let staging = Self::with_data(ctx, vk::BufferUsageFlags::TRANSFER_SRC, data)?;
        let buffer = Self::new(
            ctx,
            staging.size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        buffer.copy_from(&staging)?;
        Ok(buffer)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Flags of the memory type actually chosen.
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn is_coherent(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    /// Map `size` bytes starting at `offset`. Unmapped when the guard drops.
    pub fn map(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Result<MappedMemory<'_>> {
        if !self.is_host_visible() {
            return Err(RenderError::NotHostVisible);
        }
        let end = offset.saturating_add(size);
        if end > self.size {
            return Err(RenderError::SizeMismatch {
                expected: self.size,
                actual: end,
            });
        }

        let lock = self.map_lock.lock();
        let driver = self.ctx.driver();
        let ptr = vk_check(driver.map_memory(self.memory, offset, size), "vkMapMemory")?;
        if !self.is_coherent() {
            if let Err(e) = vk_check(
                driver.invalidate_memory(self.memory),
                "vkInvalidateMappedMemoryRanges",
            ) {
                driver.unmap_memory(self.memory);
                return Err(e);
            }
        }

        Ok(MappedMemory {
            buffer: self,
            ptr,
            len: size as usize,
            _lock: lock,
        })
    }

    /// Write `bytes` at `offset` through a temporary mapping.
    pub fn copy_host_data(&self, bytes: &[u8], offset: vk::DeviceSize) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut mapped = self.map(offset, bytes.len() as vk::DeviceSize)?;
        mapped.copy_from_slice(bytes);
        Ok(())
    }

    /// `copy_host_data` for any plain-old-data slice.
    pub fn write<T: Pod>(&self, data: &[T], offset: vk::DeviceSize) -> Result<()> {
        self.copy_host_data(bytemuck::cast_slice(data), offset)
    }

    pub fn read_host_data(&self, offset: vk::DeviceSize, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mapped = self.map(offset, len as vk::DeviceSize)?;
        Ok(mapped.to_vec())
    }

    /// Device-side copy of the whole of `src` into this buffer. Blocks until
    /// the copy has finished.
    pub fn copy_from(&self, src: &Buffer) -> Result<()> {
        if src.size != self.size {
            return Err(RenderError::SizeMismatch {
                expected: self.size,
                actual: src.size,
            });
        }

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: self.size,
        };
        self.ctx.run_one_shot(|driver, cb| {
            driver.cmd_copy_buffer(cb, src.handle, self.handle, &[region]);
        })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let driver = self.ctx.driver();
        driver.destroy_buffer(self.handle);
        driver.free_memory(self.memory);
    }
}

/// Host mapping of a buffer range.
pub struct MappedMemory<'a> {
    buffer: &'a Buffer,
    ptr: *mut u8,
    len: usize,
    _lock: MutexGuard<'a, ()>,
}

impl Deref for MappedMemory<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // The driver guarantees `len` mapped bytes at `ptr` until unmap.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl DerefMut for MappedMemory<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        let driver = self.buffer.ctx.driver();
        if !self.buffer.is_coherent() {
            if let Err(e) = driver.flush_memory(self.buffer.memory) {
                log::warn!("vkFlushMappedMemoryRanges failed: {:?}", e);
            }
        }
        driver.unmap_memory(self.buffer.memory);
    }
}
