// Pipeline barriers
//
// A `Barrier` collects memory, buffer and image transitions that share one
// source/destination stage pair and emits them as a single
// vkCmdPipelineBarrier. It is transient: build it, record it, drop it.

use ash::vk;

use super::buffer::Buffer;
use super::device::DeviceContext;
use super::driver::Driver;
use super::image::Image;

#[derive(Clone)]
pub struct Barrier {
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    memory: Vec<vk::MemoryBarrier>,
    buffers: Vec<vk::BufferMemoryBarrier>,
    images: Vec<vk::ImageMemoryBarrier>,
}

impl Barrier {
    pub fn new(src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags) -> Self {
        Self {
            src_stage,
            dst_stage,
            memory: Vec::new(),
            buffers: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Global memory dependency.
    pub fn memory(
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        Self::new(src_stage, dst_stage).add_memory(src_access, dst_access)
    }

    /// Dependency on the whole of `buffer`.
    pub fn buffer(
        buffer: &Buffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        Self::new(src_stage, dst_stage).add_buffer(buffer, src_access, dst_access)
    }

    /// Dependency on `image` without a layout change.
    pub fn image(
        image: &Image,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        Self::new(src_stage, dst_stage).add_image(image, src_access, dst_access)
    }

    pub fn add_memory(mut self, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) -> Self {
        self.memory.push(
            vk::MemoryBarrier::builder()
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .build(),
        );
        self
    }

    pub fn add_buffer(
        self,
        buffer: &Buffer,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        self.add_buffer_range(buffer, 0, vk::WHOLE_SIZE, src_access, dst_access)
    }

    pub fn add_buffer_range(
        mut self,
        buffer: &Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        self.buffers.push(
            vk::BufferMemoryBarrier::builder()
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer.handle())
                .offset(offset)
                .size(size)
                .build(),
        );
        self
    }

    /// Access dependency on `image`, keeping its current layout.
    pub fn add_image(
        self,
        image: &Image,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        let layout = image.layout();
        self.add_image_transition(image, layout, layout, src_access, dst_access)
    }

    pub fn add_image_transition(
        self,
        image: &Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        self.add_raw_image_transition(
            image.handle(),
            image.subresource_range(),
            old_layout,
            new_layout,
            src_access,
            dst_access,
        )
    }

    pub(crate) fn add_raw_image_transition(
        mut self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        self.images.push(
            vk::ImageMemoryBarrier::builder()
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .build(),
        );
        self
    }

    pub fn src_stage(&self) -> vk::PipelineStageFlags {
        self.src_stage
    }

    pub fn dst_stage(&self) -> vk::PipelineStageFlags {
        self.dst_stage
    }

    pub fn memory_count(&self) -> usize {
        self.memory.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffers.is_empty() && self.images.is_empty()
    }

    /// Record into `command_buffer`, which must be recording.
    pub fn record(&self, driver: &dyn Driver, command_buffer: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        driver.cmd_pipeline_barrier(
            command_buffer,
            self.src_stage,
            self.dst_stage,
            &self.memory,
            &self.buffers,
            &self.images,
        );
    }

    pub fn apply(&self, ctx: &DeviceContext, command_buffer: vk::CommandBuffer) {
        self.record(ctx.driver(), command_buffer);
    }
}
