// Driver seam
//
// Every Vulkan entry point the renderer touches goes through `Driver`.
// Production code talks to the GPU through `VulkanDriver` (ash); the test
// suite swaps in a recording fake that simulates fences and queues so the
// frame pacing logic can be checked without hardware.
//
// Handles are plain `ash::vk` handles. Callers own the usual Vulkan validity
// rules: a handle passed in must have been created by the same driver and not
// yet destroyed.

use ash::prelude::VkResult;
use ash::vk;

/// One batch of a queue submission.
#[derive(Clone, Copy, Default)]
pub struct Submission<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Parameters for swapchain creation, already resolved against the surface.
#[derive(Clone, Debug)]
pub struct SwapchainDesc {
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// More than one family means the images are shared concurrently.
    pub queue_families: Vec<u32>,
}

pub trait Driver: Send + Sync {
    // ── Device ──────────────────────────────────────────────────────────────
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;
    fn queue(&self, family: u32) -> vk::Queue;
    fn device_wait_idle(&self) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;

    // ── Surface & swapchain ─────────────────────────────────────────────────
    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    /// Returns `(image_index, suboptimal)`.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// Returns `true` when the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool>;

    // ── Synchronization ─────────────────────────────────────────────────────
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Waits for all `fences`; `Err(vk::Result::TIMEOUT)` when the timeout elapses.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> VkResult<()>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()>;
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // ── Command pools & submission ──────────────────────────────────────────
    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()>;
    /// An empty `submissions` slice with a fence is legal: the fence signals
    /// once everything queued before it has completed.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submissions: &[Submission<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;

    // ── Recording ───────────────────────────────────────────────────────────
    fn cmd_begin_render_pass(
        &self,
        buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    );
    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer);
    fn cmd_set_viewport(&self, buffer: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, buffer: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_vertex_buffer(
        &self,
        buffer: vk::CommandBuffer,
        binding: u32,
        vertex_buffer: vk::Buffer,
        offset: vk::DeviceSize,
    );
    fn cmd_bind_index_buffer(
        &self,
        buffer: vk::CommandBuffer,
        index_buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_bind_descriptor_set(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_draw(&self, buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32);
    fn cmd_draw_indexed(&self, buffer: vk::CommandBuffer, index_count: u32, instance_count: u32);
    fn cmd_dispatch(&self, buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_pipeline_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory: &[vk::MemoryBarrier],
        buffers: &[vk::BufferMemoryBarrier],
        images: &[vk::ImageMemoryBarrier],
    );
    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    // ── Memory & resources ──────────────────────────────────────────────────
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;
    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, memory: vk::DeviceMemory);
    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()>;
    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()>;
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8>;
    fn unmap_memory(&self, memory: vk::DeviceMemory);
    /// Flush the whole allocation (non-coherent memory only).
    fn flush_memory(&self, memory: vk::DeviceMemory) -> VkResult<()>;
    /// Invalidate the whole allocation (non-coherent memory only).
    fn invalidate_memory(&self, memory: vk::DeviceMemory) -> VkResult<()>;
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_sampler(&self, info: &vk::SamplerCreateInfo) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // ── Pipeline objects ────────────────────────────────────────────────────
    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet]);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline>;
    fn create_compute_pipeline(&self, info: &vk::ComputePipelineCreateInfo)
        -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}
