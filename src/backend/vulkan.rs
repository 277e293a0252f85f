// Vulkan driver - ash-backed implementation of `Driver`
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Surface creation through the platform provider
// - Physical device selection (swapchain + graphics + present, prefer discrete)
// - Logical device with one queue per unique family
// - Thin forwarding of every `Driver` call to ash

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain};
use ash::prelude::VkResult;
use ash::{vk, Entry};
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};

use super::driver::{Driver, Submission, SwapchainDesc};
use super::surface::SurfaceProvider;
use crate::error::{vk_check, RenderError, Result};

/// Queue families chosen for the device. They may be the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct families, in ascending order.
    pub fn unique(&self) -> Vec<u32> {
        [self.graphics, self.present]
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Vulkan driver with automatic cleanup
pub struct VulkanDriver {
    // Vulkan handles (order matters for drop!)
    device: ash::Device,
    swapchain_loader: Swapchain,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    _entry: Entry,
}

/// Instance-level objects created before the logical device.
/// Destroyed on drop unless `finish` hands them over.
struct PartialInstance {
    instance: Option<ash::Instance>,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
}

type InstanceParts = (
    ash::Instance,
    Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    Surface,
    vk::SurfaceKHR,
);

impl PartialInstance {
    fn instance(&self) -> Result<&ash::Instance> {
        self.instance
            .as_ref()
            .ok_or_else(|| RenderError::Initialization("instance already handed over".into()))
    }

    fn finish(mut self) -> Result<InstanceParts> {
        let instance = self
            .instance
            .take()
            .ok_or_else(|| RenderError::Initialization("instance already handed over".into()))?;
        let surface = std::mem::replace(&mut self.surface, vk::SurfaceKHR::null());
        Ok((
            instance,
            self.debug_utils.take(),
            self.surface_loader.clone(),
            surface,
        ))
    }
}

impl Drop for PartialInstance {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        log::debug!("Releasing instance objects after a failed initialization");
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            instance.destroy_instance(None);
        }
    }
}

struct Candidate {
    device: vk::PhysicalDevice,
    families: QueueFamilies,
    score: u32,
}

impl VulkanDriver {
    /// Open the first suitable GPU for `platform`'s surface.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `platform` - Window system that provides the presentation surface
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        platform: &dyn SurfaceProvider,
    ) -> Result<(Self, QueueFamilies)> {
        log::info!("Creating Vulkan driver: {}", app_name);

        let entry = unsafe { Entry::load() }.map_err(|e| {
            RenderError::Initialization(format!("failed to load the Vulkan library: {e}"))
        })?;

        let instance = Self::create_instance(&entry, app_name, enable_validation, platform)?;
        let surface_loader = Surface::new(&entry, &instance);
        let mut partial = PartialInstance {
            instance: Some(instance),
            debug_utils: None,
            surface_loader,
            surface: vk::SurfaceKHR::null(),
        };
        // Dispatch table copy; `partial` keeps ownership of the handle.
        let instance = partial.instance()?.clone();

        if enable_validation {
            partial.debug_utils = Some(Self::setup_debug_messenger(&entry, &instance)?);
        }

        partial.surface = platform.create_surface(&entry, &instance)?;

        let candidate =
            Self::pick_physical_device(&instance, &partial.surface_loader, partial.surface)?;
        let device = Self::create_logical_device(&instance, &candidate)?;
        let swapchain_loader = Swapchain::new(&instance, &device);

        let properties = unsafe { instance.get_physical_device_properties(candidate.device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(candidate.device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={}",
            candidate.families.graphics,
            candidate.families.present
        );

        let (instance, debug_utils, surface_loader, surface) = partial.finish()?;
        Ok((
            Self {
                device,
                swapchain_loader,
                surface_loader,
                surface,
                physical_device: candidate.device,
                memory_properties,
                debug_utils,
                instance,
                _entry: entry,
            },
            candidate.families,
        ))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        platform: &dyn SurfaceProvider,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)
            .map_err(|e| RenderError::Initialization(format!("invalid application name: {e}")))?;
        let engine_name = c"vks-frame";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions = platform.required_instance_extensions()?;
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        vk_check(
            unsafe { entry.create_instance(&create_info, None) },
            "vkCreateInstance",
        )
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = vk_check(
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) },
            "vkCreateDebugUtilsMessengerEXT",
        )?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Candidate> {
        let devices = vk_check(
            unsafe { instance.enumerate_physical_devices() },
            "vkEnumeratePhysicalDevices",
        )?;

        if devices.is_empty() {
            return Err(RenderError::Initialization(
                "no Vulkan-capable GPU found".into(),
            ));
        }

        let mut best: Option<Candidate> = None;
        for device in devices {
            let Some(families) = Self::find_queue_families(instance, surface_loader, surface, device)
            else {
                continue;
            };
            if !Self::supports_swapchain(instance, device)
                || !Self::surface_is_adequate(surface_loader, surface, device)
            {
                continue;
            }

            let props = unsafe { instance.get_physical_device_properties(device) };
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(Candidate {
                    device,
                    families,
                    score,
                });
            }
        }

        best.ok_or_else(|| {
            RenderError::Initialization(
                "no GPU exposes the swapchain extension with graphics and present queues".into(),
            )
        })
    }

    fn find_queue_families(
        instance: &ash::Instance,
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Option<QueueFamilies> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let can_present = |index: u32| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        };

        let graphics = families
            .iter()
            .enumerate()
            .find(|(_, props)| {
                props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|(i, _)| i as u32)?;

        // Prefer a single family that can do both.
        let present = if can_present(graphics) {
            graphics
        } else {
            (0..families.len() as u32).find(|&i| can_present(i))?
        };

        Some(QueueFamilies { graphics, present })
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) })
        else {
            return false;
        };
        extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == Swapchain::name())
    }

    fn surface_is_adequate(
        surface_loader: &Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> bool {
        let formats = unsafe { surface_loader.get_physical_device_surface_formats(device, surface) };
        let modes =
            unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) };
        matches!((formats, modes), (Ok(f), Ok(m)) if !f.is_empty() && !m.is_empty())
    }

    fn create_logical_device(
        instance: &ash::Instance,
        candidate: &Candidate,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = candidate
            .families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [Swapchain::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        vk_check(
            unsafe { instance.create_device(candidate.device, &create_info, None) },
            "vkCreateDevice",
        )
    }
}

impl Driver for VulkanDriver {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn queue(&self, family: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, 0) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
        }
    }

    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
        }
    }

    fn surface_present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);

        create_info = if desc.queue_families.len() > 1 {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&desc.queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&fence_info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(fences, true, timeout_ns) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        unsafe { self.device.reset_fences(fences) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&semaphore_info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(&self, family: u32) -> VkResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        unsafe { self.device.create_command_pool(&pool_info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&alloc_info) }
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) }
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(usage);
        unsafe { self.device.begin_command_buffer(buffer, &begin_info) }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(buffer) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submissions: &[Submission<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let submit_infos: Vec<vk::SubmitInfo> = submissions
            .iter()
            .map(|s| {
                vk::SubmitInfo::builder()
                    .wait_semaphores(s.wait_semaphores)
                    .wait_dst_stage_mask(s.wait_stages)
                    .command_buffers(s.command_buffers)
                    .signal_semaphores(s.signal_semaphores)
                    .build()
            })
            .collect();
        unsafe { self.device.queue_submit(queue, &submit_infos, fence) }
    }

    fn cmd_begin_render_pass(
        &self,
        buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(buffer, &begin_info, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(buffer) }
    }

    fn cmd_set_viewport(&self, buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(buffer, 0, &[viewport]) }
    }

    fn cmd_set_scissor(&self, buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(buffer, 0, &[scissor]) }
    }

    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(buffer, bind_point, pipeline) }
    }

    fn cmd_bind_vertex_buffer(
        &self,
        buffer: vk::CommandBuffer,
        binding: u32,
        vertex_buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(buffer, binding, &[vertex_buffer], &[offset])
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        buffer: vk::CommandBuffer,
        index_buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(buffer, index_buffer, offset, index_type)
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(buffer, bind_point, layout, 0, &[set], &[])
        }
    }

    fn cmd_draw(&self, buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        unsafe { self.device.cmd_draw(buffer, vertex_count, instance_count, 0, 0) }
    }

    fn cmd_draw_indexed(&self, buffer: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        unsafe {
            self.device
                .cmd_draw_indexed(buffer, index_count, instance_count, 0, 0, 0)
        }
    }

    fn cmd_dispatch(&self, buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(buffer, x, y, z) }
    }

    fn cmd_pipeline_barrier(
        &self,
        buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory: &[vk::MemoryBarrier],
        buffers: &[vk::BufferMemoryBarrier],
        images: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                memory,
                buffers,
                images,
            )
        }
    }

    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(buffer, src, dst, regions) }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(buffer, src, dst, layout, regions)
        }
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&buffer_info, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        unsafe { self.device.create_image(info, None) }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&alloc_info, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> VkResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, 0) }
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8> {
        unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
                .map(|ptr| ptr.cast::<u8>())
        }
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn flush_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { self.device.flush_mapped_memory_ranges(&[range]) }
    }

    fn invalidate_memory(&self, memory: vk::DeviceMemory) -> VkResult<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe { self.device.invalidate_mapped_memory_ranges(&[range]) }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        unsafe { self.device.create_image_view(info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, info: &vk::SamplerCreateInfo) -> VkResult<vk::Sampler> {
        unsafe { self.device.create_sampler(info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        unsafe { self.device.create_render_pass(info, None) }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        unsafe { self.device.create_framebuffer(info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&create_info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet]) {
        unsafe { self.device.update_descriptor_sets(writes, &[]) }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        let create_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);
        unsafe { self.device.create_pipeline_layout(&create_info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline> {
        let pipelines = unsafe {
            self.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(info),
                None,
            )
        }
        .map_err(|(_, result)| result)?;
        pipelines.first().copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn create_compute_pipeline(
        &self,
        info: &vk::ComputePipelineCreateInfo,
    ) -> VkResult<vk::Pipeline> {
        let pipelines = unsafe {
            self.device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(info),
                None,
            )
        }
        .map_err(|(_, result)| result)?;
        pipelines.first().copied().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan driver...");

        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::warn!("vkDeviceWaitIdle failed during teardown: {:?}", e);
        }

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Validation layer messages are routed to `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_families_collapse_when_shared() {
        let shared = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        assert_eq!(shared.unique(), vec![0]);

        let split = QueueFamilies {
            graphics: 2,
            present: 1,
        };
        assert_eq!(split.unique(), vec![1, 2]);
    }
}
