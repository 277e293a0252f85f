// Recording driver for tests
//
// Implements `Driver` without a GPU. Every queue/fence/present call is logged
// as an `Event`, every recorded command is kept per command buffer, and the
// "GPU" retires submissions according to a `GpuMode`:
//
// - Immediate: work completes the moment it is submitted.
// - Lagging:   work stays pending until a CPU wait needs one of its fences,
//              at which point everything up to that submission retires.
// - Stalled:   nothing retires until `complete_pending` / `signal_fence`;
//              waits block until then or until their timeout.
//
// Failures are injected per entry point with `fail_next`, and `set_suboptimal`
// makes acquire/present report VK_SUBOPTIMAL_KHR. `recycle_handles` lets a
// destroyed object's handle value come back for the next one.
//
// Protocol violations (resetting or resubmitting a pending fence, re-recording
// a pending command buffer) are collected in `violations()`.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::device::DeviceContext;
use super::driver::{Driver, Submission, SwapchainDesc};
use super::vulkan::QueueFamilies;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMode {
    Immediate,
    Lagging,
    Stalled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceWaitIdle,
    QueueWaitIdle(vk::Queue),
    WaitFences {
        fences: Vec<vk::Fence>,
        already_signaled: bool,
    },
    ResetFences(Vec<vk::Fence>),
    Acquire {
        image: u32,
        semaphore: vk::Semaphore,
    },
    Submit {
        queue: vk::Queue,
        wait_semaphores: Vec<vk::Semaphore>,
        wait_stages: Vec<vk::PipelineStageFlags>,
        command_buffers: Vec<vk::CommandBuffer>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Present {
        image: u32,
        wait_semaphores: Vec<vk::Semaphore>,
    },
    BeginCommandBuffer {
        buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    },
    CreateGraphicsPipeline {
        render_pass: vk::RenderPass,
        subpass: u32,
    },
}

/// A recorded command, reduced to comparable data.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: (u32, u32),
        clear_values: usize,
    },
    EndRenderPass,
    SetViewport { width: f32, height: f32 },
    SetScissor { width: u32, height: u32 },
    BindPipeline(vk::PipelineBindPoint, vk::Pipeline),
    BindVertexBuffer(u32, vk::Buffer, vk::DeviceSize),
    BindIndexBuffer(vk::Buffer, vk::DeviceSize, vk::IndexType),
    BindDescriptorSet(vk::PipelineBindPoint, vk::PipelineLayout, vk::DescriptorSet),
    Draw(u32, u32),
    DrawIndexed(u32, u32),
    Dispatch(u32, u32, u32),
    PipelineBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory: usize,
        buffers: usize,
        /// `(image, old_layout, new_layout)` per image barrier.
        images: Vec<(vk::Image, vk::ImageLayout, vk::ImageLayout)>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<(vk::DeviceSize, vk::DeviceSize, vk::DeviceSize)>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
    },
}

struct PendingSubmit {
    fence: vk::Fence,
    command_buffers: Vec<vk::CommandBuffer>,
}

struct FakeBuffer {
    size: vk::DeviceSize,
    memory: Option<vk::DeviceMemory>,
}

struct State {
    next_handle: u64,
    gpu_mode: GpuMode,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    buffer_type_bits: Option<u32>,
    image_count: u32,
    acquire_order: Vec<u32>,
    acquire_cursor: usize,
    failures: HashMap<&'static str, vk::Result>,
    suboptimal: bool,
    /// Destroyed object handles, handed out again when recycling is on.
    recycled: Option<Vec<u64>>,

    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    command_pools: HashSet<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, vk::CommandPool>,
    commands: HashMap<vk::CommandBuffer, Vec<Command>>,
    pending_buffers: HashMap<vk::CommandBuffer, usize>,
    queue: VecDeque<PendingSubmit>,

    buffers: HashMap<vk::Buffer, FakeBuffer>,
    memories: HashMap<vk::DeviceMemory, Vec<u8>>,
    mapped: HashSet<vk::DeviceMemory>,
    images: HashMap<vk::Image, vk::DeviceSize>,
    swapchain_images: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    objects: HashMap<&'static str, HashSet<u64>>,
    descriptor_writes: Vec<(vk::DescriptorSet, u32, vk::DescriptorType)>,

    events: Vec<Event>,
    violations: Vec<String>,
}

impl State {
    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn create_object(&mut self, kind: &'static str) -> u64 {
        let raw = match self.recycled.as_mut().and_then(Vec::pop) {
            Some(raw) => raw,
            None => self.next_raw(),
        };
        self.objects.entry(kind).or_default().insert(raw);
        raw
    }

    fn destroy_object(&mut self, kind: &'static str, raw: u64) {
        if raw == 0 {
            return;
        }
        let removed = self.objects.get_mut(kind).map_or(false, |set| set.remove(&raw));
        if !removed {
            self.violations
                .push(format!("destroyed unknown {kind} {raw:#x}"));
        } else if let Some(recycled) = self.recycled.as_mut() {
            recycled.push(raw);
        }
    }

    fn take_failure(&mut self, call: &'static str) -> VkResult<()> {
        match self.failures.remove(call) {
            Some(result) => Err(result),
            None => Ok(()),
        }
    }

    fn is_pending(&self, fence: vk::Fence) -> bool {
        self.queue.iter().any(|p| p.fence == fence)
    }

    fn retire_front(&mut self) {
        if let Some(done) = self.queue.pop_front() {
            if done.fence != vk::Fence::null() {
                self.fences.insert(done.fence, true);
            }
            for cb in done.command_buffers {
                if let Some(count) = self.pending_buffers.get_mut(&cb) {
                    *count -= 1;
                    if *count == 0 {
                        self.pending_buffers.remove(&cb);
                    }
                }
            }
        }
    }

    fn retire_all(&mut self) {
        while !self.queue.is_empty() {
            self.retire_front();
        }
    }

    /// Retire in FIFO order up to the last submission carrying one of `fences`.
    fn retire_through(&mut self, fences: &[vk::Fence]) {
        if let Some(last) = self.queue.iter().rposition(|p| fences.contains(&p.fence)) {
            for _ in 0..=last {
                self.retire_front();
            }
        }
    }

    fn all_signaled(&self, fences: &[vk::Fence]) -> bool {
        fences
            .iter()
            .all(|f| self.fences.get(f).copied().unwrap_or(false))
    }

    fn record(&mut self, buffer: vk::CommandBuffer, command: Command) {
        self.commands.entry(buffer).or_default().push(command);
    }

    fn execute_copies(&mut self, buffer: vk::CommandBuffer) {
        let copies: Vec<_> = self
            .commands
            .get(&buffer)
            .map(|cmds| {
                cmds.iter()
                    .filter_map(|c| match c {
                        Command::CopyBuffer { src, dst, regions } => {
                            Some((*src, *dst, regions.clone()))
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (src, dst, regions) in copies {
            let src_mem = self.buffers.get(&src).and_then(|b| b.memory);
            let dst_mem = self.buffers.get(&dst).and_then(|b| b.memory);
            let (Some(src_mem), Some(dst_mem)) = (src_mem, dst_mem) else {
                self.violations.push("copy between unbound buffers".into());
                continue;
            };
            for (src_offset, dst_offset, size) in regions {
                let bytes: Vec<u8> = self.memories[&src_mem]
                    [src_offset as usize..(src_offset + size) as usize]
                    .to_vec();
                if let Some(dst_bytes) = self.memories.get_mut(&dst_mem) {
                    dst_bytes[dst_offset as usize..(dst_offset + size) as usize]
                        .copy_from_slice(&bytes);
                }
            }
        }
    }
}

pub struct FakeDriver {
    state: Mutex<State>,
    retired: Condvar,
}

fn default_memory_properties() -> vk::PhysicalDeviceMemoryProperties {
    let mut props = vk::PhysicalDeviceMemoryProperties::default();
    props.memory_type_count = 2;
    props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    props.memory_types[0].heap_index = 0;
    props.memory_types[1].property_flags =
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
    props.memory_types[1].heap_index = 1;
    props.memory_heap_count = 2;
    props.memory_heaps[0].size = 1 << 30;
    props.memory_heaps[0].flags = vk::MemoryHeapFlags::DEVICE_LOCAL;
    props.memory_heaps[1].size = 1 << 30;
    props
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_handle: 0x1000,
                gpu_mode: GpuMode::Immediate,
                memory_properties: default_memory_properties(),
                buffer_type_bits: None,
                image_count: 2,
                acquire_order: Vec::new(),
                acquire_cursor: 0,
                failures: HashMap::new(),
                suboptimal: false,
                recycled: None,
                fences: HashMap::new(),
                semaphores: HashSet::new(),
                command_pools: HashSet::new(),
                command_buffers: HashMap::new(),
                commands: HashMap::new(),
                pending_buffers: HashMap::new(),
                queue: VecDeque::new(),
                buffers: HashMap::new(),
                memories: HashMap::new(),
                mapped: HashSet::new(),
                images: HashMap::new(),
                swapchain_images: HashMap::new(),
                objects: HashMap::new(),
                descriptor_writes: Vec::new(),
                events: Vec::new(),
                violations: Vec::new(),
            }),
            retired: Condvar::new(),
        })
    }

    /// Fake driver plus a context over it with a one second fence timeout.
    pub fn context() -> (Arc<Self>, Arc<DeviceContext>) {
        Self::context_with_timeout(Duration::from_secs(1))
    }

    pub fn context_with_timeout(timeout: Duration) -> (Arc<Self>, Arc<DeviceContext>) {
        let fake = Self::new();
        let families = QueueFamilies {
            graphics: 0,
            present: 0,
        };
        let ctx = DeviceContext::with_driver(fake.clone(), families, timeout)
            .expect("fake device context");
        (fake, ctx)
    }

    // ── Knobs ───────────────────────────────────────────────────────────────

    pub fn set_gpu_mode(&self, mode: GpuMode) {
        let mut state = self.state.lock();
        state.gpu_mode = mode;
        if mode == GpuMode::Immediate {
            state.retire_all();
            self.retired.notify_all();
        }
    }

    /// Number of images the next swapchain gets.
    pub fn set_image_count(&self, count: u32) {
        self.state.lock().image_count = count;
    }

    /// Cycle through `order` on acquire instead of round-robin.
    pub fn set_acquire_order(&self, order: Vec<u32>) {
        let mut state = self.state.lock();
        state.acquire_order = order;
        state.acquire_cursor = 0;
    }

    /// Make the next call to `call` ("vkAcquireNextImageKHR",
    /// "vkQueuePresentKHR", "vkQueueSubmit", "vkResetFences") return `result`
    /// without doing anything.
    pub fn fail_next(&self, call: &'static str, result: vk::Result) {
        self.state.lock().failures.insert(call, result);
    }

    pub fn set_suboptimal(&self, suboptimal: bool) {
        self.state.lock().suboptimal = suboptimal;
    }

    /// Reuse destroyed handle values for new objects, like real drivers do.
    pub fn recycle_handles(&self) {
        self.state.lock().recycled.get_or_insert_with(Vec::new);
    }

    pub fn set_memory_types(&self, flags: &[vk::MemoryPropertyFlags]) {
        let mut state = self.state.lock();
        state.memory_properties.memory_type_count = flags.len() as u32;
        for (i, &f) in flags.iter().enumerate() {
            state.memory_properties.memory_types[i].property_flags = f;
            state.memory_properties.memory_types[i].heap_index = 0;
        }
    }

    /// Override `memoryTypeBits` reported for buffers.
    pub fn set_buffer_memory_type_bits(&self, bits: u32) {
        self.state.lock().buffer_type_bits = Some(bits);
    }

    // ── GPU progress ────────────────────────────────────────────────────────

    pub fn complete_pending(&self) {
        self.state.lock().retire_all();
        self.retired.notify_all();
    }

    pub fn signal_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.is_pending(fence) {
            state.retire_through(&[fence]);
        } else {
            state.fences.insert(fence, true);
        }
        self.retired.notify_all();
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().queue.len()
    }

    // ── Inspection ──────────────────────────────────────────────────────────

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn submits(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Submit { .. }))
            .collect()
    }

    pub fn commands(&self, buffer: vk::CommandBuffer) -> Vec<Command> {
        self.state
            .lock()
            .commands
            .get(&buffer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn descriptor_writes(&self) -> Vec<(vk::DescriptorSet, u32, vk::DescriptorType)> {
        self.state.lock().descriptor_writes.clone()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_command_pools(&self) -> usize {
        self.state.lock().command_pools.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().memories.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Live objects of a kind tracked generically ("image view", "pipeline", ...).
    pub fn live(&self, kind: &str) -> usize {
        self.state
            .lock()
            .objects
            .get(kind)
            .map_or(0, |set| set.len())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock())
    }

    fn recording(&self, buffer: vk::CommandBuffer, command: Command) {
        self.with_state(|s| s.record(buffer, command));
    }
}

impl Driver for FakeDriver {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.state.lock().memory_properties
    }

    fn queue(&self, family: u32) -> vk::Queue {
        vk::Queue::from_raw(0x100 + family as u64)
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.events.push(Event::DeviceWaitIdle);
        if state.gpu_mode != GpuMode::Stalled {
            state.retire_all();
            self.retired.notify_all();
        }
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        let mut state = self.state.lock();
        state.events.push(Event::QueueWaitIdle(queue));
        if state.gpu_mode != GpuMode::Stalled {
            state.retire_all();
            self.retired.notify_all();
        }
        Ok(())
    }

    fn surface_capabilities(&self) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        let count = self.state.lock().image_count;
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: count.saturating_sub(1).max(1),
            max_image_count: count,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
        })
    }

    fn surface_formats(&self) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ])
    }

    fn surface_present_modes(&self) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX])
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        self.with_state(|s| {
            let swapchain = vk::SwapchainKHR::from_raw(s.create_object("swapchain"));
            let count = desc.min_image_count.max(s.image_count);
            let images = (0..count)
                .map(|_| vk::Image::from_raw(s.next_raw()))
                .collect();
            s.swapchain_images.insert(swapchain, images);
            Ok(swapchain)
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.with_state(|s| {
            s.swapchain_images.remove(&swapchain);
            s.destroy_object("swapchain", swapchain.as_raw());
        });
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.with_state(|s| {
            s.swapchain_images
                .get(&swapchain)
                .cloned()
                .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
        })
    }

    fn acquire_next_image(
        &self,
        _swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        self.with_state(|s| -> VkResult<(u32, bool)> {
            s.take_failure("vkAcquireNextImageKHR")?;
            let image = if s.acquire_order.is_empty() {
                (s.acquire_cursor as u32) % s.image_count.max(1)
            } else {
                s.acquire_order[s.acquire_cursor % s.acquire_order.len()]
            };
            s.acquire_cursor += 1;
            s.events.push(Event::Acquire { image, semaphore });
            Ok((image, s.suboptimal))
        })
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        self.with_state(|s| -> VkResult<bool> {
            s.take_failure("vkQueuePresentKHR")?;
            s.events.push(Event::Present {
                image: image_index,
                wait_semaphores: wait_semaphores.to_vec(),
            });
            Ok(s.suboptimal)
        })
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        self.with_state(|s| {
            let fence = vk::Fence::from_raw(s.next_raw());
            s.fences.insert(fence, signaled);
            Ok(fence)
        })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.with_state(|s| {
            if s.is_pending(fence) {
                s.violations.push(format!("destroyed pending fence {fence:?}"));
            }
            s.fences.remove(&fence);
        });
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        let already_signaled = state.all_signaled(fences);
        state.events.push(Event::WaitFences {
            fences: fences.to_vec(),
            already_signaled,
        });

        if !already_signaled && state.gpu_mode == GpuMode::Lagging {
            state.retire_through(fences);
        }

        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        while !state.all_signaled(fences) {
            match deadline {
                Some(deadline) => {
                    if self.retired.wait_until(&mut state, deadline).timed_out()
                        && !state.all_signaled(fences)
                    {
                        return Err(vk::Result::TIMEOUT);
                    }
                }
                None => self.retired.wait(&mut state),
            }
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        self.with_state(|s| -> VkResult<()> {
            s.take_failure("vkResetFences")?;
            for &fence in fences {
                if s.is_pending(fence) {
                    s.violations.push(format!("reset pending fence {fence:?}"));
                }
                s.fences.insert(fence, false);
            }
            s.events.push(Event::ResetFences(fences.to_vec()));
            Ok(())
        })
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self.state.lock().fences.get(&fence).copied().unwrap_or(false))
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.with_state(|s| {
            let semaphore = vk::Semaphore::from_raw(s.next_raw());
            s.semaphores.insert(semaphore);
            Ok(semaphore)
        })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.with_state(|s| {
            s.semaphores.remove(&semaphore);
        });
    }

    fn create_command_pool(&self, _family: u32) -> VkResult<vk::CommandPool> {
        self.with_state(|s| {
            let pool = vk::CommandPool::from_raw(s.next_raw());
            s.command_pools.insert(pool);
            Ok(pool)
        })
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.with_state(|s| {
            s.command_pools.remove(&pool);
            s.command_buffers.retain(|_, owner| *owner != pool);
        });
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        self.with_state(|s| {
            Ok((0..count)
                .map(|_| {
                    let buffer = vk::CommandBuffer::from_raw(s.next_raw());
                    s.command_buffers.insert(buffer, pool);
                    buffer
                })
                .collect())
        })
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        self.with_state(|s| {
            for buffer in buffers {
                if s.pending_buffers.contains_key(buffer) {
                    s.violations.push(format!("freed pending command buffer {buffer:?}"));
                }
                s.command_buffers.remove(buffer);
            }
        });
    }

    fn begin_command_buffer(
        &self,
        buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        self.with_state(|s| {
            if s.pending_buffers.contains_key(&buffer) {
                s.violations
                    .push(format!("re-recorded pending command buffer {buffer:?}"));
            }
            s.commands.insert(buffer, Vec::new());
            s.events.push(Event::BeginCommandBuffer { buffer, usage });
        });
        Ok(())
    }

    fn end_command_buffer(&self, _buffer: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submissions: &[Submission<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.take_failure("vkQueueSubmit")?;

        if fence != vk::Fence::null() {
            if state.is_pending(fence) {
                state.violations.push(format!("resubmitted pending fence {fence:?}"));
            } else if state.fences.get(&fence).copied().unwrap_or(false) {
                state.violations.push(format!("submitted signaled fence {fence:?}"));
            }
        }

        let mut event_waits = Vec::new();
        let mut event_stages = Vec::new();
        let mut event_buffers = Vec::new();
        let mut event_signals = Vec::new();
        for submission in submissions {
            if submission.wait_semaphores.len() != submission.wait_stages.len() {
                state
                    .violations
                    .push("wait semaphore / stage count mismatch".into());
            }
            event_waits.extend_from_slice(submission.wait_semaphores);
            event_stages.extend_from_slice(submission.wait_stages);
            event_buffers.extend_from_slice(submission.command_buffers);
            event_signals.extend_from_slice(submission.signal_semaphores);
        }

        for &buffer in &event_buffers {
            *state.pending_buffers.entry(buffer).or_default() += 1;
            state.execute_copies(buffer);
        }

        state.events.push(Event::Submit {
            queue,
            wait_semaphores: event_waits,
            wait_stages: event_stages,
            command_buffers: event_buffers.clone(),
            signal_semaphores: event_signals,
            fence,
        });
        state.queue.push_back(PendingSubmit {
            fence,
            command_buffers: event_buffers,
        });

        if state.gpu_mode == GpuMode::Immediate {
            state.retire_all();
            self.retired.notify_all();
        }
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        self.recording(
            buffer,
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                extent: (render_area.extent.width, render_area.extent.height),
                clear_values: clear_values.len(),
            },
        );
    }

    fn cmd_end_render_pass(&self, buffer: vk::CommandBuffer) {
        self.recording(buffer, Command::EndRenderPass);
    }

    fn cmd_set_viewport(&self, buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        self.recording(
            buffer,
            Command::SetViewport {
                width: viewport.width,
                height: viewport.height,
            },
        );
    }

    fn cmd_set_scissor(&self, buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.recording(
            buffer,
            Command::SetScissor {
                width: scissor.extent.width,
                height: scissor.extent.height,
            },
        );
    }

    fn cmd_bind_pipeline(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.recording(buffer, Command::BindPipeline(bind_point, pipeline));
    }

    fn cmd_bind_vertex_buffer(
        &self,
        buffer: vk::CommandBuffer,
        binding: u32,
        vertex_buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        self.recording(buffer, Command::BindVertexBuffer(binding, vertex_buffer, offset));
    }

    fn cmd_bind_index_buffer(
        &self,
        buffer: vk::CommandBuffer,
        index_buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.recording(buffer, Command::BindIndexBuffer(index_buffer, offset, index_type));
    }

    fn cmd_bind_descriptor_set(
        &self,
        buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.recording(buffer, Command::BindDescriptorSet(bind_point, layout, set));
    }

    fn cmd_draw(&self, buffer: vk::CommandBuffer, vertex_count: u32, instance_count: u32) {
        self.recording(buffer, Command::Draw(vertex_count, instance_count));
    }

    fn cmd_draw_indexed(&self, buffer: vk::CommandBuffer, index_count: u32, instance_count: u32) {
        self.recording(buffer, Command::DrawIndexed(index_count, instance_count));
    }

    fn cmd_dispatch(&self, buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.recording(buffer, Command::Dispatch(x, y, z));
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
        self.recording(
            buffer,
            Command::PipelineBarrier {
                src_stage,
                dst_stage,
                memory: memory.len(),
                buffers: buffers.len(),
                images: images
                    .iter()
                    .map(|b| (b.image, b.old_layout, b.new_layout))
                    .collect(),
            },
        );
    }

    fn cmd_copy_buffer(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.recording(
            buffer,
            Command::CopyBuffer {
                src,
                dst,
                regions: regions
                    .iter()
                    .map(|r| (r.src_offset, r.dst_offset, r.size))
                    .collect(),
            },
        );
    }

    fn cmd_copy_buffer_to_image(
        &self,
        buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.recording(buffer, Command::CopyBufferToImage { src, dst, layout });
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
    ) -> VkResult<vk::Buffer> {
        self.with_state(|s| {
            let buffer = vk::Buffer::from_raw(s.next_raw());
            s.buffers.insert(buffer, FakeBuffer { size, memory: None });
            Ok(buffer)
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.with_state(|s| {
            s.buffers.remove(&buffer);
        });
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let all_types = (1u32 << state.memory_properties.memory_type_count) - 1;
        vk::MemoryRequirements {
            size: state.buffers.get(&buffer).map_or(0, |b| b.size),
            alignment: 16,
            memory_type_bits: state.buffer_type_bits.unwrap_or(all_types),
        }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo) -> VkResult<vk::Image> {
        self.with_state(|s| {
            let image = vk::Image::from_raw(s.next_raw());
            let size = info.extent.width as u64 * info.extent.height as u64 * 4;
            s.images.insert(image, size);
            Ok(image)
        })
    }

    fn destroy_image(&self, image: vk::Image) {
        self.with_state(|s| {
            s.images.remove(&image);
        });
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        vk::MemoryRequirements {
            size: state.images.get(&image).copied().unwrap_or(0),
            alignment: 256,
            memory_type_bits: (1u32 << state.memory_properties.memory_type_count) - 1,
        }
    }

    fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        _memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        self.with_state(|s| {
            let memory = vk::DeviceMemory::from_raw(s.next_raw());
            s.memories.insert(memory, vec![0; size as usize]);
            Ok(memory)
        })
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.with_state(|s| {
            if s.mapped.contains(&memory) {
                s.violations.push(format!("freed mapped memory {memory:?}"));
            }
            s.memories.remove(&memory);
        });
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> VkResult<()> {
        self.with_state(|s| match s.buffers.get_mut(&buffer) {
            Some(b) => {
                b.memory = Some(memory);
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        })
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory) -> VkResult<()> {
        Ok(())
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8> {
        self.with_state(|s| {
            if !s.mapped.insert(memory) {
                s.violations.push(format!("mapped memory twice {memory:?}"));
            }
            let bytes = s
                .memories
                .get_mut(&memory)
                .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
            let end = if size == vk::WHOLE_SIZE {
                bytes.len() as u64
            } else {
                offset + size
            };
            if end > bytes.len() as u64 {
                return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
            }
            Ok(bytes[offset as usize..].as_mut_ptr())
        })
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.with_state(|s| {
            s.mapped.remove(&memory);
        });
    }

    fn flush_memory(&self, _memory: vk::DeviceMemory) -> VkResult<()> {
        Ok(())
    }

    fn invalidate_memory(&self, _memory: vk::DeviceMemory) -> VkResult<()> {
        Ok(())
    }

    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        Ok(vk::ImageView::from_raw(
            self.with_state(|s| s.create_object("image view")),
        ))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.with_state(|s| s.destroy_object("image view", view.as_raw()));
    }

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo) -> VkResult<vk::Sampler> {
        Ok(vk::Sampler::from_raw(
            self.with_state(|s| s.create_object("sampler")),
        ))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.with_state(|s| s.destroy_object("sampler", sampler.as_raw()));
    }

    fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        Ok(vk::RenderPass::from_raw(
            self.with_state(|s| s.create_object("render pass")),
        ))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.with_state(|s| s.destroy_object("render pass", render_pass.as_raw()));
    }

    fn create_framebuffer(&self, _info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        Ok(vk::Framebuffer::from_raw(
            self.with_state(|s| s.create_object("framebuffer")),
        ))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.with_state(|s| s.destroy_object("framebuffer", framebuffer.as_raw()));
    }

    fn create_shader_module(&self, _code: &[u32]) -> VkResult<vk::ShaderModule> {
        Ok(vk::ShaderModule::from_raw(
            self.with_state(|s| s.create_object("shader module")),
        ))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.with_state(|s| s.destroy_object("shader module", module.as_raw()));
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        Ok(vk::DescriptorSetLayout::from_raw(
            self.with_state(|s| s.create_object("descriptor set layout")),
        ))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.with_state(|s| s.destroy_object("descriptor set layout", layout.as_raw()));
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        Ok(vk::DescriptorPool::from_raw(
            self.with_state(|s| s.create_object("descriptor pool")),
        ))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.with_state(|s| s.destroy_object("descriptor pool", pool.as_raw()));
    }

    fn allocate_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        self.with_state(|s| {
            Ok(layouts
                .iter()
                .map(|_| vk::DescriptorSet::from_raw(s.next_raw()))
                .collect())
        })
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet]) {
        self.with_state(|s| {
            s.descriptor_writes.extend(
                writes
                    .iter()
                    .map(|w| (w.dst_set, w.dst_binding, w.descriptor_type)),
            )
        });
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        Ok(vk::PipelineLayout::from_raw(
            self.with_state(|s| s.create_object("pipeline layout")),
        ))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.with_state(|s| s.destroy_object("pipeline layout", layout.as_raw()));
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline> {
        self.with_state(|s| {
            s.events.push(Event::CreateGraphicsPipeline {
                render_pass: info.render_pass,
                subpass: info.subpass,
            });
            Ok(vk::Pipeline::from_raw(s.create_object("pipeline")))
        })
    }

    fn create_compute_pipeline(
        &self,
        _info: &vk::ComputePipelineCreateInfo,
    ) -> VkResult<vk::Pipeline> {
        Ok(vk::Pipeline::from_raw(
            self.with_state(|s| s.create_object("pipeline")),
        ))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.with_state(|s| s.destroy_object("pipeline", pipeline.as_raw()));
    }
}
