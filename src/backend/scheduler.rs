// Frame scheduler - the frame loop
//
// Owns the swapchain, one render target per swapchain image, and a ring of
// frame-in-flight slots. Each frame:
//
//   1. wait on the current slot's fence (admission)
//   2. acquire an image; the index the presentation engine returns is what
//      selects the render target, not the ring position
//   3. if that image is still owned by another slot whose fence has not
//      signaled, wait on that fence as well, then take ownership
//   4. submit the image's render target behind the image-available semaphore
//      (plus whatever the pre-submit hook adds), then reset the slot fence and
//      have a fence-only submission signal it behind the target's work
//   5. present behind the render-complete semaphore
//   6. advance the ring and report the frame time
//
// Two fences are in play on purpose: the slot fence paces how far the CPU may
// run ahead, the render target fence paces reuse of its command buffer.

use ash::vk;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::device::DeviceContext;
use super::image::{Image, DEPTH_FORMAT};
use super::render_pass::RenderPass;
use super::render_target::RenderTarget;
use super::surface::SurfaceProvider;
use super::swapchain::Swapchain;
use super::sync::FrameSlot;
use crate::error::{RenderError, Result};

pub const DEFAULT_MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_frames_in_flight: usize,
    /// Give the swapchain render pass a shared depth attachment.
    pub depth_buffer: bool,
    pub clear_color: [f32; 4],
    /// Passed to swapchain creation by callers that build it from settings.
    pub present_mode: Option<vk::PresentModeKHR>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_frames_in_flight: DEFAULT_MAX_FRAMES_IN_FLIGHT,
            depth_buffer: false,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            present_mode: None,
        }
    }
}

/// Extra GPU work the frame has to wait for, added by
/// [`FrameHooks::before_submit`].
#[derive(Debug, Default, Clone)]
pub struct FrameDependencies {
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
}

impl FrameDependencies {
    /// Make the frame's render submission wait on `semaphore` at `stage`.
    pub fn wait_on(&mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stage);
    }

    /// Wait on every semaphore in `semaphores` at `stage`.
    pub fn wait_on_all(&mut self, semaphores: &[vk::Semaphore], stage: vk::PipelineStageFlags) {
        for &semaphore in semaphores {
            self.wait_on(semaphore, stage);
        }
    }

    pub fn wait_semaphores(&self) -> &[vk::Semaphore] {
        &self.wait_semaphores
    }

    pub fn wait_stages(&self) -> &[vk::PipelineStageFlags] {
        &self.wait_stages
    }

    pub fn is_empty(&self) -> bool {
        self.wait_semaphores.is_empty()
    }
}

/// Per-frame callbacks around the scheduler.
pub trait FrameHooks {
    /// Called after the image is acquired and before the render target is
    /// submitted. Auxiliary passes submit here and register their semaphores.
    fn before_submit(&mut self, _deps: &mut FrameDependencies) -> Result<()> {
        Ok(())
    }

    /// Called once per presented frame.
    fn frame_finished(&mut self, _elapsed: Duration) {}
}

pub struct NoHooks;

impl FrameHooks for NoHooks {}

type BeforeSubmitFn<'a> = Box<dyn FnMut(&mut FrameDependencies) -> Result<()> + 'a>;
type FrameFinishedFn<'a> = Box<dyn FnMut(Duration) + 'a>;

/// [`FrameHooks`] assembled from closures.
#[derive(Default)]
pub struct FnHooks<'a> {
    before_submit: Option<BeforeSubmitFn<'a>>,
    frame_finished: Option<FrameFinishedFn<'a>>,
}

impl<'a> FnHooks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_submit(
        mut self,
        f: impl FnMut(&mut FrameDependencies) -> Result<()> + 'a,
    ) -> Self {
        self.before_submit = Some(Box::new(f));
        self
    }

    pub fn frame_finished(mut self, f: impl FnMut(Duration) + 'a) -> Self {
        self.frame_finished = Some(Box::new(f));
        self
    }
}

impl FrameHooks for FnHooks<'_> {
    fn before_submit(&mut self, deps: &mut FrameDependencies) -> Result<()> {
        match self.before_submit.as_mut() {
            Some(f) => f(deps),
            None => Ok(()),
        }
    }

    fn frame_finished(&mut self, elapsed: Duration) {
        if let Some(f) = self.frame_finished.as_mut() {
            f(elapsed);
        }
    }
}

/// What happened in one `draw_frame`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub image_index: u32,
    pub slot: usize,
    /// The image was still owned by another in-flight slot and had to be waited on.
    pub reconciled: bool,
    pub elapsed: Duration,
}

pub struct FrameScheduler {
    // Field order is drop order: targets release framebuffers and swapchain
    // views before the swapchain itself goes.
    targets: Vec<RenderTarget>,
    depth: Option<Arc<Image>>,
    render_pass: Arc<RenderPass>,
    swapchain: Swapchain,
    slots: Vec<FrameSlot>,
    /// Slot that last submitted work for each swapchain image.
    images_in_flight: Vec<Option<usize>>,
    current_slot: usize,
    frames_presented: u64,
    ctx: Arc<DeviceContext>,
}

impl FrameScheduler {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        swapchain: Swapchain,
        settings: &SchedulerSettings,
    ) -> Result<Self> {
        if settings.max_frames_in_flight == 0 {
            return Err(RenderError::Initialization(
                "max_frames_in_flight must be at least 1".into(),
            ));
        }

        let extent = swapchain.extent();
        let (render_pass, depth) = if settings.depth_buffer {
            let render_pass = RenderPass::color_depth(
                ctx,
                swapchain.format(),
                vk::ImageLayout::PRESENT_SRC_KHR,
                DEPTH_FORMAT,
            )?;
            let depth = Arc::new(Image::depth(ctx, extent, DEPTH_FORMAT)?);
            (render_pass, Some(depth))
        } else {
            let render_pass = RenderPass::simple_color(
                ctx,
                swapchain.format(),
                vk::ImageLayout::PRESENT_SRC_KHR,
            )?;
            (render_pass, None)
        };

        let mut targets = Vec::with_capacity(swapchain.image_count());
        for image in swapchain.images() {
            let mut target = RenderTarget::for_swapchain_image(
                ctx,
                &render_pass,
                Arc::clone(image),
                depth.clone(),
            )?;
            target.set_clear_color(settings.clear_color);
            // A clear pass, so every image is presentable before the caller
            // records anything.
            target.bind(None)?;
            target.un_bind()?;
            targets.push(target);
        }

        let slots = (0..settings.max_frames_in_flight)
            .map(|_| FrameSlot::new(ctx))
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Frame scheduler ready: {} images, {} frames in flight, {}x{}{}",
            targets.len(),
            slots.len(),
            extent.width,
            extent.height,
            if depth.is_some() { ", depth" } else { "" }
        );

        Ok(Self {
            images_in_flight: vec![None; targets.len()],
            targets,
            depth,
            render_pass,
            swapchain,
            slots,
            current_slot: 0,
            frames_presented: 0,
            ctx: Arc::clone(ctx),
        })
    }

    /// Render and present one frame.
    pub fn draw_frame<H: FrameHooks + ?Sized>(&mut self, hooks: &mut H) -> Result<FrameStats> {
        let start = Instant::now();
        let timeout = self.ctx.fence_timeout();
        let slot_index = self.current_slot;

        // 1. Admission: the slot's previous frame must be done.
        let slot = &self.slots[slot_index];
        slot.in_flight.wait("frame slot fence", timeout)?;

        // 2. Acquire.
        let image_index = self
            .swapchain
            .acquire_next_image(slot.image_available.handle(), timeout)?;
        let image = image_index as usize;
        if image >= self.targets.len() {
            return Err(RenderError::Initialization(format!(
                "presentation engine returned image {} of {}",
                image_index,
                self.targets.len()
            )));
        }

        // 3. Reconcile with whichever slot used this image last.
        let mut reconciled = false;
        if let Some(owner) = self.images_in_flight[image] {
            if owner != slot_index {
                let owner_fence = &self.slots[owner].in_flight;
                if !owner_fence.is_signaled()? {
                    log::trace!("Image {} still in flight on slot {}", image_index, owner);
                    owner_fence.wait("image in flight fence", timeout)?;
                    reconciled = true;
                }
            }
        }
        self.images_in_flight[image] = Some(slot_index);

        // 4. Submit.
        let mut deps = FrameDependencies::default();
        hooks.before_submit(&mut deps)?;
        deps.wait_on(
            slot.image_available.handle(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        );

        let mut render_complete = Vec::with_capacity(1);
        self.targets[image].submit_render(
            deps.wait_semaphores(),
            deps.wait_stages(),
            &mut render_complete,
        )?;

        slot.in_flight.reset()?;
        self.ctx.submit_graphics(&[], slot.in_flight.handle())?;

        // 5. Present.
        if self.swapchain.present(image_index, &render_complete)? {
            log::warn!("Presented to a suboptimal swapchain");
        }

        // 6. Advance.
        self.current_slot = (slot_index + 1) % self.slots.len();
        self.frames_presented += 1;

        let elapsed = start.elapsed();
        hooks.frame_finished(elapsed);
        log::trace!(
            "Frame {}: image {} slot {} in {:?}",
            self.frames_presented,
            image_index,
            slot_index,
            elapsed
        );

        Ok(FrameStats {
            image_index,
            slot: slot_index,
            reconciled,
            elapsed,
        })
    }

    /// Draw frames until the platform asks to close, then drain the GPU.
    pub fn run<P, H>(&mut self, platform: &mut P, hooks: &mut H) -> Result<()>
    where
        P: SurfaceProvider + ?Sized,
        H: FrameHooks + ?Sized,
    {
        log::info!("Entering frame loop");
        while !platform.should_close() {
            platform.poll_events();
            if platform.should_close() {
                break;
            }
            self.draw_frame(hooks)?;
        }
        log::info!("Frame loop done after {} frames", self.frames_presented);
        self.wait_idle()
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.ctx.wait_idle()
    }

    /// Ring position the next frame uses.
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn image_count(&self) -> usize {
        self.targets.len()
    }

    /// Render target of swapchain image `index`, for re-recording.
    pub fn render_target_mut(&mut self, index: usize) -> Option<&mut RenderTarget> {
        self.targets.get_mut(index)
    }

    pub fn render_targets_mut(&mut self) -> &mut [RenderTarget] {
        &mut self.targets
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn depth_image(&self) -> Option<&Arc<Image>> {
        self.depth.as_ref()
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        log::info!("Destroying frame scheduler...");
        if let Err(e) = self.ctx.wait_idle() {
            log::warn!("vkDeviceWaitIdle failed during teardown: {}", e);
        }
    }
}
