// Render targets
//
// A render target is a framebuffer plus the one command buffer that draws into
// it, the semaphore that command buffer signals, and a fence for its last
// submission. Recording follows a small state machine:
//
//   Idle -> Recording -> Recorded -> Submitted -> (GPU done) -> ...
//
// A recorded target can be submitted again and again (SIMULTANEOUS_USE), and
// re-recorded at any time outside `Recording`. Both `bind` and `submit_render`
// first wait on the target fence, so a command buffer that is still pending is
// never re-recorded or resubmitted.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::barrier::Barrier;
use super::buffer::Buffer;
use super::device::DeviceContext;
use super::driver::Submission;
use super::image::{Image, ImageDesc, DEPTH_FORMAT};
use super::pipeline::GraphicsPipeline;
use super::render_pass::RenderPass;
use super::sync::{Fence, Semaphore};
use crate::error::{vk_check, RenderError, Result};

/// Stage a wait semaphore blocks when the caller gives none.
pub fn default_wait_stage() -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::FRAGMENT_SHADER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Idle,
    Recording,
    Recorded,
    Submitted,
}

impl TargetState {
    pub fn name(self) -> &'static str {
        match self {
            TargetState::Idle => "idle",
            TargetState::Recording => "recording",
            TargetState::Recorded => "recorded",
            TargetState::Submitted => "submitted",
        }
    }
}

pub struct RenderTarget {
    ctx: Arc<DeviceContext>,
    render_pass: Arc<RenderPass>,
    color: Arc<Image>,
    depth: Option<Arc<Image>>,
    framebuffer: vk::Framebuffer,
    command_buffer: vk::CommandBuffer,
    render_complete: Semaphore,
    fence: Fence,
    extent: vk::Extent2D,
    clear_color: [f32; 4],
    clear_depth: f32,
    pipeline: Option<Arc<GraphicsPipeline>>,
    state: TargetState,
}

impl RenderTarget {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        render_pass: &Arc<RenderPass>,
        color: Arc<Image>,
        depth: Option<Arc<Image>>,
    ) -> Result<Self> {
        if render_pass.has_depth() != depth.is_some() {
            return Err(RenderError::Initialization(format!(
                "render pass expects {} attachment(s), got {}",
                render_pass.attachment_count(),
                1 + depth.is_some() as usize
            )));
        }

        let driver = ctx.driver();
        let extent = color.extent();

        let mut views = vec![color.view()];
        if let Some(depth) = &depth {
            views.push(depth.view());
        }
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle())
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = vk_check(
            driver.create_framebuffer(&framebuffer_info),
            "vkCreateFramebuffer",
        )?;

        let command_buffer = match ctx.allocate_command_buffer() {
            Ok(cb) => cb,
            Err(e) => {
                driver.destroy_framebuffer(framebuffer);
                return Err(e);
            }
        };

        let sync = Semaphore::new(ctx).and_then(|sem| Ok((sem, Fence::new(ctx, true)?)));
        let (render_complete, fence) = match sync {
            Ok(sync) => sync,
            Err(e) => {
                ctx.free_command_buffer(command_buffer);
                driver.destroy_framebuffer(framebuffer);
                return Err(e);
            }
        };

        log::debug!(
            "Created render target {}x{} ({} attachment(s))",
            extent.width,
            extent.height,
            views.len()
        );

        Ok(Self {
            ctx: Arc::clone(ctx),
            render_pass: Arc::clone(render_pass),
            color,
            depth,
            framebuffer,
            command_buffer,
            render_complete,
            fence,
            extent,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
            pipeline: None,
            state: TargetState::Idle,
        })
    }

    /// Target for one presentable image. `image` must come from the swapchain
    /// and outlive nothing but this target; the optional depth image is shared.
    pub fn for_swapchain_image(
        ctx: &Arc<DeviceContext>,
        render_pass: &Arc<RenderPass>,
        image: Arc<Image>,
        depth: Option<Arc<Image>>,
    ) -> Result<Self> {
        Self::new(ctx, render_pass, image, depth)
    }

    /// Off-screen target with its own sampled color image (and depth image if
    /// the render pass has one). The render pass should leave color in
    /// SHADER_READ_ONLY_OPTIMAL, which is where the image is kept.
    pub fn offscreen(
        ctx: &Arc<DeviceContext>,
        render_pass: &Arc<RenderPass>,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let color = Image::new(
            ctx,
            &ImageDesc::color(
                extent,
                render_pass.color_format(),
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        )?;
        let depth = match render_pass.depth_format() {
            Some(format) => Some(Arc::new(Image::depth(ctx, extent, format)?)),
            None => None,
        };
        Self::new(ctx, render_pass, Arc::new(color), depth)
    }

    fn expect_recording(&self, what: &'static str) -> Result<()> {
        if self.state != TargetState::Recording {
            return Err(RenderError::InvalidState {
                what,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }

    pub fn set_clear_depth(&mut self, depth: f32) {
        self.clear_depth = depth;
    }

    fn clear_values(&self) -> Vec<vk::ClearValue> {
        let mut clears = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        if self.depth.is_some() {
            clears.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.clear_depth,
                    stencil: 0,
                },
            });
        }
        clears
    }

    /// Start recording: optional barrier, then the render pass with viewport
    /// and scissor covering the whole target.
    pub fn bind(&mut self, barrier: Option<&Barrier>) -> Result<()> {
        if self.state == TargetState::Recording {
            return Err(RenderError::InvalidState {
                what: "bind",
                state: self.state.name(),
            });
        }

        self.fence
            .wait("render target fence", self.ctx.fence_timeout())?;

        let driver = self.ctx.driver();
        let cb = self.command_buffer;
        vk_check(
            driver.begin_command_buffer(cb, vk::CommandBufferUsageFlags::SIMULTANEOUS_USE),
            "vkBeginCommandBuffer",
        )?;
        self.state = TargetState::Recording;
        self.pipeline = None;

        if let Some(barrier) = barrier {
            barrier.record(driver, cb);
        }

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        };
        driver.cmd_begin_render_pass(
            cb,
            self.render_pass.handle(),
            self.framebuffer,
            render_area,
            &self.clear_values(),
        );
        driver.cmd_set_viewport(
            cb,
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: self.extent.width as f32,
                height: self.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        driver.cmd_set_scissor(cb, render_area);
        Ok(())
    }

    /// Bind `pipeline`, building it against this target's render pass if needed.
    pub fn use_graphics_pipeline(&mut self, pipeline: &Arc<GraphicsPipeline>) -> Result<()> {
        self.expect_recording("use_graphics_pipeline")?;
        let handle = pipeline.pipeline_for(&self.render_pass)?;
        self.ctx
            .driver()
            .cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::GRAPHICS, handle);
        self.pipeline = Some(Arc::clone(pipeline));
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        self.expect_recording("bind_vertex_buffer")?;
        self.ctx
            .driver()
            .cmd_bind_vertex_buffer(self.command_buffer, 0, buffer.handle(), 0);
        Ok(())
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, index_type: vk::IndexType) -> Result<()> {
        self.expect_recording("bind_index_buffer")?;
        self.ctx
            .driver()
            .cmd_bind_index_buffer(self.command_buffer, buffer.handle(), 0, index_type);
        Ok(())
    }

    /// Bind descriptor set `index` of the current pipeline's shader program.
    pub fn bind_uniform_set(&mut self, index: usize) -> Result<()> {
        self.expect_recording("bind_uniform_set")?;
        let program = self
            .pipeline
            .as_ref()
            .and_then(|p| p.shader())
            .ok_or(RenderError::InvalidState {
                what: "bind_uniform_set without a pipeline",
                state: self.state.name(),
            })?;
        let set = program
            .try_descriptor_set(index)
            .ok_or(RenderError::InvalidState {
                what: "binding a descriptor set past the program's last one",
                state: self.state.name(),
            })?;
        self.ctx.driver().cmd_bind_descriptor_set(
            self.command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            program.pipeline_layout(),
            set,
        );
        Ok(())
    }

    pub fn draw(&mut self, vertex_count: u32) -> Result<()> {
        self.expect_recording("draw")?;
        self.ctx.driver().cmd_draw(self.command_buffer, vertex_count, 1);
        Ok(())
    }

    pub fn draw_indexed(&mut self, index_count: u32) -> Result<()> {
        self.expect_recording("draw_indexed")?;
        self.ctx
            .driver()
            .cmd_draw_indexed(self.command_buffer, index_count, 1);
        Ok(())
    }

    /// Close the render pass and the command buffer.
    pub fn un_bind(&mut self) -> Result<()> {
        self.expect_recording("un_bind")?;
        let driver = self.ctx.driver();
        driver.cmd_end_render_pass(self.command_buffer);
        vk_check(
            driver.end_command_buffer(self.command_buffer),
            "vkEndCommandBuffer",
        )?;
        self.state = TargetState::Recorded;
        Ok(())
    }

    /// Submit the recorded commands after `wait_semaphores`. Wait `i` blocks
    /// `wait_stages[i]`, or [`default_wait_stage`] when not given. The
    /// render-complete semaphore is pushed to `signal_out`.
    ///
    /// Blocks on the previous submission of this target first; if that exceeds
    /// the fence timeout nothing is submitted.
    pub fn submit_render(
        &mut self,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_out: &mut Vec<vk::Semaphore>,
    ) -> Result<()> {
        if matches!(self.state, TargetState::Idle | TargetState::Recording) {
            return Err(RenderError::InvalidState {
                what: "submit_render",
                state: self.state.name(),
            });
        }

        self.fence
            .wait("render target fence", self.ctx.fence_timeout())?;
        self.fence.reset()?;

        let stages: Vec<_> = (0..wait_semaphores.len())
            .map(|i| wait_stages.get(i).copied().unwrap_or_else(default_wait_stage))
            .collect();
        let command_buffers = [self.command_buffer];
        let signals = [self.render_complete.handle()];
        self.ctx.submit_graphics(
            &[Submission {
                wait_semaphores,
                wait_stages: &stages,
                command_buffers: &command_buffers,
                signal_semaphores: &signals,
            }],
            self.fence.handle(),
        )?;

        signal_out.push(self.render_complete.handle());
        self.state = TargetState::Submitted;
        Ok(())
    }

    /// Block until the last submission finished.
    pub fn wait_complete(&self, timeout: Duration) -> Result<()> {
        self.fence.wait("render target fence", timeout)
    }

    pub fn is_complete(&self) -> Result<bool> {
        self.fence.is_signaled()
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn render_pass(&self) -> &Arc<RenderPass> {
        &self.render_pass
    }

    pub fn color(&self) -> &Arc<Image> {
        &self.color
    }

    pub fn depth(&self) -> Option<&Arc<Image>> {
        self.depth.as_ref()
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn render_complete(&self) -> vk::Semaphore {
        self.render_complete.handle()
    }

    pub fn fence(&self) -> vk::Fence {
        self.fence.handle()
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        if let Err(e) = self.wait_complete(self.ctx.fence_timeout()) {
            log::error!("Render target still in flight at drop, leaking its command buffer: {}", e);
        } else {
            self.ctx.free_command_buffer(self.command_buffer);
        }
        self.ctx.driver().destroy_framebuffer(self.framebuffer);
    }
}

/// Color + depth pass whose color result stays sampled between uses.
pub fn offscreen_pass(ctx: &Arc<DeviceContext>, format: vk::Format) -> Result<Arc<RenderPass>> {
    RenderPass::color_depth(ctx, format, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, DEPTH_FORMAT)
}
