// Compute passes
//
// A compute program with one pre-recorded dispatch. The pass is submitted ahead
// of the frame from a `FrameHooks::before_submit` and hands its completion
// semaphore to the frame, so the render target waits for it on the GPU. Its own
// fence keeps the command buffer from being resubmitted while still pending.

use ash::vk;
use std::sync::Arc;

use super::device::DeviceContext;
use super::driver::Submission;
use super::shader::ShaderProgram;
use super::sync::{Fence, Semaphore};
use crate::error::{vk_check, RenderError, Result};

/// Workgroups needed to cover `global` invocations with groups of `group`.
pub fn group_count(global: u32, group: u32) -> u32 {
    global.div_ceil(group.max(1)).max(1)
}

pub struct ComputePass {
    ctx: Arc<DeviceContext>,
    program: Arc<ShaderProgram>,
    pipeline: vk::Pipeline,
    command_buffer: vk::CommandBuffer,
    complete: Semaphore,
    fence: Fence,
    recorded: bool,
}

impl ComputePass {
    pub fn new(ctx: &Arc<DeviceContext>, program: Arc<ShaderProgram>) -> Result<Self> {
        let stage = program
            .stage_infos()
            .into_iter()
            .next()
            .filter(|_| program.has_stage(vk::ShaderStageFlags::COMPUTE))
            .ok_or_else(|| {
                RenderError::Initialization("compute pass needs a compute shader stage".into())
            })?;

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(program.pipeline_layout());
        let pipeline = vk_check(
            ctx.driver().create_compute_pipeline(&pipeline_info),
            "vkCreateComputePipelines",
        )?;

        let parts = ctx.allocate_command_buffer().and_then(|command_buffer| {
            let sync = Semaphore::new(ctx).and_then(|complete| Ok((complete, Fence::new(ctx, true)?)));
            match sync {
                Ok((complete, fence)) => Ok((command_buffer, complete, fence)),
                Err(e) => {
                    ctx.free_command_buffer(command_buffer);
                    Err(e)
                }
            }
        });
        let (command_buffer, complete, fence) = match parts {
            Ok(parts) => parts,
            Err(e) => {
                ctx.driver().destroy_pipeline(pipeline);
                return Err(e);
            }
        };

        log::debug!("Created compute pass");

        Ok(Self {
            ctx: Arc::clone(ctx),
            program,
            pipeline,
            command_buffer,
            complete,
            fence,
            recorded: false,
        })
    }

    /// Record one dispatch covering `global` invocations with `group`-sized
    /// workgroups, using descriptor set `set_index` of the program.
    pub fn record(&mut self, global: [u32; 3], group: [u32; 3], set_index: usize) -> Result<()> {
        let set = if self.program.descriptor_set_count() > 0 {
            Some(self.program.try_descriptor_set(set_index).ok_or(
                RenderError::InvalidState {
                    what: "recording with a descriptor set past the program's last one",
                    state: "idle",
                },
            )?)
        } else {
            None
        };

        self.fence.wait("compute pass fence", self.ctx.fence_timeout())?;

        let driver = self.ctx.driver();
        let cb = self.command_buffer;
        vk_check(
            driver.begin_command_buffer(cb, vk::CommandBufferUsageFlags::SIMULTANEOUS_USE),
            "vkBeginCommandBuffer",
        )?;
        driver.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, self.pipeline);
        if let Some(set) = set {
            driver.cmd_bind_descriptor_set(
                cb,
                vk::PipelineBindPoint::COMPUTE,
                self.program.pipeline_layout(),
                set,
            );
        }
        driver.cmd_dispatch(
            cb,
            group_count(global[0], group[0]),
            group_count(global[1], group[1]),
            group_count(global[2], group[2]),
        );
        vk_check(driver.end_command_buffer(cb), "vkEndCommandBuffer")?;

        self.recorded = true;
        Ok(())
    }

    /// Submit the recorded dispatch on the graphics queue after `waits`, and
    /// push the completion semaphore to `signal_out`.
    pub fn submit(
        &mut self,
        waits: &[vk::Semaphore],
        signal_out: &mut Vec<vk::Semaphore>,
    ) -> Result<()> {
        if !self.recorded {
            return Err(RenderError::InvalidState {
                what: "compute submit",
                state: "idle",
            });
        }

        self.fence.wait("compute pass fence", self.ctx.fence_timeout())?;
        self.fence.reset()?;

        let stages = vec![vk::PipelineStageFlags::COMPUTE_SHADER; waits.len()];
        let command_buffers = [self.command_buffer];
        let signals = [self.complete.handle()];
        self.ctx.submit_graphics(
            &[Submission {
                wait_semaphores: waits,
                wait_stages: &stages,
                command_buffers: &command_buffers,
                signal_semaphores: &signals,
            }],
            self.fence.handle(),
        )?;

        log::trace!("Compute pass submitted ({} wait(s))", waits.len());
        signal_out.push(self.complete.handle());
        Ok(())
    }

    pub fn program(&self) -> &Arc<ShaderProgram> {
        &self.program
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn complete_semaphore(&self) -> vk::Semaphore {
        self.complete.handle()
    }

    pub fn is_complete(&self) -> Result<bool> {
        self.fence.is_signaled()
    }
}

impl Drop for ComputePass {
    fn drop(&mut self) {
        if let Err(e) = self.fence.wait("compute pass fence", self.ctx.fence_timeout()) {
            log::error!("Compute pass still pending at drop, leaking its command buffer: {}", e);
            return;
        }
        self.ctx.free_command_buffer(self.command_buffer);
        self.ctx.driver().destroy_pipeline(self.pipeline);
    }
}
