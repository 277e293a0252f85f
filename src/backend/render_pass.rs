// Render passes
//
// Two shapes cover everything the frame loop needs: a single color attachment,
// and color plus a depth attachment. Both clear on load, store color, and carry
// an external -> 0 -> external dependency pair so the first layout
// transition waits for the acquire and the last one is visible to presentation.

use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::device::DeviceContext;
use crate::error::{vk_check, Result};

static NEXT_RENDER_PASS_ID: AtomicU64 = AtomicU64::new(1);

pub struct RenderPass {
    ctx: Arc<DeviceContext>,
    handle: vk::RenderPass,
    /// Unique for the life of the process, unlike `handle`.
    id: u64,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
}

impl RenderPass {
    /// One color attachment that ends up in `final_layout`.
    pub fn simple_color(
        ctx: &Arc<DeviceContext>,
        format: vk::Format,
        final_layout: vk::ImageLayout,
    ) -> Result<Arc<Self>> {
        Self::build(ctx, format, final_layout, None)
    }

    /// Color attachment 0 plus a cleared, discarded depth attachment 1.
    pub fn color_depth(
        ctx: &Arc<DeviceContext>,
        color_format: vk::Format,
        color_final_layout: vk::ImageLayout,
        depth_format: vk::Format,
    ) -> Result<Arc<Self>> {
        Self::build(ctx, color_format, color_final_layout, Some(depth_format))
    }

    fn build(
        ctx: &Arc<DeviceContext>,
        color_format: vk::Format,
        color_final_layout: vk::ImageLayout,
        depth_format: Option<vk::Format>,
    ) -> Result<Arc<Self>> {
        let mut attachments = vec![vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(color_final_layout)
            .build()];

        if let Some(format) = depth_format {
            attachments.push(
                vk::AttachmentDescription::builder()
                    .format(format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
        }

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if depth_format.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let mut attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut attachment_access =
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if depth_format.is_some() {
            attachment_stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            attachment_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }

        // A depth attachment shared between frames in flight needs the previous
        // frame's depth writes ordered before this frame's.
        let previous_writes = if depth_format.is_some() {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        } else {
            vk::AccessFlags::empty()
        };

        let dependencies = [
            vk::SubpassDependency::builder()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(attachment_stages)
                .dst_stage_mask(attachment_stages)
                .src_access_mask(previous_writes)
                .dst_access_mask(attachment_access)
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build(),
            vk::SubpassDependency::builder()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(attachment_stages)
                .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
                .src_access_mask(attachment_access)
                .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build(),
        ];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = vk_check(
            ctx.driver().create_render_pass(&render_pass_info),
            "vkCreateRenderPass",
        )?;

        log::debug!(
            "Created render pass: color {:?} -> {:?}, depth {:?}",
            color_format,
            color_final_layout,
            depth_format
        );

        Ok(Arc::new(Self {
            ctx: Arc::clone(ctx),
            handle,
            id: NEXT_RENDER_PASS_ID.fetch_add(1, Ordering::Relaxed),
            color_format,
            depth_format,
        }))
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.depth_format
    }

    pub fn has_depth(&self) -> bool {
        self.depth_format.is_some()
    }

    /// Number of clear values `vkCmdBeginRenderPass` expects.
    pub fn attachment_count(&self) -> usize {
        if self.has_depth() {
            2
        } else {
            1
        }
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.ctx.driver().destroy_render_pass(self.handle);
    }
}
