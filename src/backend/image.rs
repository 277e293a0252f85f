// GPU images - textures, attachments, depth buffers, swapchain wrappers
//
// An `Image` owns its view (and sampler, if any). Images created here also own
// their memory; swapchain images are only wrapped and never destroyed here.
//
// `layout` is the steady-state layout the image is kept in between uses. It is
// what descriptors and barriers assume; callers that move the image elsewhere
// are expected to move it back.

use ash::vk;
use std::sync::Arc;

use super::barrier::Barrier;
use super::buffer::{allocate_memory, Buffer};
use super::device::DeviceContext;
use crate::error::{vk_check, RenderError, Result};

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Access masks and stages for one layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Access masks / stages inferred from the layouts alone.
pub fn layout_transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> TransitionMasks {
    use ash::vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};

    let (src_stage, src_access) = match old_layout {
        L::UNDEFINED => (S::TOP_OF_PIPE, A::empty()),
        L::TRANSFER_DST_OPTIMAL => (S::TRANSFER, A::TRANSFER_WRITE),
        L::TRANSFER_SRC_OPTIMAL => (S::TRANSFER, A::TRANSFER_READ),
        L::COLOR_ATTACHMENT_OPTIMAL => (S::COLOR_ATTACHMENT_OUTPUT, A::COLOR_ATTACHMENT_WRITE),
        L::SHADER_READ_ONLY_OPTIMAL => (S::FRAGMENT_SHADER, A::SHADER_READ),
        _ => (S::ALL_COMMANDS, A::empty()),
    };

    let (dst_stage, dst_access) = match new_layout {
        L::TRANSFER_DST_OPTIMAL => (S::TRANSFER, A::TRANSFER_WRITE),
        L::TRANSFER_SRC_OPTIMAL => (S::TRANSFER, A::TRANSFER_READ),
        L::COLOR_ATTACHMENT_OPTIMAL => (
            S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
            A::COLOR_ATTACHMENT_READ,
        ),
        L::SHADER_READ_ONLY_OPTIMAL => (S::FRAGMENT_SHADER, A::SHADER_READ),
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            S::EARLY_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        _ => (S::ALL_COMMANDS, A::empty()),
    };

    TransitionMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    }
}

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    /// Layout the image is transitioned to right after creation.
    pub layout: vk::ImageLayout,
    pub memory_properties: vk::MemoryPropertyFlags,
    /// Create a linear clamp-to-edge sampler alongside the view.
    pub sampled: bool,
}

impl ImageDesc {
    pub fn color(
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        layout: vk::ImageLayout,
    ) -> Self {
        Self {
            extent,
            format,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
            layout,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            sampled: usage.contains(vk::ImageUsageFlags::SAMPLED),
        }
    }

    pub fn depth(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            memory_properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            sampled: false,
        }
    }
}

pub struct Image {
    ctx: Arc<DeviceContext>,
    handle: vk::Image,
    /// `None` for images owned by the presentation engine.
    memory: Option<vk::DeviceMemory>,
    view: vk::ImageView,
    sampler: Option<vk::Sampler>,
    format: vk::Format,
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
}

impl Image {
    pub fn new(ctx: &Arc<DeviceContext>, desc: &ImageDesc) -> Result<Self> {
        let driver = ctx.driver();

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = vk_check(driver.create_image(&image_info), "vkCreateImage")?;

        let requirements = driver.image_memory_requirements(handle);
        let (memory, _) = match allocate_memory(ctx, requirements, desc.memory_properties) {
            Ok(allocation) => allocation,
            Err(e) => {
                driver.destroy_image(handle);
                return Err(e);
            }
        };
        if let Err(e) = vk_check(driver.bind_image_memory(handle, memory), "vkBindImageMemory") {
            driver.free_memory(memory);
            driver.destroy_image(handle);
            return Err(e);
        }

        // From here on `Drop` cleans up whatever was created.
        let mut image = Self {
            ctx: Arc::clone(ctx),
            handle,
            memory: Some(memory),
            view: vk::ImageView::null(),
            sampler: None,
            format: desc.format,
            extent: desc.extent,
            aspect: desc.aspect,
            layout: vk::ImageLayout::UNDEFINED,
        };

        image.view = image.create_view()?;
        if desc.sampled {
            image.sampler = Some(image.create_sampler()?);
        }

        if desc.layout != vk::ImageLayout::UNDEFINED {
            image.transition(vk::ImageLayout::UNDEFINED, desc.layout)?;
        }
        image.layout = desc.layout;

        log::debug!(
            "Created image {}x{} {:?} in {:?}",
            desc.extent.width,
            desc.extent.height,
            desc.format,
            desc.layout
        );

        Ok(image)
    }

    /// Depth attachment, ready for use as DEPTH_STENCIL_ATTACHMENT_OPTIMAL.
    pub fn depth(ctx: &Arc<DeviceContext>, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        Self::new(ctx, &ImageDesc::depth(extent, format))
    }

    /// Upload tightly packed RGBA8 pixels into a new device-local image.
    pub fn from_pixels(
        ctx: &Arc<DeviceContext>,
        width: u32,
        height: u32,
        rgba: &[u8],
        usage: vk::ImageUsageFlags,
        final_layout: vk::ImageLayout,
    ) -> Result<Self> {
        let extent = vk::Extent2D { width, height };
        check_pixel_len(extent, rgba)?;

        let mut image = Self::new(
            ctx,
            &ImageDesc::color(
                extent,
                vk::Format::R8G8B8A8_UNORM,
                usage | vk::ImageUsageFlags::TRANSFER_DST,
                vk::ImageLayout::UNDEFINED,
            ),
        )?;

        image.upload(
            rgba,
            vk::Offset2D { x: 0, y: 0 },
            extent,
            vk::ImageLayout::UNDEFINED,
            final_layout,
        )?;
        image.layout = final_layout;
        Ok(image)
    }

    /// Re-upload a region; the image returns to its steady-state layout.
    pub fn update_pixels(
        &self,
        rgba: &[u8],
        offset: vk::Offset2D,
        extent: vk::Extent2D,
    ) -> Result<()> {
        check_pixel_len(extent, rgba)?;
        self.upload(rgba, offset, extent, self.layout, self.layout)
    }

    fn upload(
        &self,
        rgba: &[u8],
        offset: vk::Offset2D,
        extent: vk::Extent2D,
        from_layout: vk::ImageLayout,
        to_layout: vk::ImageLayout,
    ) -> Result<()> {
        let staging = Buffer::with_data(&self.ctx, vk::BufferUsageFlags::TRANSFER_SRC, rgba)?;

        let to_transfer = layout_transition_masks(from_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let to_final = layout_transition_masks(vk::ImageLayout::TRANSFER_DST_OPTIMAL, to_layout);

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: self.aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D {
                x: offset.x,
                y: offset.y,
                z: 0,
            },
            image_extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };

        self.ctx.run_one_shot(|driver, cb| {
            self.transition_barrier(from_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL, to_transfer)
                .record(driver, cb);
            driver.cmd_copy_buffer_to_image(
                cb,
                staging.handle(),
                self.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            self.transition_barrier(vk::ImageLayout::TRANSFER_DST_OPTIMAL, to_layout, to_final)
                .record(driver, cb);
        })
    }

    /// Wrap a presentation engine image. Only the view is owned.
    pub fn from_swapchain(
        ctx: &Arc<DeviceContext>,
        handle: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut image = Self {
            ctx: Arc::clone(ctx),
            handle,
            memory: None,
            view: vk::ImageView::null(),
            sampler: None,
            format,
            extent,
            aspect: vk::ImageAspectFlags::COLOR,
            layout: vk::ImageLayout::PRESENT_SRC_KHR,
        };
        image.view = image.create_view()?;
        Ok(image)
    }

    /// Transition with explicit masks, in its own blocking submission.
    pub fn transition_layout(
        &self,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        let masks = TransitionMasks {
            src_access,
            dst_access,
            src_stage,
            dst_stage,
        };
        let barrier = self.transition_barrier(old_layout, new_layout, masks);
        self.ctx.run_one_shot(|driver, cb| barrier.record(driver, cb))
    }

    /// Transition with masks inferred from the two layouts.
    pub fn transition(&self, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Result<()> {
        let masks = layout_transition_masks(old_layout, new_layout);
        self.transition_layout(
            old_layout,
            new_layout,
            masks.src_access,
            masks.dst_access,
            masks.src_stage,
            masks.dst_stage,
        )
    }

    fn transition_barrier(
        &self,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        masks: TransitionMasks,
    ) -> Barrier {
        Barrier::new(masks.src_stage, masks.dst_stage).add_raw_image_transition(
            self.handle,
            self.subresource_range(),
            old_layout,
            new_layout,
            masks.src_access,
            masks.dst_access,
        )
    }

    fn create_view(&self) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(self.subresource_range());

        vk_check(
            self.ctx.driver().create_image_view(&view_info),
            "vkCreateImageView",
        )
    }

    fn create_sampler(&self) -> Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .compare_op(vk::CompareOp::ALWAYS)
            .min_lod(0.0)
            .max_lod(0.0);

        vk_check(
            self.ctx.driver().create_sampler(&sampler_info),
            "vkCreateSampler",
        )
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.unwrap_or_default(),
            image_view: self.view,
            image_layout: self.layout,
        }
    }
}

fn check_pixel_len(extent: vk::Extent2D, rgba: &[u8]) -> Result<()> {
    let expected = extent.width as u64 * extent.height as u64 * 4;
    if rgba.len() as u64 != expected {
        return Err(RenderError::SizeMismatch {
            expected,
            actual: rgba.len() as u64,
        });
    }
    Ok(())
}

impl Drop for Image {
    fn drop(&mut self) {
        let driver = self.ctx.driver();
        if let Some(sampler) = self.sampler.take() {
            driver.destroy_sampler(sampler);
        }
        if self.view != vk::ImageView::null() {
            driver.destroy_image_view(self.view);
        }
        if let Some(memory) = self.memory.take() {
            driver.destroy_image(self.handle);
            driver.free_memory(memory);
        }
    }
}
