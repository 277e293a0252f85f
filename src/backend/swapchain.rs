// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Format, present mode, image count and extent are resolved against the
// surface once at creation; recreation on resize is left to the owner.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::device::DeviceContext;
use super::driver::SwapchainDesc;
use super::image::Image;
use super::sync::timeout_ns;
use crate::error::{vk_check, RenderError, Result};

/// Prefer 8-bit BGRA sRGB, then its UNORM twin, else whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    let find = |format: vk::Format| {
        formats.iter().copied().find(|f| {
            f.format == format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
    };
    find(vk::Format::B8G8R8A8_SRGB)
        .or_else(|| find(vk::Format::B8G8R8A8_UNORM))
        .or_else(|| formats.first().copied())
        .ok_or_else(|| RenderError::Initialization("surface reports no formats".into()))
}

/// `preferred` if the surface supports it, else MAILBOX > IMMEDIATE > FIFO.
/// FIFO is always supported.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    preferred
        .into_iter()
        .chain([vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE])
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// One more than the minimum, capped by the maximum (0 means no cap).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

/// The surface's current extent, or the framebuffer size clamped to the
/// supported range when the surface leaves it to us.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: framebuffer
            .0
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: framebuffer
            .1
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub struct Swapchain {
    // Views go before the swapchain that owns their images.
    images: Vec<Arc<Image>>,
    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    ctx: Arc<DeviceContext>,
}

impl Swapchain {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        framebuffer_size: (u32, u32),
        preferred_present_mode: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        let driver = ctx.driver();
        log::info!(
            "Creating swapchain: {}x{}",
            framebuffer_size.0,
            framebuffer_size.1
        );

        let caps = vk_check(
            driver.surface_capabilities(),
            "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
        )?;
        let formats = vk_check(
            driver.surface_formats(),
            "vkGetPhysicalDeviceSurfaceFormatsKHR",
        )?;
        let modes = vk_check(
            driver.surface_present_modes(),
            "vkGetPhysicalDeviceSurfacePresentModesKHR",
        )?;

        let format = choose_surface_format(&formats)?;
        let present_mode = choose_present_mode(&modes, preferred_present_mode);
        let extent = choose_extent(&caps, framebuffer_size);

        let families = ctx.families();
        let queue_families = if families.graphics != families.present {
            vec![families.graphics, families.present]
        } else {
            vec![families.graphics]
        };

        let desc = SwapchainDesc {
            min_image_count: choose_image_count(&caps),
            format,
            extent,
            present_mode,
            pre_transform: caps.current_transform,
            queue_families,
        };
        let handle = vk_check(driver.create_swapchain(&desc), "vkCreateSwapchainKHR")?;

        let mut swapchain = Self {
            images: Vec::new(),
            handle,
            format,
            present_mode,
            extent,
            ctx: Arc::clone(ctx),
        };

        let raw_images = vk_check(driver.swapchain_images(handle), "vkGetSwapchainImagesKHR")?;
        for image in raw_images {
            swapchain.images.push(Arc::new(Image::from_swapchain(
                ctx,
                image,
                format.format,
                extent,
            )?));
        }

        log::info!(
            "Created swapchain with {} images, {:?} / {:?}",
            swapchain.images.len(),
            format.format,
            present_mode
        );

        Ok(swapchain)
    }

    /// Acquire the next presentable image, signaling `semaphore` when it is
    /// free. Returns the image index chosen by the presentation engine.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore, timeout: Duration) -> Result<u32> {
        match self
            .ctx
            .driver()
            .acquire_next_image(self.handle, timeout_ns(timeout), semaphore)
        {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::warn!("Swapchain is suboptimal for the surface");
                }
                Ok(index)
            }
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(RenderError::Timeout {
                what: "swapchain image",
                timeout,
            }),
            Err(e) => vk_check(Err(e), "vkAcquireNextImageKHR"),
        }
    }

    /// Queue `image_index` for presentation after `wait_semaphores`.
    /// Returns `true` when the swapchain no longer matches the surface exactly.
    pub fn present(&self, image_index: u32, wait_semaphores: &[vk::Semaphore]) -> Result<bool> {
        self.ctx.present(self.handle, image_index, wait_semaphores)
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[Arc<Image>] {
        &self.images
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.format.color_space
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let shared = self
            .images
            .iter()
            .filter(|image| Arc::strong_count(image) > 1)
            .count();
        if shared > 0 {
            log::warn!("{} swapchain image view(s) outlive the swapchain", shared);
        }
        self.images.clear();
        self.ctx.driver().destroy_swapchain(self.handle);
    }
}
