// Platform surface provider
//
// The renderer never talks to the window system directly. A `SurfaceProvider`
// hands over the instance extensions it needs, creates the `VkSurfaceKHR`, and
// drives event polling for the frame loop.
//
// `WinitSurface` is the stock provider: a winit window driven through the
// pump-events API so the frame loop stays in control of the thread.

use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::c_char;
use std::time::Duration;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

use crate::error::{vk_check, RenderError, Result};

pub trait SurfaceProvider {
    /// Instance extensions the surface needs (e.g. `VK_KHR_surface` plus the
    /// platform flavour).
    fn required_instance_extensions(&self) -> Result<Vec<*const c_char>>;

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance)
        -> Result<vk::SurfaceKHR>;

    /// Current drawable size in pixels.
    fn framebuffer_size(&self) -> (u32, u32);

    fn poll_events(&mut self);

    fn should_close(&self) -> bool;
}

/// Window settings for [`WinitSurface::new`].
#[derive(Debug, Clone)]
pub struct WindowSettings {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

/// winit window + event loop, pumped by the frame loop.
pub struct WinitSurface {
    event_loop: EventLoop<()>,
    state: WindowState,
}

struct WindowState {
    attributes: WindowAttributes,
    window: Option<Window>,
    size: PhysicalSize<u32>,
    close_requested: bool,
    creation_error: Option<String>,
}

// Upper bound on pump iterations while waiting for the first `resumed`.
const MAX_STARTUP_PUMPS: usize = 100;

impl WinitSurface {
    pub fn new(settings: &WindowSettings) -> Result<Self> {
        let mut event_loop = EventLoop::new()
            .map_err(|e| RenderError::Initialization(format!("failed to open event loop: {e}")))?;

        let mut attributes = WindowAttributes::default()
            .with_title(settings.title.clone())
            .with_inner_size(PhysicalSize::new(settings.width, settings.height));
        if settings.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let mut state = WindowState {
            attributes,
            window: None,
            size: PhysicalSize::new(settings.width, settings.height),
            close_requested: false,
            creation_error: None,
        };

        // Windows are created from `resumed`, so pump until it has run.
        for _ in 0..MAX_STARTUP_PUMPS {
            if let PumpStatus::Exit(code) =
                event_loop.pump_app_events(Some(Duration::ZERO), &mut state)
            {
                return Err(RenderError::Initialization(format!(
                    "event loop exited during startup (code {code})"
                )));
            }
            if let Some(err) = state.creation_error.take() {
                return Err(RenderError::Initialization(err));
            }
            if state.window.is_some() {
                break;
            }
        }

        if state.window.is_none() {
            return Err(RenderError::Initialization(
                "window system never resumed the application".into(),
            ));
        }

        log::info!(
            "Window created: {}x{} ({})",
            state.size.width,
            state.size.height,
            if settings.fullscreen { "fullscreen" } else { "windowed" }
        );

        Ok(Self { event_loop, state })
    }

    pub fn window(&self) -> Option<&Window> {
        self.state.window.as_ref()
    }

    pub fn set_title(&self, title: &str) {
        if let Some(window) = &self.state.window {
            window.set_title(title);
        }
    }

    fn require_window(&self) -> Result<&Window> {
        self.state
            .window
            .as_ref()
            .ok_or_else(|| RenderError::Initialization("window has been closed".into()))
    }
}

impl SurfaceProvider for WinitSurface {
    fn required_instance_extensions(&self) -> Result<Vec<*const c_char>> {
        let window = self.require_window()?;
        let extensions = vk_check(
            ash_window::enumerate_required_extensions(window.raw_display_handle()),
            "vkEnumerateInstanceExtensionProperties",
        )?;
        Ok(extensions.to_vec())
    }

    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Result<vk::SurfaceKHR> {
        let window = self.require_window()?;
        vk_check(
            unsafe {
                ash_window::create_surface(
                    entry,
                    instance,
                    window.raw_display_handle(),
                    window.raw_window_handle(),
                    None,
                )
            },
            "vkCreateSurfaceKHR",
        )
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        (self.state.size.width, self.state.size.height)
    }

    fn poll_events(&mut self) {
        if let PumpStatus::Exit(_) = self
            .event_loop
            .pump_app_events(Some(Duration::ZERO), &mut self.state)
        {
            self.state.close_requested = true;
        }
    }

    fn should_close(&self) -> bool {
        self.state.close_requested
    }
}

impl ApplicationHandler for WindowState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => {
                self.size = window.inner_size();
                self.window = Some(window);
            }
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.creation_error = Some(format!("failed to create window: {e}"));
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.size = size;
            }
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.close_requested = true;
                }
            }
            _ => {}
        }
    }
}
