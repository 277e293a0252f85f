// =============================================================================
// vks-frame demo - clear the window through the frame scheduler
// =============================================================================
//
// FRAME FLOW (per iteration):
// 1. Pump window events
// 2. Wait for the frame slot, acquire a swapchain image
// 3. Submit the image's pre-recorded clear pass
// 4. Present, advance the slot ring
// 5. Fold the frame time into the FPS counter
//
// =============================================================================

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use vks_frame::backend::{
    DeviceContext, DeviceSettings, FrameHooks, FrameScheduler, SchedulerSettings, SurfaceProvider,
    Swapchain, WindowSettings, WinitSurface,
};
use vks_frame::config::Config;

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting vks-frame demo");
    log::info!(
        "Window: {}x{} ({}), present mode: {}",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" },
        config.graphics.present_mode
    );

    let mut surface =
        WinitSurface::new(&WindowSettings::from(&config)).context("Failed to open window")?;
    let ctx = DeviceContext::create(&DeviceSettings::from(&config), &surface)
        .context("Failed to open Vulkan device")?;

    let settings = SchedulerSettings::from(&config);
    let swapchain = Swapchain::new(&ctx, surface.framebuffer_size(), settings.present_mode)
        .context("Failed to create swapchain")?;
    let mut scheduler =
        FrameScheduler::new(&ctx, swapchain, &settings).context("Failed to build frame scheduler")?;

    let mut fps = FpsCounter::new(config.debug.show_fps);

    while !surface.should_close() {
        surface.poll_events();
        if surface.should_close() {
            break;
        }

        scheduler.draw_frame(&mut fps).context("Frame failed")?;

        if let Some(report) = fps.take_report() {
            surface.set_title(&format!("{} - {}", config.window.title, report));
        }
    }

    scheduler.wait_idle().context("Failed to drain the GPU")?;
    log::info!(
        "Shutting down after {} frames",
        scheduler.frames_presented()
    );
    Ok(())
}

/// env_logger at the configured level; RUST_LOG wins when set.
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str())).init();
}

// =============================================================================
// FPS TRACKING
// =============================================================================

/// Averages frame times over one-second windows.
struct FpsCounter {
    enabled: bool,
    frame_count: u32,
    frame_time: Duration,
    last_update: Instant,
    report: Option<String>,
}

impl FpsCounter {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            frame_count: 0,
            frame_time: Duration::ZERO,
            last_update: Instant::now(),
            report: None,
        }
    }

    fn take_report(&mut self) -> Option<String> {
        self.report.take()
    }
}

impl FrameHooks for FpsCounter {
    fn frame_finished(&mut self, elapsed: Duration) {
        if !self.enabled {
            return;
        }

        self.frame_count += 1;
        self.frame_time += elapsed;

        let window = self.last_update.elapsed();
        if window.as_secs_f32() >= 1.0 {
            let fps = self.frame_count as f32 / window.as_secs_f32();
            let cpu_ms = self.frame_time.as_secs_f32() * 1000.0 / self.frame_count as f32;
            let report = format!("{:.0} FPS ({:.2}ms cpu)", fps, cpu_ms);
            log::debug!("{}", report);
            self.report = Some(report);

            self.frame_count = 0;
            self.frame_time = Duration::ZERO;
            self.last_update = Instant::now();
        }
    }
}
