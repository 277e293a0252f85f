// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors, and
// converts the sections into the settings structs the backend takes.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::backend::{DeviceSettings, SchedulerSettings, WindowSettings};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vks-frame".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// "mailbox", "immediate", "fifo", "fifo_relaxed", or "auto".
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// Bound on every CPU-side fence wait.
    pub fence_timeout_ms: u64,
    pub depth_buffer: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "auto".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
            fence_timeout_ms: 5000,
            depth_buffer: false,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// env_logger filter used when RUST_LOG is unset.
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Present mode as a Vulkan enum. `None` lets the swapchain pick.
    pub fn get_present_mode(&self) -> Option<vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
            "auto" | "" => None,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', letting the swapchain choose",
                    self.graphics.present_mode
                );
                None
            }
        }
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.graphics.fence_timeout_ms)
    }
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_frames_in_flight: config.graphics.max_frames_in_flight,
            depth_buffer: config.graphics.depth_buffer,
            clear_color: config.graphics.clear_color,
            present_mode: config.get_present_mode(),
        }
    }
}

impl From<&Config> for DeviceSettings {
    fn from(config: &Config) -> Self {
        Self {
            app_name: config.window.title.clone(),
            // Validation only in debug builds, and only if asked for
            enable_validation: cfg!(debug_assertions) && config.debug.validation_layers,
            fence_timeout: config.fence_timeout(),
        }
    }
}

impl From<&Config> for WindowSettings {
    fn from(config: &Config) -> Self {
        Self {
            title: config.window.title.clone(),
            width: config.window.width,
            height: config.window.height,
            fullscreen: config.window.fullscreen,
        }
    }
}
