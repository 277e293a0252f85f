// vks-frame - Vulkan frame scheduling on ash
//
// `backend` holds the GPU objects and the frame loop, `config` the
// `config.toml` layer the demo binary reads, `error` the library error type.

pub mod backend;
pub mod config;
pub mod error;

pub use error::{RenderError, Result};
