// Backend module - Vulkan abstraction layer
//
// Design: thin RAII wrappers over ash, every driver call routed through the
// `Driver` seam so the frame loop runs against a recording fake in tests.

pub mod barrier;
pub mod buffer;
pub mod command;
pub mod compute;
pub mod device;
pub mod driver;
#[cfg(test)]
pub mod fake;
pub mod image;
pub mod pipeline;
pub mod render_pass;
pub mod render_target;
pub mod scheduler;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod vulkan;

pub use barrier::Barrier;
pub use buffer::Buffer;
pub use compute::ComputePass;
pub use device::{DeviceContext, DeviceSettings};
pub use image::Image;
pub use pipeline::{ColorBlend, DepthStencil, GraphicsPipeline, PipelineComponent, VertexLayout};
pub use render_pass::RenderPass;
pub use render_target::{RenderTarget, TargetState};
pub use scheduler::{
    FnHooks, FrameDependencies, FrameHooks, FrameScheduler, FrameStats, NoHooks, SchedulerSettings,
};
pub use shader::{ShaderProgram, UniformBinding};
pub use surface::{SurfaceProvider, WindowSettings, WinitSurface};
pub use swapchain::Swapchain;
