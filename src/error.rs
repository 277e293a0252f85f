// Error taxonomy for the rendering layer
//
// Every checked driver call funnels through `vk_check`, which tags the failure
// with the call name and the caller's source location (the Rust counterpart of
// a VK_CHECK macro). Nothing in the library retries: errors propagate to the
// outermost loop and end the run.

use ash::vk;
use std::panic::Location;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RenderError {
    /// No suitable device, queue family, surface or format.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Host, device or descriptor-pool memory exhausted.
    #[error("{call} ran out of memory: {result:?}")]
    AllocationFailure {
        call: &'static str,
        result: vk::Result,
    },

    #[error("no memory type matches filter {type_bits:#034b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("{call} failed with {result:?} at {location}")]
    DriverCall {
        call: &'static str,
        location: &'static Location<'static>,
        result: vk::Result,
    },

    /// A bounded wait elapsed before the GPU signaled.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        what: &'static str,
        timeout: Duration,
    },

    #[error("{what} is not allowed in the {state} state")]
    InvalidState {
        what: &'static str,
        state: &'static str,
    },

    #[error("memory is not host visible")]
    NotHostVisible,

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("shader artifact {path:?}: {source}")]
    ShaderArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RenderError::Timeout { .. })
    }

    /// True for results that mean the device or swapchain is gone and a
    /// higher layer would have to rebuild it.
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            RenderError::DriverCall {
                result: vk::Result::ERROR_DEVICE_LOST
                    | vk::Result::ERROR_OUT_OF_DATE_KHR
                    | vk::Result::ERROR_SURFACE_LOST_KHR,
                ..
            }
        )
    }
}

/// Map a raw driver result onto the error taxonomy.
#[track_caller]
pub fn vk_check<T>(result: ash::prelude::VkResult<T>, call: &'static str) -> Result<T> {
    // Closures do not inherit caller tracking; read the location here.
    let location = Location::caller();
    result.map_err(|result| match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY
        | vk::Result::ERROR_FRAGMENTED_POOL => RenderError::AllocationFailure { call, result },
        result => RenderError::DriverCall {
            call,
            location,
            result,
        },
    })
}

/// Like [`vk_check`] for fence waits: a driver `TIMEOUT` becomes
/// [`RenderError::Timeout`].
#[track_caller]
pub fn wait_check(
    result: ash::prelude::VkResult<()>,
    what: &'static str,
    timeout: Duration,
) -> Result<()> {
    match result {
        Err(vk::Result::TIMEOUT) => Err(RenderError::Timeout { what, timeout }),
        other => vk_check(other, "vkWaitForFences"),
    }
}
