//! RHI error types.

use thiserror::Error;

/// Errors surfaced by fallible RHI operations.
///
/// Caller bugs are not represented here; those are contract violations and
/// terminate through [`contract_violation!`](crate::contract_violation).
#[derive(Error, Debug)]
pub enum RhiError {
    /// Native backend API error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The requested backend cannot be loaded on this machine.
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// No adapter satisfies the minimum requirements.
    #[error("No suitable adapter found")]
    NoSuitableAdapter,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A descriptor pool could not grow to satisfy a request.
    #[error("Descriptor pool exhausted: {0}")]
    DescriptorPoolExhausted(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A fence did not reach the awaited value in time.
    #[error("Timed out waiting for fence value {0}")]
    Timeout(u64),

    /// The device was lost.
    #[error("Device lost")]
    DeviceLost,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, RhiError>;
