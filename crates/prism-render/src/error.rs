//! Rendering error types.

use thiserror::Error;

use crate::gpu::ShaderStage;

/// Errors that can occur during rendering operations.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Failed to create wgpu adapter.
    #[error("failed to create graphics adapter")]
    AdapterCreationFailed,

    /// Failed to create wgpu device.
    #[error("failed to create graphics device: {0}")]
    DeviceCreationFailed(#[from] wgpu::RequestDeviceError),

    /// Failed to create surface.
    #[error("failed to create surface: {0}")]
    SurfaceCreationFailed(#[from] wgpu::CreateSurfaceError),

    /// Surface configuration failed.
    #[error("surface configuration failed")]
    SurfaceConfigurationFailed,

    /// A shader stage failed to compile. `message` is the compiler output.
    #[error("shader '{shader}' pass '{pass}' {stage:?} stage failed to compile:\n{message}")]
    ShaderCompile {
        shader: String,
        pass: String,
        stage: ShaderStage,
        message: String,
    },

    /// A vertex input could not be mapped to a vertex format.
    #[error("invalid input layout for '{semantic}': usage mask {mask:#x}")]
    InvalidInputLayout { semantic: String, mask: u8 },

    /// A shader source header is malformed.
    #[error("invalid shader header in '{source_name}': {reason}")]
    InvalidShaderHeader { source_name: String, reason: String },

    /// The shader cache file is not a valid cache.
    #[error("shader cache is corrupt: {0}")]
    ShaderCacheCorrupt(String),

    /// A pass was applied before its stage objects were created.
    #[error("shader pass '{0}' is not bound to a device")]
    PassNotBound(String),

    /// Buffer creation failed.
    #[error("buffer creation failed: {0}")]
    BufferCreationFailed(String),

    /// A write does not fit the destination buffer.
    #[error("write of {len} bytes exceeds {size}-byte buffer {buffer}")]
    BufferWriteOutOfRange { buffer: u64, size: u64, len: usize },

    /// A handle does not name a live resource.
    #[error("unknown {kind} resource {id}")]
    UnknownResource { kind: &'static str, id: u64 },

    /// The backend rejected a pipeline or stage object.
    #[error("pipeline creation failed for '{label}': {message}")]
    PipelineCreationFailed { label: String, message: String },

    /// A resource a program expects is not bound.
    #[error("missing binding: {0}")]
    MissingBinding(String),

    /// Feature is declared but not implemented.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Surface lost.
    #[error("surface lost")]
    SurfaceLost,

    /// Surface outdated.
    #[error("surface outdated")]
    SurfaceOutdated,

    /// Out of memory.
    #[error("out of memory")]
    OutOfMemory,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the core crate.
    #[error(transparent)]
    Core(#[from] prism_core::PrismError),
}

/// A specialized Result type for rendering operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;
