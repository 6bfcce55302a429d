//! Implementations of the GPU abstraction.
//!
//! - [`wgpu`]: the hardware backend, windowed or headless.
//! - [`recording`]: host-memory backend that logs every command.

pub mod recording;
pub mod wgpu;

pub use self::recording::{Command, CommandLog, RecordingContext, RecordingDevice};
pub use self::wgpu::{WgpuContext, WgpuDevice};
