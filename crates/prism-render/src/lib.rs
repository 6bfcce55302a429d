//! Rendering core for prism.
//!
//! This crate provides:
//! - a small GPU abstraction ([`GpuDevice`], [`CommandContext`]) with a wgpu
//!   backend and an in-memory recording backend
//! - shader passes compiled from WGSL and cached on disk ([`ShaderCache`])
//! - instanced render objects and the per-world [`WorldRenderer`]
//! - cascaded shadow maps ([`ShadowCascadeGenerator`])
//! - the per-frame [`FrameOrchestrator`]

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
// Accessors and builders don't need must_use
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// GPU sizes and counts move between usize, u32 and f32
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
// Render paths take many bindings at once
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod camera;
pub mod cascade;
pub mod constant_buffer;
pub mod context;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod instance;
pub mod instanced;
pub mod shader;
pub mod shader_cache;
mod sync;
pub mod world_renderer;

#[cfg(test)]
mod test_support;

pub use backend::{Command, CommandLog, RecordingContext, RecordingDevice, WgpuContext, WgpuDevice};
pub use camera::{Camera, CameraId, ProjectionMode};
pub use cascade::{Cascade, CascadeStage, ShadowCascadeGenerator};
pub use constant_buffer::{
    CameraConstants, ConstantBuffer, LightingConstants, PostProcessConstants,
    ShadowReceiverConstants,
};
pub use context::{FrameBindings, FrameStats, RenderContext};
pub use engine::{FrameOrchestrator, FrameReport, GuiLayer, RenderWorld, WorldId};
pub use error::{RenderError, RenderResult};
pub use geometry::{Geometry, GeometryBuffers};
pub use gpu::{CommandContext, GpuDevice};
pub use instance::{RenderObjectId, RenderSlot, Renderable, SceneInstance};
pub use instanced::{swap_remove_indexed, InstancedRenderObject};
pub use shader::{GfxShader, NagaCompiler, ShaderCompiler, ShaderPass};
pub use shader_cache::{ShaderCache, CACHE_MAGIC};
pub use world_renderer::WorldRenderer;
