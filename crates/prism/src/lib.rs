//! prism: an instanced world renderer.
//!
//! Games hand the renderer shared [`Renderable`] instances. Instances that
//! share a geometry and material are drawn with one instanced call per
//! object. Each frame runs the passes selected by [`PassFlags`]: cascaded
//! shadows, the sky and world geometry, a lighting haze, post-processing
//! and an optional GUI layer.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use prism::*;
//!
//! fn main() -> prism::Result<()> {
//!     init_logging();
//!     let renderer = headless(640, 480, RenderOptions::default())?;
//!     let world = renderer.add_world("main");
//!     renderer.with_world(world, |world| {
//!         world.set_camera(Some(Camera::new(640.0 / 480.0)));
//!         world
//!             .renderer()
//!             .add_primitive(PrimitiveShape::Cube, Arc::new(SceneInstance::new(Vec3::ZERO)));
//!     });
//!     renderer.render_frame()?;
//!     renderer.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! Without a GPU, [`recording`] builds the same orchestrator over the
//! in-memory backend.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

mod headless;
mod init;

pub use headless::{headless, recording};
pub use init::{init_logging, load_options, windowed};

pub use prism_core::{
    CascadePartition, InstanceRenderData, LightingSettings, Material, MeshData, PassFlags,
    PrimitiveShape, PrimitiveTopology, PrismError, RenderOptions, ShaderVariant, ShadowOptions,
    Vertex, MAX_CASCADES,
};
pub use prism_render::{
    Camera, CameraId, Command, CommandContext, CommandLog, FrameOrchestrator, FrameReport,
    FrameStats, Geometry, GpuDevice, GuiLayer, InstancedRenderObject, NagaCompiler,
    ProjectionMode, RecordingContext, RecordingDevice, RenderContext, RenderError,
    RenderObjectId, RenderWorld, Renderable, SceneInstance, ShaderCache, ShaderCompiler,
    ShadowCascadeGenerator, WgpuContext, WorldId, WorldRenderer, CACHE_MAGIC,
};

pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

/// Result type used across the facade.
pub type Result<T> = prism_render::RenderResult<T>;
