//! Core data for prism.
//!
//! This crate provides the engine-agnostic types shared by the renderer and
//! its hosts:
//! - [`RenderOptions`] configuration, loaded from JSON
//! - [`PassFlags`] selecting the passes run per camera
//! - [`MeshData`] and the built-in [`PrimitiveShape`] meshes
//! - [`Material`] and the packed [`InstanceRenderData`] record

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
// Options structs legitimately have many boolean flags
#![allow(clippy::struct_excessive_bools)]
// Builder patterns return Self which doesn't need must_use
#![allow(clippy::must_use_candidate)]
// Mesh generation converts between index and float types
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod error;
pub mod instance;
pub mod lighting;
pub mod material;
pub mod mesh;
pub mod options;
pub mod pass_flags;
pub mod primitives;

pub use error::{PrismError, Result};
pub use instance::InstanceRenderData;
pub use lighting::LightingSettings;
pub use material::{Material, ShaderVariant};
pub use mesh::{MeshData, PrimitiveTopology, Vertex};
pub use options::{CascadePartition, RenderOptions, ShadowOptions, MAX_CASCADES};
pub use pass_flags::PassFlags;
pub use primitives::PrimitiveShape;

// Re-export glam types for convenience
pub use glam::{Mat4, Vec2, Vec3, Vec4};
