//! Graphics API abstraction.
//!
//! The renderer is written against two traits: [`GpuDevice`] creates and
//! destroys resources and may be shared between threads, while
//! [`CommandContext`] records state changes and draws and is owned by the
//! render thread. Resources are referred to by opaque handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prism_core::PrimitiveTopology;

use crate::error::RenderResult;
use crate::shader::{InputLayout, ResourceBinding};

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Resource kind name used in diagnostics.
            pub const KIND: &'static str = $kind;
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

handle!(
    /// A GPU buffer.
    BufferId,
    "buffer"
);
handle!(
    /// A compiled shader stage object.
    StageId,
    "stage"
);
handle!(
    /// A layered depth texture (one layer per shadow cascade).
    DepthTargetId,
    "depth-target"
);
handle!(
    /// Identity of a shader pass, used to skip redundant program binds.
    PassId,
    "pass"
);

/// Hands out unique, non-zero handle values.
#[derive(Debug)]
pub struct HandleAllocator(AtomicU64);

impl HandleAllocator {
    /// Creates an allocator whose first handle is 1.
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Returns the next handle value.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Programmable pipeline stages a pass may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Geometry,
    Compute,
}

impl ShaderStage {
    /// All stages in serialization order.
    pub const ALL: [ShaderStage; 4] = [
        ShaderStage::Vertex,
        ShaderStage::Pixel,
        ShaderStage::Geometry,
        ShaderStage::Compute,
    ];

    /// Header attribute naming this stage's entry point.
    pub fn attribute(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Pixel => "pixel",
            ShaderStage::Geometry => "geometry",
            ShaderStage::Compute => "compute",
        }
    }
}

/// What a buffer is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    Constant,
}

/// Parameters for [`GpuDevice::create_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
}

/// Colour blending applied by the output merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    AlphaBlend,
    Additive,
    /// Multiplies the destination by the source colour.
    Modulate,
}

/// Depth test and write switches. The test always uses less-or-equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
}

impl DepthState {
    /// Standard opaque geometry state.
    pub const OPAQUE: Self = Self {
        test: true,
        write: true,
    };
    /// Test against existing depth without writing.
    pub const READ_ONLY: Self = Self {
        test: true,
        write: false,
    };
    /// No depth interaction.
    pub const DISABLED: Self = Self {
        test: false,
        write: false,
    };
}

impl Default for DepthState {
    fn default() -> Self {
        Self::OPAQUE
    }
}

/// Face culling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

/// Polygon fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

/// Fixed-function rasterizer state built from a pass's cull and fill settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RasterizerState {
    pub cull: CullMode,
    pub fill: FillMode,
}

/// Where subsequent draws land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderTarget {
    /// The swap chain (or off-screen colour target) with its depth buffer.
    #[default]
    Backbuffer,
    /// One layer of a depth array, without colour output.
    DepthSlice { target: DepthTargetId, layer: u32 },
}

/// A stage object and the entry point it was compiled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBinding {
    pub id: StageId,
    pub entry_point: String,
}

/// Device-side state of a shader pass: everything a backend needs to build a
/// pipeline for it.
#[derive(Debug, Clone)]
pub struct ProgramBinding {
    pub pass: PassId,
    pub label: String,
    pub vertex: Option<StageBinding>,
    pub pixel: Option<StageBinding>,
    pub compute: Option<StageBinding>,
    pub input_layout: InputLayout,
    pub rasterizer: RasterizerState,
    pub resources: Vec<ResourceBinding>,
}

/// Resource creation and destruction.
///
/// Implementations are shared between the render thread and loader threads.
pub trait GpuDevice: Send + Sync {
    /// Creates a buffer of `desc.size` bytes. Contents are undefined until written.
    fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> RenderResult<BufferId>;

    /// Releases a buffer. Unknown handles are ignored.
    fn destroy_buffer(&self, buffer: BufferId);

    /// Creates a stage object from SPIR-V words.
    fn create_shader_stage(
        &self,
        stage: ShaderStage,
        words: &[u32],
        label: &str,
    ) -> RenderResult<StageId>;

    /// Releases a stage object. Unknown handles are ignored.
    fn destroy_shader_stage(&self, stage: StageId);

    /// Creates a square depth texture with `layers` array layers.
    fn create_depth_array(&self, size: u32, layers: u32, label: &str)
        -> RenderResult<DepthTargetId>;

    /// Releases a depth array. Unknown handles are ignored.
    fn destroy_depth_array(&self, target: DepthTargetId);
}

/// Command submission for one device context.
///
/// Commands take effect in call order; buffer writes are ordered against
/// the draws around them.
pub trait CommandContext: Send {
    /// The device this context submits to.
    fn device(&self) -> &dyn GpuDevice;

    /// Replaces the whole contents of `buffer` starting at offset zero.
    /// Previous contents are discarded.
    fn write_buffer(&mut self, buffer: BufferId, data: &[u8]) -> RenderResult<()>;

    fn set_render_target(&mut self, target: RenderTarget);

    /// Clears the colour attachment of the current target.
    fn clear_colour(&mut self, colour: [f32; 4]);

    /// Clears the depth attachment of the current target.
    fn clear_depth(&mut self, depth: f32);

    /// Binds stages, input layout and rasterizer state.
    fn bind_program(&mut self, program: &Arc<ProgramBinding>);

    fn set_blend_mode(&mut self, mode: BlendMode);

    fn set_depth_state(&mut self, state: DepthState);

    /// Binds a constant buffer to `slot` for all stages.
    fn set_constant_buffer(&mut self, slot: u32, buffer: BufferId);

    /// Binds (or unbinds) the cascade depth array for sampling.
    fn set_shadow_map(&mut self, target: Option<DepthTargetId>);

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferId, stride: u32);

    /// Binds a buffer of `u32` indices.
    fn set_index_buffer(&mut self, buffer: BufferId);

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);

    /// Non-indexed draw of one instance.
    fn draw(&mut self, vertex_count: u32);

    fn draw_indexed_instanced(&mut self, index_count: u32, instance_count: u32);

    /// Resizes the backbuffer and its depth buffer.
    fn resize_backbuffer(&mut self, width: u32, height: u32) -> RenderResult<()>;

    /// Current backbuffer size in pixels.
    fn backbuffer_size(&self) -> (u32, u32);

    /// Submits recorded work and shows the backbuffer.
    fn present(&mut self) -> RenderResult<()>;

    /// Submits recorded work without presenting.
    fn flush(&mut self) -> RenderResult<()>;

    /// Drops work recorded since the last submit. Used when a frame fails
    /// part way through.
    fn discard(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_allocator_is_unique_and_non_zero() {
        let allocator = HandleAllocator::new();
        let a = allocator.next();
        let b = allocator.next();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_handle_debug() {
        assert_eq!(format!("{:?}", BufferId(7)), "buffer#7");
        assert_eq!(BufferId::KIND, "buffer");
    }
}
