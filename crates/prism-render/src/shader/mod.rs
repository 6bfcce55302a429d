//! Shader techniques and their passes.
//!
//! A [`GfxShader`] is a named technique parsed from one source file. Each of
//! its [`ShaderPass`]es compiles the shared source with its own defines and
//! entry points.

mod compiler;
mod header;
mod input_layout;
mod pass;
mod preprocess;

use std::sync::Arc;

pub use crate::gpu::ShaderStage;
pub use compiler::{
    ComponentType, NagaCompiler, ResourceBinding, ResourceKind, ShaderCompiler, StageOutput,
    VertexInputParameter,
};
pub use header::{parse_shader_source, PassDescriptor, PassState, ShaderSource};
pub use input_layout::{
    select_vertex_format, InputElement, InputLayout, VertexFormat, INSTANCE_SEMANTIC_PREFIX,
    INSTANCE_SLOT, VERTEX_SLOT,
};
pub use pass::{PassRecord, ShaderPass, StageCode};
pub use preprocess::preprocess;

use crate::error::RenderResult;
use crate::gpu::GpuDevice;

/// A named shading technique with one or more passes.
#[derive(Debug)]
pub struct GfxShader {
    name: String,
    passes: Vec<Arc<ShaderPass>>,
    source: String,
}

impl GfxShader {
    /// Assembles a shader from already built passes.
    pub fn new(name: impl Into<String>, passes: Vec<ShaderPass>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passes: passes.into_iter().map(Arc::new).collect(),
            source: source.into(),
        }
    }

    /// Compiles every pass declared by `source`.
    pub fn compile(source: &ShaderSource, compiler: &dyn ShaderCompiler) -> RenderResult<Self> {
        let passes = source
            .passes
            .iter()
            .map(|descriptor| ShaderPass::compile(&source.name, descriptor, &source.source, compiler))
            .collect::<RenderResult<Vec<_>>>()?;
        Ok(Self::new(source.name.clone(), passes, source.source.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn passes(&self) -> &[Arc<ShaderPass>] {
        &self.passes
    }

    /// Pass named `name`.
    pub fn pass(&self, name: &str) -> Option<&Arc<ShaderPass>> {
        self.passes.iter().find(|p| p.name() == name)
    }

    /// Raw source the passes were compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Creates stage objects for every pass.
    pub fn bind_to_device(&self, device: &dyn GpuDevice) -> RenderResult<()> {
        for pass in &self.passes {
            pass.bind_to_device(device)?;
        }
        Ok(())
    }

    /// Destroys stage objects of every pass.
    pub fn release(&self, device: &dyn GpuDevice) {
        for pass in &self.passes {
            pass.release(device);
        }
    }
}
