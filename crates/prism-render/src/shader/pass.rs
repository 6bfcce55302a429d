//! Shader passes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::gpu::{
    DepthState, GpuDevice, PassId, ProgramBinding, RasterizerState, ShaderStage, StageBinding,
};
use crate::shader::compiler::{ResourceBinding, ShaderCompiler, VertexInputParameter};
use crate::shader::header::{stage_index, PassDescriptor, PassState};
use crate::shader::input_layout::InputLayout;
use crate::shader::preprocess::preprocess;
use crate::sync::lock;

static NEXT_PASS_ID: AtomicU64 = AtomicU64::new(1);

/// Bytecode of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCode {
    pub entry_point: String,
    pub words: Vec<u32>,
}

/// Serializable form of a pass. Restoring it does not need a compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRecord {
    pub name: String,
    pub state: PassState,
    pub defines: Vec<String>,
    /// Indexed like [`ShaderStage::ALL`].
    pub stages: [Option<StageCode>; 4],
    pub inputs: Vec<VertexInputParameter>,
    pub resources: Vec<ResourceBinding>,
}

/// One compiled pass of a shader: stage bytecode, fixed-function state and
/// the input layout derived from the vertex stage.
///
/// Stage objects are created by [`ShaderPass::bind_to_device`]; until then
/// [`ShaderPass::apply`] fails with [`RenderError::PassNotBound`].
#[derive(Debug)]
pub struct ShaderPass {
    id: PassId,
    shader_name: String,
    record: PassRecord,
    input_layout: InputLayout,
    bound: Mutex<Option<Arc<ProgramBinding>>>,
}

impl ShaderPass {
    /// Compiles every stage the descriptor names from `source`.
    ///
    /// The compiler's message is logged and returned verbatim on failure.
    pub fn compile(
        shader_name: &str,
        descriptor: &PassDescriptor,
        source: &str,
        compiler: &dyn ShaderCompiler,
    ) -> RenderResult<Self> {
        let fail = |stage: ShaderStage, message: String| {
            log::error!(
                "shader '{shader_name}' pass '{}' ({stage:?}) failed to compile:\n{message}",
                descriptor.name
            );
            RenderError::ShaderCompile {
                shader: shader_name.to_string(),
                pass: descriptor.name.clone(),
                stage,
                message,
            }
        };

        let mut stages: [Option<StageCode>; 4] = Default::default();
        let mut inputs = Vec::new();
        let mut resources: Vec<ResourceBinding> = Vec::new();
        let mut preprocessed = None;

        for stage in ShaderStage::ALL {
            let Some(entry_point) = descriptor.entry_point(stage) else {
                continue;
            };
            if preprocessed.is_none() {
                preprocessed = Some(
                    preprocess(source, &descriptor.defines).map_err(|m| fail(stage, m))?,
                );
            }
            let text = preprocessed.as_deref().unwrap_or_default();
            let output = compiler
                .compile_stage(text, stage, entry_point)
                .map_err(|m| fail(stage, m))?;

            if stage == ShaderStage::Vertex {
                inputs = output.inputs;
            }
            for resource in output.resources {
                if !resources
                    .iter()
                    .any(|r| r.group == resource.group && r.binding == resource.binding)
                {
                    resources.push(resource);
                }
            }
            stages[stage_index(stage)] = Some(StageCode {
                entry_point: entry_point.to_string(),
                words: output.bytecode,
            });
        }
        resources.sort_by_key(|r| (r.group, r.binding));

        log::debug!(
            "compiled shader '{shader_name}' pass '{}' ({} inputs, {} resources)",
            descriptor.name,
            inputs.len(),
            resources.len()
        );

        Self::load(
            shader_name,
            PassRecord {
                name: descriptor.name.clone(),
                state: descriptor.state,
                defines: descriptor.defines.clone(),
                stages,
                inputs,
                resources,
            },
        )
    }

    /// Restores a pass from a record.
    pub fn load(shader_name: &str, record: PassRecord) -> RenderResult<Self> {
        let input_layout = InputLayout::from_inputs(&record.inputs)?;
        Ok(Self {
            id: PassId(NEXT_PASS_ID.fetch_add(1, Ordering::Relaxed)),
            shader_name: shader_name.to_string(),
            record,
            input_layout,
            bound: Mutex::new(None),
        })
    }

    /// Serializable copy of this pass.
    pub fn save(&self) -> PassRecord {
        self.record.clone()
    }

    pub fn id(&self) -> PassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn shader_name(&self) -> &str {
        &self.shader_name
    }

    pub fn state(&self) -> PassState {
        self.record.state
    }

    pub fn defines(&self) -> &[String] {
        &self.record.defines
    }

    pub fn input_layout(&self) -> &InputLayout {
        &self.input_layout
    }

    pub fn resources(&self) -> &[ResourceBinding] {
        &self.record.resources
    }

    /// Bytecode of `stage`, if present.
    pub fn stage(&self, stage: ShaderStage) -> Option<&StageCode> {
        self.record.stages[stage_index(stage)].as_ref()
    }

    pub fn rasterizer_state(&self) -> RasterizerState {
        RasterizerState {
            cull: self.record.state.cull,
            fill: self.record.state.fill,
        }
    }

    /// Whether stage objects exist.
    pub fn is_bound(&self) -> bool {
        lock(&self.bound).is_some()
    }

    /// Creates stage objects on `device`. Calling it again is a no-op.
    pub fn bind_to_device(&self, device: &dyn GpuDevice) -> RenderResult<()> {
        let mut bound = lock(&self.bound);
        if bound.is_some() {
            return Ok(());
        }

        let label = format!("{}/{}", self.shader_name, self.record.name);
        let mut created: Vec<(ShaderStage, StageBinding)> = Vec::new();
        for stage in ShaderStage::ALL {
            let Some(code) = self.stage(stage) else {
                continue;
            };
            match device.create_shader_stage(stage, &code.words, &label) {
                Ok(id) => created.push((
                    stage,
                    StageBinding {
                        id,
                        entry_point: code.entry_point.clone(),
                    },
                )),
                Err(err) => {
                    for (_, binding) in created {
                        device.destroy_shader_stage(binding.id);
                    }
                    return Err(err);
                }
            }
        }

        let take = |stage: ShaderStage| {
            created
                .iter()
                .find(|(s, _)| *s == stage)
                .map(|(_, b)| b.clone())
        };
        *bound = Some(Arc::new(ProgramBinding {
            pass: self.id,
            label,
            vertex: take(ShaderStage::Vertex),
            pixel: take(ShaderStage::Pixel),
            compute: take(ShaderStage::Compute),
            input_layout: self.input_layout.clone(),
            rasterizer: self.rasterizer_state(),
            resources: self.record.resources.clone(),
        }));
        Ok(())
    }

    /// Makes this the active pass: binds its program, blend and depth state.
    ///
    /// Does nothing when this pass is already active on `ctx`.
    pub fn apply(&self, ctx: &mut RenderContext<'_>) -> RenderResult<()> {
        if ctx.current_pass() == Some(self.id) {
            return Ok(());
        }
        let program = lock(&self.bound)
            .clone()
            .ok_or_else(|| RenderError::PassNotBound(format!("{}/{}", self.shader_name, self.record.name)))?;

        let state = self.record.state;
        ctx.commands.bind_program(&program);
        ctx.commands.set_blend_mode(state.blend);
        ctx.commands.set_depth_state(DepthState {
            test: state.depth_test,
            write: state.depth_write,
        });
        ctx.set_current_pass(self.id);
        Ok(())
    }

    /// Destroys stage objects.
    pub fn release(&self, device: &dyn GpuDevice) {
        if let Some(program) = lock(&self.bound).take() {
            for stage in [&program.vertex, &program.pixel, &program.compute]
                .into_iter()
                .flatten()
            {
                device.destroy_shader_stage(stage.id);
            }
        }
    }
}
