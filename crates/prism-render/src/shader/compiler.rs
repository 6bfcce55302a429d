//! Stage compilation and reflection.

use naga::back::spv;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, Binding, ImageClass, ScalarKind, TypeInner};

use crate::gpu::ShaderStage;

/// Numeric type of a vertex input's components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentType {
    Float,
    Uint,
    Sint,
}

/// A reflected vertex-stage input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexInputParameter {
    /// Parameter (or struct member) name.
    pub semantic: String,
    pub location: u32,
    pub component: ComponentType,
    /// One bit per active component.
    pub mask: u8,
}

/// Kind of a reflected resource binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    UniformBuffer,
    DepthTexture,
    Texture,
    Sampler,
    ComparisonSampler,
}

/// A reflected `@group(g) @binding(b)` resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceBinding {
    pub group: u32,
    pub binding: u32,
    pub kind: ResourceKind,
}

/// Output of compiling one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    /// SPIR-V words.
    pub bytecode: Vec<u32>,
    /// Vertex inputs; empty for other stages.
    pub inputs: Vec<VertexInputParameter>,
    /// Resources the entry point uses.
    pub resources: Vec<ResourceBinding>,
}

/// Compiles preprocessed shader source to stage bytecode.
///
/// Errors carry the compiler's diagnostic text.
pub trait ShaderCompiler: Send + Sync {
    fn compile_stage(
        &self,
        source: &str,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<StageOutput, String>;
}

/// WGSL compiler producing SPIR-V through naga.
#[derive(Debug, Clone, Copy, Default)]
pub struct NagaCompiler;

impl NagaCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl ShaderCompiler for NagaCompiler {
    fn compile_stage(
        &self,
        source: &str,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<StageOutput, String> {
        let naga_stage = match stage {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Pixel => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
            ShaderStage::Geometry => {
                return Err(format!(
                    "entry point '{entry_point}': geometry stages are not supported by WGSL"
                ))
            }
        };

        let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;
        let info = Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .map_err(|e| e.emit_to_string(source))?;

        let index = module
            .entry_points
            .iter()
            .position(|ep| ep.name == entry_point && ep.stage == naga_stage)
            .ok_or_else(|| format!("no {naga_stage:?} entry point named '{entry_point}'"))?;

        let inputs = if stage == ShaderStage::Vertex {
            reflect_inputs(&module, index)?
        } else {
            Vec::new()
        };
        let resources = reflect_resources(&module, &info, index)?;

        let mut options = spv::Options::default();
        // Stage objects are consumed in the WGSL coordinate convention.
        options
            .flags
            .remove(spv::WriterFlags::ADJUST_COORDINATE_SPACE);
        let pipeline = spv::PipelineOptions {
            shader_stage: naga_stage,
            entry_point: entry_point.to_string(),
        };
        let bytecode =
            spv::write_vec(&module, &info, &options, Some(&pipeline)).map_err(|e| e.to_string())?;

        Ok(StageOutput {
            bytecode,
            inputs,
            resources,
        })
    }
}

fn reflect_inputs(module: &naga::Module, index: usize) -> Result<Vec<VertexInputParameter>, String> {
    let mut inputs = Vec::new();
    for argument in &module.entry_points[index].function.arguments {
        match (&argument.binding, &module.types[argument.ty].inner) {
            (Some(Binding::Location { location, .. }), inner) => {
                inputs.push(input_parameter(argument.name.as_deref(), *location, inner)?);
            }
            (None, TypeInner::Struct { members, .. }) => {
                for member in members {
                    if let Some(Binding::Location { location, .. }) = &member.binding {
                        let inner = &module.types[member.ty].inner;
                        inputs.push(input_parameter(member.name.as_deref(), *location, inner)?);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(inputs)
}

fn input_parameter(
    name: Option<&str>,
    location: u32,
    inner: &TypeInner,
) -> Result<VertexInputParameter, String> {
    let semantic = name.map_or_else(|| format!("location{location}"), str::to_string);
    let (width, scalar) = match inner {
        TypeInner::Scalar(scalar) => (1u32, scalar),
        TypeInner::Vector { size, scalar } => (*size as u32, scalar),
        other => return Err(format!("vertex input '{semantic}' has unsupported type {other:?}")),
    };
    let component = match scalar.kind {
        ScalarKind::Float if scalar.width == 4 => ComponentType::Float,
        ScalarKind::Uint if scalar.width == 4 => ComponentType::Uint,
        ScalarKind::Sint if scalar.width == 4 => ComponentType::Sint,
        _ => return Err(format!("vertex input '{semantic}' has unsupported scalar {scalar:?}")),
    };
    Ok(VertexInputParameter {
        semantic,
        location,
        component,
        mask: ((1u32 << width) - 1) as u8,
    })
}

fn reflect_resources(
    module: &naga::Module,
    info: &naga::valid::ModuleInfo,
    index: usize,
) -> Result<Vec<ResourceBinding>, String> {
    let usage = info.get_entry_point(index);
    let mut resources = Vec::new();
    for (handle, variable) in module.global_variables.iter() {
        let Some(binding) = &variable.binding else {
            continue;
        };
        if usage[handle].is_empty() {
            continue;
        }
        let kind = match (variable.space, &module.types[variable.ty].inner) {
            (AddressSpace::Uniform, _) => ResourceKind::UniformBuffer,
            (
                AddressSpace::Handle,
                TypeInner::Image {
                    class: ImageClass::Depth { .. },
                    ..
                },
            ) => ResourceKind::DepthTexture,
            (AddressSpace::Handle, TypeInner::Image { .. }) => ResourceKind::Texture,
            (AddressSpace::Handle, TypeInner::Sampler { comparison: true }) => {
                ResourceKind::ComparisonSampler
            }
            (AddressSpace::Handle, TypeInner::Sampler { comparison: false }) => {
                ResourceKind::Sampler
            }
            (space, _) => {
                return Err(format!(
                    "resource @group({}) @binding({}) uses unsupported address space {space:?}",
                    binding.group, binding.binding
                ))
            }
        };
        resources.push(ResourceBinding {
            group: binding.group,
            binding: binding.binding,
            kind,
        });
    }
    resources.sort_by_key(|r| (r.group, r.binding));
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r"
struct Camera { view_proj: mat4x4<f32> }
@group(0) @binding(0) var<uniform> camera: Camera;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) uv: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput, @location(2) I_material: u32) -> @builtin(position) vec4<f32> {
    return camera.view_proj * vec4<f32>(in.position + vec3<f32>(f32(I_material)), 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0);
}
";

    #[test]
    fn test_compile_vertex_reflects_inputs_and_resources() {
        let output = NagaCompiler::new()
            .compile_stage(SOURCE, ShaderStage::Vertex, "vs_main")
            .unwrap();
        assert_eq!(output.bytecode[0], 0x0723_0203);

        let inputs: Vec<_> = output
            .inputs
            .iter()
            .map(|i| (i.semantic.as_str(), i.location, i.mask, i.component))
            .collect();
        assert_eq!(
            inputs,
            vec![
                ("position", 0, 0b111, ComponentType::Float),
                ("uv", 1, 0b11, ComponentType::Float),
                ("I_material", 2, 0b1, ComponentType::Uint),
            ]
        );
        assert_eq!(
            output.resources,
            vec![ResourceBinding {
                group: 0,
                binding: 0,
                kind: ResourceKind::UniformBuffer
            }]
        );
    }

    #[test]
    fn test_fragment_stage_has_no_inputs_or_unused_resources() {
        let output = NagaCompiler::new()
            .compile_stage(SOURCE, ShaderStage::Pixel, "fs_main")
            .unwrap();
        assert!(output.inputs.is_empty());
        assert!(output.resources.is_empty());
    }

    #[test]
    fn test_syntax_error_carries_diagnostic() {
        let message = NagaCompiler::new()
            .compile_stage("fn broken( {", ShaderStage::Vertex, "vs_main")
            .unwrap_err();
        assert!(!message.is_empty());
    }

    #[test]
    fn test_missing_entry_point() {
        let message = NagaCompiler::new()
            .compile_stage(SOURCE, ShaderStage::Vertex, "nope")
            .unwrap_err();
        assert!(message.contains("nope"));
    }

    #[test]
    fn test_geometry_stage_unsupported() {
        assert!(NagaCompiler::new()
            .compile_stage(SOURCE, ShaderStage::Geometry, "gs_main")
            .is_err());
    }
}
