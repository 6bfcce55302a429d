//! Shader source files: an XML header declaring the passes, followed by the
//! raw WGSL all passes compile from.
//!
//! ```text
//! <shader name="world">
//!   <pass name="scene" vertex="vs_main" pixel="fs_main" cull="back"/>
//!   <pass name="depth" vertex="vs_main" defines="DEPTH_ONLY" blend="opaque"/>
//! </shader>
//! ...WGSL...
//! ```

use crate::error::{RenderError, RenderResult};
use crate::gpu::{BlendMode, CullMode, FillMode, ShaderStage};

const HEADER_END: &str = "</shader>";

/// Fixed-function state of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassState {
    pub blend: BlendMode,
    pub cull: CullMode,
    pub fill: FillMode,
    pub depth_write: bool,
    pub depth_test: bool,
}

impl Default for PassState {
    fn default() -> Self {
        Self {
            blend: BlendMode::Opaque,
            cull: CullMode::Back,
            fill: FillMode::Solid,
            depth_write: true,
            depth_test: true,
        }
    }
}

/// One `<pass>` element.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassDescriptor {
    pub name: String,
    /// Entry point per stage, indexed like [`ShaderStage::ALL`].
    pub entry_points: [Option<String>; 4],
    pub state: PassState,
    pub defines: Vec<String>,
}

impl PassDescriptor {
    /// Entry point for `stage`, if the pass uses it.
    pub fn entry_point(&self, stage: ShaderStage) -> Option<&str> {
        self.entry_points[stage_index(stage)].as_deref()
    }
}

/// A parsed shader source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub name: String,
    pub passes: Vec<PassDescriptor>,
    /// WGSL following the header.
    pub source: String,
}

pub(crate) fn stage_index(stage: ShaderStage) -> usize {
    match stage {
        ShaderStage::Vertex => 0,
        ShaderStage::Pixel => 1,
        ShaderStage::Geometry => 2,
        ShaderStage::Compute => 3,
    }
}

/// Splits `text` at the end of its header and parses the header.
///
/// `origin` names the file in diagnostics.
pub fn parse_shader_source(origin: &str, text: &str) -> RenderResult<ShaderSource> {
    let invalid = |reason: String| RenderError::InvalidShaderHeader {
        source_name: origin.to_string(),
        reason,
    };

    let end = text
        .find(HEADER_END)
        .ok_or_else(|| invalid(format!("missing {HEADER_END}")))?
        + HEADER_END.len();
    let (header, source) = text.split_at(end);

    let document = roxmltree::Document::parse(header).map_err(|e| invalid(e.to_string()))?;
    let root = document.root_element();
    if !root.has_tag_name("shader") {
        return Err(invalid(format!(
            "root element is <{}>, expected <shader>",
            root.tag_name().name()
        )));
    }
    let name = root
        .attribute("name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| invalid("<shader> has no name".to_string()))?
        .to_string();

    let mut passes = Vec::new();
    for node in root.children().filter(|n| n.has_tag_name("pass")) {
        let pass_name = node
            .attribute("name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("<pass> has no name".to_string()))?;
        if passes.iter().any(|p: &PassDescriptor| p.name == pass_name) {
            return Err(invalid(format!("duplicate pass '{pass_name}'")));
        }

        let mut descriptor = PassDescriptor {
            name: pass_name.to_string(),
            ..PassDescriptor::default()
        };
        for stage in ShaderStage::ALL {
            descriptor.entry_points[stage_index(stage)] = node
                .attribute(stage.attribute())
                .filter(|e| !e.is_empty())
                .map(str::to_string);
        }

        let attribute = |key: &str| node.attribute(key).map(str::trim);
        let state = &mut descriptor.state;
        if let Some(value) = attribute("blend") {
            state.blend = parse_blend(value).ok_or_else(|| invalid(format!("blend=\"{value}\"")))?;
        }
        if let Some(value) = attribute("cull") {
            state.cull = parse_cull(value).ok_or_else(|| invalid(format!("cull=\"{value}\"")))?;
        }
        if let Some(value) = attribute("fill") {
            state.fill = parse_fill(value).ok_or_else(|| invalid(format!("fill=\"{value}\"")))?;
        }
        if let Some(value) = attribute("depth_write") {
            state.depth_write =
                parse_bool(value).ok_or_else(|| invalid(format!("depth_write=\"{value}\"")))?;
        }
        if let Some(value) = attribute("depth_test") {
            state.depth_test =
                parse_bool(value).ok_or_else(|| invalid(format!("depth_test=\"{value}\"")))?;
        }
        if let Some(value) = attribute("defines") {
            descriptor.defines = value
                .split(|c: char| c == ';' || c.is_whitespace())
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }
        passes.push(descriptor);
    }

    if passes.is_empty() {
        return Err(invalid(format!("shader '{name}' declares no passes")));
    }

    Ok(ShaderSource {
        name,
        passes,
        source: source.to_string(),
    })
}

fn parse_blend(value: &str) -> Option<BlendMode> {
    match value {
        "opaque" | "none" => Some(BlendMode::Opaque),
        "alpha" => Some(BlendMode::AlphaBlend),
        "additive" => Some(BlendMode::Additive),
        "modulate" => Some(BlendMode::Modulate),
        _ => None,
    }
}

fn parse_cull(value: &str) -> Option<CullMode> {
    match value {
        "none" => Some(CullMode::None),
        "front" => Some(CullMode::Front),
        "back" => Some(CullMode::Back),
        _ => None,
    }
}

fn parse_fill(value: &str) -> Option<FillMode> {
    match value {
        "solid" => Some(FillMode::Solid),
        "wireframe" => Some(FillMode::Wireframe),
        _ => None,
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = r#"<shader name="world">
  <pass name="scene" vertex="vs_main" pixel="fs_main" cull="none" blend="alpha"/>
  <pass name="depth" vertex="vs_main" defines="DEPTH_ONLY;BIAS=2" depth_write="true"/>
</shader>
@vertex fn vs_main() -> @builtin(position) vec4<f32> { return vec4<f32>(0.0); }
"#;

    #[test]
    fn test_parse_header_and_source() {
        let parsed = parse_shader_source("world.wgsl", TEXT).unwrap();
        assert_eq!(parsed.name, "world");
        assert_eq!(parsed.passes.len(), 2);
        assert!(parsed.source.trim_start().starts_with("@vertex"));

        let scene = &parsed.passes[0];
        assert_eq!(scene.entry_point(ShaderStage::Vertex), Some("vs_main"));
        assert_eq!(scene.entry_point(ShaderStage::Pixel), Some("fs_main"));
        assert_eq!(scene.entry_point(ShaderStage::Compute), None);
        assert_eq!(scene.state.cull, CullMode::None);
        assert_eq!(scene.state.blend, BlendMode::AlphaBlend);

        let depth = &parsed.passes[1];
        assert_eq!(depth.entry_point(ShaderStage::Pixel), None);
        assert_eq!(depth.defines, vec!["DEPTH_ONLY".to_string(), "BIAS=2".to_string()]);
        assert_eq!(depth.state, PassState::default());
    }

    #[test]
    fn test_header_errors() {
        assert!(parse_shader_source("a", "fn main() {}").is_err());
        assert!(parse_shader_source("b", "<shader><pass name=\"p\"/></shader>").is_err());
        assert!(parse_shader_source("c", "<shader name=\"c\"></shader>").is_err());
        assert!(parse_shader_source(
            "d",
            "<shader name=\"d\"><pass name=\"p\" cull=\"sideways\"/></shader>"
        )
        .is_err());
        assert!(parse_shader_source(
            "e",
            "<shader name=\"e\"><pass name=\"p\"/><pass name=\"p\"/></shader>"
        )
        .is_err());
    }
}
