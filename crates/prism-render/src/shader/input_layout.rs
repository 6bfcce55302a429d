//! Input layout derivation from reflected vertex-stage inputs.

use crate::error::{RenderError, RenderResult};
use crate::shader::compiler::{ComponentType, VertexInputParameter};

/// Per-vertex stream (geometry vertices).
pub const VERTEX_SLOT: u32 = 0;
/// Per-instance stream (instance records).
pub const INSTANCE_SLOT: u32 = 1;

/// Semantic prefix routing an input to [`INSTANCE_SLOT`].
pub const INSTANCE_SEMANTIC_PREFIX: &str = "I_";

/// Attribute formats an input layout can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
}

impl VertexFormat {
    /// Number of components.
    pub fn components(self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Sint32 => 1,
            VertexFormat::Float32x2 | VertexFormat::Uint32x2 | VertexFormat::Sint32x2 => 2,
            VertexFormat::Float32x3 | VertexFormat::Uint32x3 | VertexFormat::Sint32x3 => 3,
            VertexFormat::Float32x4 | VertexFormat::Uint32x4 | VertexFormat::Sint32x4 => 4,
        }
    }

    /// Size in bytes.
    pub fn size(self) -> u32 {
        self.components() * 4
    }
}

/// Chooses the attribute format for an input from its usage mask and
/// component type.
///
/// Masks 1, 2..=3, 4..=7 and 8..=15 select one to four components; any other
/// mask is rejected.
pub fn select_vertex_format(
    semantic: &str,
    mask: u8,
    component: ComponentType,
) -> RenderResult<VertexFormat> {
    let components = match mask {
        1 => 1,
        2..=3 => 2,
        4..=7 => 3,
        8..=15 => 4,
        _ => {
            return Err(RenderError::InvalidInputLayout {
                semantic: semantic.to_string(),
                mask,
            })
        }
    };
    let format = match (component, components) {
        (ComponentType::Float, 1) => VertexFormat::Float32,
        (ComponentType::Float, 2) => VertexFormat::Float32x2,
        (ComponentType::Float, 3) => VertexFormat::Float32x3,
        (ComponentType::Float, _) => VertexFormat::Float32x4,
        (ComponentType::Uint, 1) => VertexFormat::Uint32,
        (ComponentType::Uint, 2) => VertexFormat::Uint32x2,
        (ComponentType::Uint, 3) => VertexFormat::Uint32x3,
        (ComponentType::Uint, _) => VertexFormat::Uint32x4,
        (ComponentType::Sint, 1) => VertexFormat::Sint32,
        (ComponentType::Sint, 2) => VertexFormat::Sint32x2,
        (ComponentType::Sint, 3) => VertexFormat::Sint32x3,
        (ComponentType::Sint, _) => VertexFormat::Sint32x4,
    };
    Ok(format)
}

/// One attribute of an input layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputElement {
    pub semantic: String,
    pub location: u32,
    pub slot: u32,
    pub format: VertexFormat,
    /// Byte offset within the slot's record.
    pub offset: u32,
}

/// Vertex and instance attributes consumed by a vertex stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InputLayout {
    pub elements: Vec<InputElement>,
}

impl InputLayout {
    /// Builds a layout from reflected inputs.
    ///
    /// Inputs are packed in location order; each slot's offsets start at zero
    /// and advance by the attribute size, aligned to 4 bytes.
    pub fn from_inputs(inputs: &[VertexInputParameter]) -> RenderResult<Self> {
        let mut sorted: Vec<&VertexInputParameter> = inputs.iter().collect();
        sorted.sort_by_key(|input| input.location);

        let mut offsets = [0u32; 2];
        let mut elements = Vec::with_capacity(sorted.len());
        for input in sorted {
            let format = select_vertex_format(&input.semantic, input.mask, input.component)?;
            let slot = if input.semantic.starts_with(INSTANCE_SEMANTIC_PREFIX) {
                INSTANCE_SLOT
            } else {
                VERTEX_SLOT
            };
            let offset = &mut offsets[slot as usize];
            *offset = offset.next_multiple_of(4);
            elements.push(InputElement {
                semantic: input.semantic.clone(),
                location: input.location,
                slot,
                format,
                offset: *offset,
            });
            *offset += format.size();
        }
        Ok(Self { elements })
    }

    /// Elements fed from `slot`.
    pub fn slot_elements(&self, slot: u32) -> impl Iterator<Item = &InputElement> {
        self.elements.iter().filter(move |e| e.slot == slot)
    }

    /// Whether any element reads from `slot`.
    pub fn uses_slot(&self, slot: u32) -> bool {
        self.slot_elements(slot).next().is_some()
    }

    /// Bytes consumed per record of `slot`.
    pub fn slot_size(&self, slot: u32) -> u32 {
        self.slot_elements(slot)
            .map(|e| e.offset + e.format.size())
            .max()
            .unwrap_or(0)
    }
}
