//! Material definitions.
//!
//! A material selects a shader variant and carries the flat shading data the
//! world pass needs. Render objects compare materials by identity (the `Arc`
//! they are shared through), so two materials with equal fields are still
//! batched separately.

use serde::{Deserialize, Serialize};

/// Shader variant selected by a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ShaderVariant {
    /// Lit by the sun, ambient term and cascaded shadows.
    #[default]
    Lit,
    /// Unlit; colour is written as-is.
    Flat,
    /// Lit, with the colour added on top as emission.
    Emissive,
}

impl ShaderVariant {
    /// Index passed to shaders in the instance record's high bits.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            ShaderVariant::Lit => 0,
            ShaderVariant::Flat => 1,
            ShaderVariant::Emissive => 2,
        }
    }
}

/// A material definition for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    /// Material name.
    pub name: String,
    /// Base colour (linear RGBA).
    pub colour: [f32; 4],
    /// Index into the material table, forwarded to shaders per instance.
    pub index: u32,
    /// Shader variant.
    pub variant: ShaderVariant,
}

impl Material {
    /// Creates a new lit white material.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            colour: [1.0, 1.0, 1.0, 1.0],
            index: 0,
            variant: ShaderVariant::Lit,
        }
    }

    /// Creates an unlit material.
    pub fn flat(name: impl Into<String>, colour: [f32; 4]) -> Self {
        Self {
            colour,
            variant: ShaderVariant::Flat,
            ..Self::new(name)
        }
    }

    /// Sets the base colour.
    #[must_use]
    pub fn with_colour(mut self, colour: [f32; 4]) -> Self {
        self.colour = colour;
        self
    }

    /// Sets the material table index.
    #[must_use]
    pub fn with_index(mut self, index: u32) -> Self {
        self.index = index;
        self
    }

    /// Sets the shader variant.
    #[must_use]
    pub fn with_variant(mut self, variant: ShaderVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Value written into the instance record: table index in the low 24 bits,
    /// variant code in the high 8.
    #[must_use]
    pub fn packed_index(&self) -> u32 {
        (self.index & 0x00FF_FFFF) | (self.variant.code() << 24)
    }

    /// Default material for primitive shapes.
    pub fn primitive() -> Self {
        Self::new("primitive")
    }
}

impl Default for Material {
    fn default() -> Self {
        Self::new("default")
    }
}
