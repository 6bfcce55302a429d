//! Configuration options for the renderer.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PrismError, Result};
use crate::pass_flags::PassFlags;

/// Maximum number of shadow cascades.
pub const MAX_CASCADES: usize = 4;

/// Global configuration options for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Location of the compiled shader cache. `None` disables the cache.
    pub shader_cache_path: Option<PathBuf>,

    /// Ignore an existing cache file and recompile every shader.
    pub force_recompile: bool,

    /// Passes run for every camera unless a world overrides them.
    pub passes: PassFlags,

    /// Shadow configuration.
    pub shadows: ShadowOptions,

    /// Backbuffer clear colour (linear RGBA).
    pub clear_colour: [f32; 4],

    /// Whether presentation waits for vertical sync.
    pub vsync: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            shader_cache_path: None,
            force_recompile: false,
            passes: PassFlags::default(),
            shadows: ShadowOptions::default(),
            clear_colour: [0.0, 0.0, 0.0, 1.0],
            vsync: true,
        }
    }
}

impl RenderOptions {
    /// Reads options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let options: Self = serde_json::from_str(&text)?;
        options.validate()?;
        log::debug!("loaded render options from {}", path.as_ref().display());
        Ok(options)
    }

    /// Writes options to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        self.shadows.validate()
    }
}

/// How the view frustum is divided between shadow cascades.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CascadePartition {
    /// Fixed fractions of the near/far range, one per cascade.
    Manual { fractions: [f32; MAX_CASCADES] },
    /// Pure logarithmic distribution.
    Logarithmic,
    /// Blend of uniform and logarithmic splits (practical split scheme).
    ParallelSplit { lambda: f32 },
}

impl Default for CascadePartition {
    fn default() -> Self {
        Self::ParallelSplit { lambda: 0.75 }
    }
}

impl CascadePartition {
    /// Weight of the logarithmic term when blending with uniform splits.
    #[must_use]
    pub fn lambda(&self) -> Option<f32> {
        match self {
            Self::Manual { .. } => None,
            Self::Logarithmic => Some(1.0),
            Self::ParallelSplit { lambda } => Some(lambda.clamp(0.0, 1.0)),
        }
    }
}

/// Shadow configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowOptions {
    /// Whether cascaded shadows are rendered.
    pub enabled: bool,
    /// Number of cascades (1..=4).
    pub cascade_count: usize,
    /// Width and height of each cascade slice in texels.
    pub map_size: u32,
    /// Split distribution.
    pub partition: CascadePartition,
    /// Use filterable (variance) shadow maps. Not supported yet.
    pub filterable: bool,
    /// Depth bias applied by receivers.
    pub depth_bias: f32,
    /// Extra depth range in front of each cascade for casters outside the view.
    pub caster_extension: f32,
}

impl Default for ShadowOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            cascade_count: MAX_CASCADES,
            map_size: 2048,
            partition: CascadePartition::default(),
            filterable: false,
            depth_bias: 0.002,
            caster_extension: 50.0,
        }
    }
}

impl ShadowOptions {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.cascade_count == 0 || self.cascade_count > MAX_CASCADES {
            return Err(PrismError::InvalidOption {
                name: "shadows.cascade_count",
                reason: format!("{} is outside 1..={MAX_CASCADES}", self.cascade_count),
            });
        }
        if !self.map_size.is_power_of_two() || self.map_size < 16 {
            return Err(PrismError::InvalidOption {
                name: "shadows.map_size",
                reason: format!("{} is not a power of two >= 16", self.map_size),
            });
        }
        if let CascadePartition::Manual { fractions } = self.partition {
            if fractions.iter().any(|f| !(0.0..=1.0).contains(f)) {
                return Err(PrismError::InvalidOption {
                    name: "shadows.partition.fractions",
                    reason: format!("{fractions:?} must lie within 0..=1"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = RenderOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.shadows.cascade_count, 4);
        assert!(options.shader_cache_path.is_none());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options: RenderOptions = serde_json::from_str(
            r#"{ "force_recompile": true, "shadows": { "partition": { "mode": "logarithmic" } } }"#,
        )
        .unwrap();
        assert!(options.force_recompile);
        assert_eq!(options.shadows.partition, CascadePartition::Logarithmic);
        assert_eq!(options.shadows.map_size, 2048);
    }

    #[test]
    fn test_rejects_bad_cascade_count() {
        let mut options = ShadowOptions::default();
        options.cascade_count = 5;
        assert!(options.validate().is_err());
        options.cascade_count = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_rejects_manual_fraction_out_of_range() {
        let options = ShadowOptions {
            partition: CascadePartition::Manual {
                fractions: [0.1, 0.3, 1.5, 1.0],
            },
            ..ShadowOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_lambda() {
        assert_eq!(CascadePartition::Logarithmic.lambda(), Some(1.0));
        assert_eq!(
            CascadePartition::ParallelSplit { lambda: 2.0 }.lambda(),
            Some(1.0)
        );
        assert_eq!(
            CascadePartition::Manual { fractions: [0.25; 4] }.lambda(),
            None
        );
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("prism-options-{}.json", std::process::id()));
        let mut options = RenderOptions::default();
        options.shader_cache_path = Some(PathBuf::from("shaders.bin"));
        options.passes = PassFlags::SCENE;
        options.save(&path).unwrap();

        let loaded = RenderOptions::load(&path).unwrap();
        assert_eq!(loaded, options);
        let _ = std::fs::remove_file(path);
    }
}
