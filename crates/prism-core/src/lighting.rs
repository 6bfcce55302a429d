//! Per-world lighting settings.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Sun, ambient, sky and haze parameters for one world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingSettings {
    /// Direction the sunlight travels (from the sun towards the scene).
    pub sun_direction: Vec3,
    /// Sun colour (linear RGB).
    pub sun_colour: Vec3,
    /// Sun intensity multiplier.
    pub sun_intensity: f32,
    /// Ambient colour (linear RGB).
    pub ambient: Vec3,
    /// Sky colour straight up.
    pub sky_zenith: Vec3,
    /// Sky colour at the horizon.
    pub sky_horizon: Vec3,
    /// Haze colour blended in with distance.
    pub haze_colour: Vec3,
    /// Haze density per world unit. Zero disables haze.
    pub haze_density: f32,
}

impl Default for LightingSettings {
    fn default() -> Self {
        Self {
            sun_direction: Vec3::new(-0.4, -1.0, -0.3),
            sun_colour: Vec3::new(1.0, 0.95, 0.85),
            sun_intensity: 1.0,
            ambient: Vec3::splat(0.25),
            sky_zenith: Vec3::new(0.25, 0.45, 0.85),
            sky_horizon: Vec3::new(0.75, 0.85, 0.95),
            haze_colour: Vec3::new(0.75, 0.8, 0.9),
            haze_density: 0.002,
        }
    }
}

impl LightingSettings {
    /// Normalised sun direction, falling back to straight down.
    #[must_use]
    pub fn light_direction(&self) -> Vec3 {
        self.sun_direction.try_normalize().unwrap_or(Vec3::NEG_Y)
    }
}
