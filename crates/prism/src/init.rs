//! Logging, configuration and windowed start-up.

use std::path::Path;
use std::sync::Arc;

use pollster::FutureExt;
use prism_core::RenderOptions;
use prism_render::{FrameOrchestrator, NagaCompiler, ShaderCache, WgpuContext};
use winit::window::Window;

use crate::Result;

/// Installs the `env_logger` backend, defaulting to `info`.
///
/// `RUST_LOG` overrides the filter. Calling this more than once is harmless.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Reads options from `path`, or returns the defaults when no path is given.
pub fn load_options(path: Option<&Path>) -> Result<RenderOptions> {
    match path {
        Some(path) => Ok(RenderOptions::load(path)?),
        None => Ok(RenderOptions::default()),
    }
}

/// Creates an orchestrator presenting to a window owned by the host.
///
/// Shaders are compiled (or loaded from the configured cache) on the first
/// rendered frame.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # fn run(window: Arc<winit::window::Window>) -> prism::Result<()> {
/// let renderer = prism::windowed(window, prism::RenderOptions::default())?;
/// let world = renderer.add_world("main");
/// renderer.with_world(world, |world| world.set_camera(Some(prism::Camera::new(1.0))));
/// renderer.render_frame()?;
/// # Ok(())
/// # }
/// ```
pub fn windowed(window: Arc<Window>, options: RenderOptions) -> Result<FrameOrchestrator> {
    options.validate()?;
    let context = WgpuContext::new_windowed(window, options.vsync).block_on()?;
    let shaders = ShaderCache::new(Arc::new(NagaCompiler::new()));
    log::info!("prism initialized (windowed)");
    Ok(FrameOrchestrator::new(Box::new(context), options, shaders))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_options_defaults_without_path() {
        assert_eq!(load_options(None).unwrap(), RenderOptions::default());
    }

    #[test]
    fn test_load_options_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("prism-missing-options.json");
        assert!(load_options(Some(&path)).is_err());
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
