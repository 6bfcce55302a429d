//! Start-up without a window.
//!
//! [`headless`] renders into an off-screen wgpu target. [`recording`] swaps
//! the GPU for the in-memory backend, which is what the integration tests
//! and GPU-less hosts use.

use std::sync::Arc;

use pollster::FutureExt;
use prism_core::RenderOptions;
use prism_render::{
    CommandLog, FrameOrchestrator, NagaCompiler, RecordingContext, ShaderCache, WgpuContext,
};

use crate::Result;

/// Creates an orchestrator rendering off-screen at `width` x `height`.
///
/// Frames are flushed instead of presented.
///
/// # Example
/// ```no_run
/// let renderer = prism::headless(800, 600, prism::RenderOptions::default()).unwrap();
/// assert!(!renderer.is_initialized());
/// ```
pub fn headless(width: u32, height: u32, options: RenderOptions) -> Result<FrameOrchestrator> {
    options.validate()?;
    let context = WgpuContext::new_headless(width, height).block_on()?;
    let shaders = ShaderCache::new(Arc::new(NagaCompiler::new()));
    log::info!("prism initialized (headless {width}x{height})");
    Ok(FrameOrchestrator::new(Box::new(context), options, shaders))
}

/// Creates an orchestrator over the recording backend.
///
/// The returned log sees every command the orchestrator submits.
pub fn recording(
    width: u32,
    height: u32,
    options: RenderOptions,
) -> Result<(FrameOrchestrator, CommandLog)> {
    options.validate()?;
    let context = RecordingContext::new(width, height);
    let log = context.log();
    let shaders = ShaderCache::new(Arc::new(NagaCompiler::new()));
    Ok((FrameOrchestrator::new(Box::new(context), options, shaders), log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::{PrismError, ShadowOptions};
    use prism_render::{Command, RenderError};

    #[test]
    fn test_recording_renders_empty_frame() {
        let (renderer, log) = recording(32, 32, RenderOptions::default()).unwrap();
        let report = renderer.render_frame().unwrap();
        assert_eq!(report.drawn, 0);
        assert!(renderer.is_initialized());
        assert!(log.draws().is_empty());
        assert!(!log.commands().contains(&Command::Present));
    }

    #[test]
    fn test_recording_rejects_invalid_shadow_options() {
        let options = RenderOptions {
            shadows: ShadowOptions {
                cascade_count: 0,
                ..ShadowOptions::default()
            },
            ..RenderOptions::default()
        };
        assert!(matches!(
            recording(32, 32, options),
            Err(RenderError::Core(PrismError::InvalidOption { name: "shadows.cascade_count", .. }))
        ));
    }
}
