//! Helpers shared by the unit tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::context::FrameBindings;
use crate::gpu::GpuDevice;
use crate::shader::{NagaCompiler, ShaderCompiler, ShaderStage, StageOutput};
use crate::shader_cache::ShaderCache;

/// Compiler that counts its invocations.
#[derive(Debug, Default)]
pub struct CountingCompiler {
    inner: NagaCompiler,
    calls: AtomicUsize,
}

impl CountingCompiler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ShaderCompiler for CountingCompiler {
    fn compile_stage(
        &self,
        source: &str,
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<StageOutput, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.compile_stage(source, stage, entry_point)
    }
}

/// A path in the temp directory unique to this process and `name`.
pub fn temp_path(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("prism-{}-{n}-{name}", std::process::id()))
}

/// Compiles the embedded shaders, binds them to `device` and returns the
/// cache with bindings for the world, depth and sky passes.
pub fn bound_passes(device: &dyn GpuDevice) -> (ShaderCache, FrameBindings) {
    let mut cache = ShaderCache::new(Arc::new(NagaCompiler::new()));
    cache.init(device).unwrap();
    let world = cache.get("world").unwrap();
    let sky = cache.get("sky").unwrap();
    let frame = FrameBindings {
        world_pass: world.pass("scene").cloned(),
        depth_pass: world.pass("depth").cloned(),
        sky_pass: sky.pass("sky").cloned(),
        ..FrameBindings::default()
    };
    (cache, frame)
}
