//! Shader cache persistence across renderer instances.

mod common;

use std::sync::Arc;

use common::{CountingCompiler, TempFile};
use prism::*;
use prism_render::shader::PassRecord;

fn pass_records(cache: &ShaderCache) -> Vec<(String, Vec<PassRecord>)> {
    cache
        .names()
        .into_iter()
        .map(|name| {
            let shader = cache.get(name).unwrap();
            let records = shader.passes().iter().map(|pass| pass.save()).collect();
            (name.to_string(), records)
        })
        .collect()
}

#[test]
fn test_second_start_loads_without_compiling() {
    let file = TempFile::new("shaders.bin");
    let device = RecordingDevice::new();

    let first_compiler = Arc::new(CountingCompiler::default());
    let mut first = ShaderCache::new(first_compiler.clone()).with_path(Some(file.0.clone()));
    first.init(&device).unwrap();
    assert!(first_compiler.calls() > 0);

    let bytes = std::fs::read(&file.0).unwrap();
    assert!(bytes.starts_with(CACHE_MAGIC));

    let second_compiler = Arc::new(CountingCompiler::default());
    let mut second = ShaderCache::new(second_compiler.clone()).with_path(Some(file.0.clone()));
    second.init(&device).unwrap();
    assert_eq!(second_compiler.calls(), 0);

    assert_eq!(first.names(), second.names());
    assert_eq!(pass_records(&first), pass_records(&second));
}

#[test]
fn test_force_recompile_ignores_cache() {
    let file = TempFile::new("forced.bin");
    let device = RecordingDevice::new();
    ShaderCache::new(Arc::new(NagaCompiler::new()))
        .with_path(Some(file.0.clone()))
        .init(&device)
        .unwrap();

    let compiler = Arc::new(CountingCompiler::default());
    let mut cache = ShaderCache::new(compiler.clone())
        .with_path(Some(file.0.clone()))
        .with_force_recompile(true);
    cache.init(&device).unwrap();
    assert!(compiler.calls() > 0);
}

#[test]
fn test_corrupt_cache_is_replaced() {
    let file = TempFile::new("corrupt.bin");
    std::fs::write(&file.0, b"not a shader cache").unwrap();
    let device = RecordingDevice::new();

    let compiler = Arc::new(CountingCompiler::default());
    let mut cache = ShaderCache::new(compiler.clone()).with_path(Some(file.0.clone()));
    cache.init(&device).unwrap();
    assert!(compiler.calls() > 0);
    assert!(std::fs::read(&file.0).unwrap().starts_with(CACHE_MAGIC));
}

#[test]
fn test_orchestrators_share_cache_file() {
    let file = TempFile::new("frames.bin");
    let options = RenderOptions {
        shader_cache_path: Some(file.0.clone()),
        passes: PassFlags::SCENE,
        ..RenderOptions::default()
    };

    let (first, _) = recording(32, 32, options.clone()).unwrap();
    first.render_frame().unwrap();
    first.shutdown();

    let compiler = Arc::new(CountingCompiler::default());
    let second = FrameOrchestrator::new(
        Box::new(RecordingContext::new(32, 32)),
        options,
        ShaderCache::new(compiler.clone()),
    );
    second.render_frame().unwrap();
    assert!(second.is_initialized());
    assert_eq!(compiler.calls(), 0);
    assert!(second.with_shaders(|shaders| shaders.get("world").is_some()));
}
