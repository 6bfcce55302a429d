//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use prism::{NagaCompiler, ShaderCompiler};
use prism_render::shader::{ShaderStage, StageOutput};

/// Compiler that counts stage compilations.
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

/// Fresh path in the temp directory; removed when dropped.
pub struct TempFile(pub PathBuf);

impl TempFile {
    pub fn new(name: &str) -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(std::env::temp_dir().join(format!("prism-it-{}-{n}-{name}", std::process::id())))
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
