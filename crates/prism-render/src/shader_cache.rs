//! Compile-once shader table with an on-disk cache.
//!
//! Cache file layout (integers little-endian, strings as `i32` byte length
//! followed by UTF-8):
//!
//! ```text
//! magic  "PRISMSC\x01"
//! entry* [i32 compressed_len][i32 raw_len][zlib bytes]
//! ```
//!
//! Each entry decompresses to `[string name][i32 pass_count][pass…][string source]`
//! where a pass is its name, five state bytes (blend, cull, fill, depth write,
//! depth test), its defines, four stages (entry point, empty when absent, and
//! SPIR-V bytes), its vertex inputs and its resource bindings.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use prism_core::RenderOptions;

use crate::error::{RenderError, RenderResult};
use crate::gpu::{BlendMode, CullMode, FillMode, GpuDevice};
use crate::shader::{
    parse_shader_source, ComponentType, GfxShader, PassRecord, PassState, ResourceBinding,
    ResourceKind, ShaderCompiler, ShaderPass, StageCode, VertexInputParameter,
};

/// First bytes of every cache file.
pub const CACHE_MAGIC: &[u8; 8] = b"PRISMSC\x01";

/// Shader sources compiled into the crate.
pub const EMBEDDED_SOURCES: [(&str, &str); 4] = [
    ("world.wgsl", include_str!("shaders/world.wgsl")),
    ("sky.wgsl", include_str!("shaders/sky.wgsl")),
    ("lighting.wgsl", include_str!("shaders/lighting.wgsl")),
    ("post.wgsl", include_str!("shaders/post.wgsl")),
];

/// Every shader the renderer uses, compiled once and indexed by name.
pub struct ShaderCache {
    compiler: Arc<dyn ShaderCompiler>,
    sources: Vec<(String, String)>,
    path: Option<PathBuf>,
    force_recompile: bool,
    shaders: HashMap<String, Arc<GfxShader>>,
}

impl ShaderCache {
    /// Creates a cache over the embedded sources.
    pub fn new(compiler: Arc<dyn ShaderCompiler>) -> Self {
        let sources = EMBEDDED_SOURCES
            .iter()
            .map(|(origin, text)| ((*origin).to_string(), (*text).to_string()))
            .collect();
        Self::with_sources(compiler, sources)
    }

    /// Creates a cache over host-supplied `(origin, text)` sources.
    pub fn with_sources(compiler: Arc<dyn ShaderCompiler>, sources: Vec<(String, String)>) -> Self {
        Self {
            compiler,
            sources,
            path: None,
            force_recompile: false,
            shaders: HashMap::new(),
        }
    }

    /// Sets the cache file. `None` disables the cache.
    #[must_use]
    pub fn with_path(mut self, path: Option<PathBuf>) -> Self {
        self.path = path;
        self
    }

    /// Ignores an existing cache file when set.
    #[must_use]
    pub fn with_force_recompile(mut self, force: bool) -> Self {
        self.force_recompile = force;
        self
    }

    /// Applies the cache settings of `options`.
    #[must_use]
    pub fn configured(self, options: &RenderOptions) -> Self {
        self.with_path(options.shader_cache_path.clone())
            .with_force_recompile(options.force_recompile)
    }

    /// The configured cache file, cleared after a failed write.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Loads the cache file when one is configured, exists and recompilation
    /// is not forced; otherwise compiles every source and writes the cache.
    ///
    /// An unusable cache file is logged and replaced.
    pub fn init(&mut self, device: &dyn GpuDevice) -> RenderResult<()> {
        if let Some(path) = self.path.clone() {
            if !self.force_recompile && path.exists() {
                match self.load_all(&path, device) {
                    Ok(()) => {
                        log::info!(
                            "loaded {} shaders from cache {}",
                            self.shaders.len(),
                            path.display()
                        );
                        return Ok(());
                    }
                    Err(err) => {
                        log::warn!(
                            "shader cache {} is unusable ({err}); recompiling",
                            path.display()
                        );
                    }
                }
            }
        }

        self.compile_all()?;
        self.bind_to_device(device)?;
        if let Some(path) = self.path.clone() {
            self.save_all(&path);
        }
        Ok(())
    }

    /// Compiles every source, replacing the table.
    pub fn compile_all(&mut self) -> RenderResult<()> {
        let mut shaders = HashMap::with_capacity(self.sources.len());
        for (origin, text) in &self.sources {
            let source = parse_shader_source(origin, text)?;
            let shader = GfxShader::compile(&source, self.compiler.as_ref())?;
            shaders.insert(shader.name().to_string(), Arc::new(shader));
        }
        log::info!("compiled {} shaders", shaders.len());
        self.shaders = shaders;
        Ok(())
    }

    /// Writes the table to `path`. On failure the path is forgotten so later
    /// runs recompile instead of reading a partial file.
    pub fn save_all(&mut self, path: &Path) {
        let result = std::fs::File::create(path)
            .map_err(RenderError::from)
            .and_then(|file| self.write_to(std::io::BufWriter::new(file)));
        match result {
            Ok(()) => log::debug!("wrote shader cache {}", path.display()),
            Err(err) => {
                log::warn!("failed to write shader cache {}: {err}", path.display());
                self.path = None;
            }
        }
    }

    /// Serializes the table in cache format.
    pub fn write_to(&self, mut writer: impl Write) -> RenderResult<()> {
        writer.write_all(CACHE_MAGIC)?;
        let mut names: Vec<&String> = self.shaders.keys().collect();
        names.sort();
        for name in names {
            let payload = encode_shader(&self.shaders[name]);
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&payload)?;
            let compressed = encoder.finish()?;
            write_len(&mut writer, compressed.len())?;
            write_len(&mut writer, payload.len())?;
            writer.write_all(&compressed)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Replaces the table with the contents of `path` and binds every pass.
    ///
    /// Fails with [`RenderError::ShaderCacheCorrupt`] on a magic mismatch or a
    /// malformed entry; the table is left untouched then.
    pub fn load_all(&mut self, path: &Path, device: &dyn GpuDevice) -> RenderResult<()> {
        let bytes = std::fs::read(path)?;
        let shaders = read_cache(&bytes)?;
        for shader in &shaders {
            shader.bind_to_device(device)?;
        }
        self.shaders = shaders
            .into_iter()
            .map(|s| (s.name().to_string(), Arc::new(s)))
            .collect();
        Ok(())
    }

    /// Creates stage objects for every shader.
    pub fn bind_to_device(&self, device: &dyn GpuDevice) -> RenderResult<()> {
        for shader in self.shaders.values() {
            shader.bind_to_device(device)?;
        }
        Ok(())
    }

    /// Shader named `name`. Absence is not an error; callers skip the feature.
    pub fn get(&self, name: &str) -> Option<Arc<GfxShader>> {
        self.shaders.get(name).cloned()
    }

    /// Names of all shaders, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.shaders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    /// Destroys every stage object.
    pub fn release(&self, device: &dyn GpuDevice) {
        for shader in self.shaders.values() {
            shader.release(device);
        }
    }
}

/// Parses a whole cache file.
pub fn read_cache(bytes: &[u8]) -> RenderResult<Vec<GfxShader>> {
    let body = bytes
        .strip_prefix(CACHE_MAGIC.as_slice())
        .ok_or_else(|| corrupt("magic header mismatch"))?;
    let mut reader = Reader::new(body);
    let mut shaders = Vec::new();
    while !reader.is_empty() {
        let compressed_len = reader.len()?;
        let raw_len = reader.len()?;
        let compressed = reader.bytes(compressed_len)?;

        let mut payload = Vec::with_capacity(raw_len);
        ZlibDecoder::new(compressed)
            .read_to_end(&mut payload)
            .map_err(|e| corrupt(&format!("entry {}: {e}", shaders.len())))?;
        if payload.len() != raw_len {
            return Err(corrupt(&format!(
                "entry {}: {} bytes decompressed, {raw_len} expected",
                shaders.len(),
                payload.len()
            )));
        }
        shaders.push(decode_shader(&payload)?);
    }
    Ok(shaders)
}

fn corrupt(reason: &str) -> RenderError {
    RenderError::ShaderCacheCorrupt(reason.to_string())
}

fn write_len(writer: &mut impl Write, len: usize) -> RenderResult<()> {
    let len = i32::try_from(len).map_err(|_| corrupt("length exceeds i32"))?;
    writer.write_all(&len.to_le_bytes())?;
    Ok(())
}

fn encode_shader(shader: &GfxShader) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, shader.name());
    put_i32(&mut out, shader.passes().len());
    for pass in shader.passes() {
        encode_pass(&mut out, &pass.save());
    }
    put_string(&mut out, shader.source());
    out
}

fn encode_pass(out: &mut Vec<u8>, record: &PassRecord) {
    put_string(out, &record.name);
    let state = record.state;
    out.extend_from_slice(&[
        blend_code(state.blend),
        cull_code(state.cull),
        fill_code(state.fill),
        u8::from(state.depth_write),
        u8::from(state.depth_test),
    ]);
    put_i32(out, record.defines.len());
    for define in &record.defines {
        put_string(out, define);
    }
    for stage in &record.stages {
        match stage {
            Some(code) => {
                put_string(out, &code.entry_point);
                let bytes: &[u8] = bytemuck::cast_slice(&code.words);
                put_i32(out, bytes.len());
                out.extend_from_slice(bytes);
            }
            None => {
                put_string(out, "");
                put_i32(out, 0);
            }
        }
    }
    put_i32(out, record.inputs.len());
    for input in &record.inputs {
        put_string(out, &input.semantic);
        put_i32(out, input.location as usize);
        out.push(component_code(input.component));
        out.push(input.mask);
    }
    put_i32(out, record.resources.len());
    for resource in &record.resources {
        put_i32(out, resource.group as usize);
        put_i32(out, resource.binding as usize);
        out.push(resource_code(resource.kind));
    }
}

fn decode_shader(payload: &[u8]) -> RenderResult<GfxShader> {
    let mut reader = Reader::new(payload);
    let name = reader.string()?;
    let pass_count = reader.len()?;
    let mut passes = Vec::with_capacity(pass_count.min(64));
    for _ in 0..pass_count {
        let record = decode_pass(&mut reader)?;
        passes.push(ShaderPass::load(&name, record)?);
    }
    let source = reader.string()?;
    if !reader.is_empty() {
        return Err(corrupt(&format!("trailing bytes after shader '{name}'")));
    }
    Ok(GfxShader::new(name, passes, source))
}

fn decode_pass(reader: &mut Reader<'_>) -> RenderResult<PassRecord> {
    let name = reader.string()?;
    let state = PassState {
        blend: blend_from(reader.u8()?)?,
        cull: cull_from(reader.u8()?)?,
        fill: fill_from(reader.u8()?)?,
        depth_write: reader.u8()? != 0,
        depth_test: reader.u8()? != 0,
    };

    let define_count = reader.len()?;
    let defines = (0..define_count)
        .map(|_| reader.string())
        .collect::<RenderResult<Vec<_>>>()?;

    let mut stages: [Option<StageCode>; 4] = Default::default();
    for stage in &mut stages {
        let entry_point = reader.string()?;
        let byte_len = reader.len()?;
        let bytes = reader.bytes(byte_len)?;
        if byte_len % 4 != 0 {
            return Err(corrupt(&format!("pass '{name}': bytecode is not whole words")));
        }
        if !entry_point.is_empty() {
            let words = bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            *stage = Some(StageCode { entry_point, words });
        }
    }

    let input_count = reader.len()?;
    let mut inputs = Vec::with_capacity(input_count.min(64));
    for _ in 0..input_count {
        inputs.push(VertexInputParameter {
            semantic: reader.string()?,
            location: reader.u32()?,
            component: component_from(reader.u8()?)?,
            mask: reader.u8()?,
        });
    }

    let resource_count = reader.len()?;
    let mut resources = Vec::with_capacity(resource_count.min(64));
    for _ in 0..resource_count {
        resources.push(ResourceBinding {
            group: reader.u32()?,
            binding: reader.u32()?,
            kind: resource_from(reader.u8()?)?,
        });
    }

    Ok(PassRecord {
        name,
        state,
        defines,
        stages,
        inputs,
        resources,
    })
}

fn put_i32(out: &mut Vec<u8>, value: usize) {
    // Every length written here is bounded by an in-memory shader.
    let value = i32::try_from(value).unwrap_or(i32::MAX);
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    put_i32(out, value.len());
    out.extend_from_slice(value.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn is_empty(&self) -> bool {
        self.position >= self.bytes.len()
    }

    fn bytes(&mut self, len: usize) -> RenderResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                corrupt(&format!(
                    "unexpected end of data reading {len} bytes at offset {}",
                    self.position
                ))
            })?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn u8(&mut self) -> RenderResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn i32(&mut self) -> RenderResult<i32> {
        let b = self.bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// A non-negative `i32` length.
    fn len(&mut self) -> RenderResult<usize> {
        let value = self.i32()?;
        usize::try_from(value).map_err(|_| corrupt(&format!("negative length {value}")))
    }

    fn u32(&mut self) -> RenderResult<u32> {
        let value = self.i32()?;
        u32::try_from(value).map_err(|_| corrupt(&format!("negative value {value}")))
    }

    fn string(&mut self) -> RenderResult<String> {
        let len = self.len()?;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| corrupt(&e.to_string()))
    }
}

fn blend_code(mode: BlendMode) -> u8 {
    match mode {
        BlendMode::Opaque => 0,
        BlendMode::AlphaBlend => 1,
        BlendMode::Additive => 2,
        BlendMode::Modulate => 3,
    }
}

fn blend_from(code: u8) -> RenderResult<BlendMode> {
    match code {
        0 => Ok(BlendMode::Opaque),
        1 => Ok(BlendMode::AlphaBlend),
        2 => Ok(BlendMode::Additive),
        3 => Ok(BlendMode::Modulate),
        _ => Err(corrupt(&format!("blend mode {code}"))),
    }
}

fn cull_code(mode: CullMode) -> u8 {
    match mode {
        CullMode::None => 0,
        CullMode::Front => 1,
        CullMode::Back => 2,
    }
}

fn cull_from(code: u8) -> RenderResult<CullMode> {
    match code {
        0 => Ok(CullMode::None),
        1 => Ok(CullMode::Front),
        2 => Ok(CullMode::Back),
        _ => Err(corrupt(&format!("cull mode {code}"))),
    }
}

fn fill_code(mode: FillMode) -> u8 {
    match mode {
        FillMode::Solid => 0,
        FillMode::Wireframe => 1,
    }
}

fn fill_from(code: u8) -> RenderResult<FillMode> {
    match code {
        0 => Ok(FillMode::Solid),
        1 => Ok(FillMode::Wireframe),
        _ => Err(corrupt(&format!("fill mode {code}"))),
    }
}

fn component_code(component: ComponentType) -> u8 {
    match component {
        ComponentType::Float => 0,
        ComponentType::Uint => 1,
        ComponentType::Sint => 2,
    }
}

fn component_from(code: u8) -> RenderResult<ComponentType> {
    match code {
        0 => Ok(ComponentType::Float),
        1 => Ok(ComponentType::Uint),
        2 => Ok(ComponentType::Sint),
        _ => Err(corrupt(&format!("component type {code}"))),
    }
}

fn resource_code(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::UniformBuffer => 0,
        ResourceKind::DepthTexture => 1,
        ResourceKind::Texture => 2,
        ResourceKind::Sampler => 3,
        ResourceKind::ComparisonSampler => 4,
    }
}

fn resource_from(code: u8) -> RenderResult<ResourceKind> {
    match code {
        0 => Ok(ResourceKind::UniformBuffer),
        1 => Ok(ResourceKind::DepthTexture),
        2 => Ok(ResourceKind::Texture),
        3 => Ok(ResourceKind::Sampler),
        4 => Ok(ResourceKind::ComparisonSampler),
        _ => Err(corrupt(&format!("resource kind {code}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingDevice;
    use crate::shader::NagaCompiler;
    use crate::test_support::{temp_path, CountingCompiler};

    fn compiled_cache() -> ShaderCache {
        let mut cache = ShaderCache::new(Arc::new(NagaCompiler::new()));
        cache.compile_all().unwrap();
        cache
    }

    #[test]
    fn test_embedded_sources_compile() {
        let cache = compiled_cache();
        assert_eq!(cache.names(), vec!["lighting", "post", "sky", "world"]);
        let world = cache.get("world").unwrap();
        assert!(world.pass("scene").is_some());
        assert!(world.pass("depth").is_some());
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_write_read_round_trip() {
        let cache = compiled_cache();
        let mut bytes = Vec::new();
        cache.write_to(&mut bytes).unwrap();
        assert!(bytes.starts_with(CACHE_MAGIC));

        let loaded = read_cache(&bytes).unwrap();
        assert_eq!(loaded.len(), cache.len());
        for shader in &loaded {
            let original = cache.get(shader.name()).unwrap();
            assert_eq!(shader.source(), original.source());
            assert_eq!(shader.passes().len(), original.passes().len());
            for (a, b) in shader.passes().iter().zip(original.passes()) {
                assert_eq!(a.save(), b.save());
            }
        }
    }

    #[test]
    fn test_magic_mismatch_is_corrupt() {
        let err = read_cache(b"NOTACACHE").unwrap_err();
        assert!(matches!(err, RenderError::ShaderCacheCorrupt(_)));
    }

    #[test]
    fn test_truncated_entry_is_corrupt() {
        let cache = compiled_cache();
        let mut bytes = Vec::new();
        cache.write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            read_cache(&bytes),
            Err(RenderError::ShaderCacheCorrupt(_))
        ));
    }

    #[test]
    fn test_init_falls_back_when_cache_is_corrupt() {
        let path = temp_path("corrupt-cache.bin");
        std::fs::write(&path, b"garbage").unwrap();

        let compiler = Arc::new(CountingCompiler::default());
        let device = RecordingDevice::new();
        let mut cache = ShaderCache::new(compiler.clone()).with_path(Some(path.clone()));
        cache.init(&device).unwrap();

        assert!(compiler.calls() > 0);
        assert_eq!(cache.len(), EMBEDDED_SOURCES.len());
        let rewritten = std::fs::read(&path).unwrap();
        assert!(rewritten.starts_with(CACHE_MAGIC));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_write_failure_clears_path() {
        let path = temp_path("missing-dir").join("cache.bin");
        let device = RecordingDevice::new();
        let mut cache =
            ShaderCache::new(Arc::new(NagaCompiler::new())).with_path(Some(path));
        cache.init(&device).unwrap();
        assert!(cache.path().is_none());
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_force_recompile_ignores_cache() {
        let path = temp_path("forced-cache.bin");
        let device = RecordingDevice::new();
        let mut first = ShaderCache::new(Arc::new(NagaCompiler::new())).with_path(Some(path.clone()));
        first.init(&device).unwrap();

        let compiler = Arc::new(CountingCompiler::default());
        let mut second = ShaderCache::new(compiler.clone())
            .with_path(Some(path.clone()))
            .with_force_recompile(true);
        second.init(&device).unwrap();
        assert!(compiler.calls() > 0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_release_destroys_stages() {
        let device = RecordingDevice::new();
        let mut cache = ShaderCache::new(Arc::new(NagaCompiler::new()));
        cache.init(&device).unwrap();
        assert!(device.live_stages() > 0);
        cache.release(&device);
        assert_eq!(device.live_stages(), 0);
    }
}
