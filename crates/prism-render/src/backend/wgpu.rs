//! wgpu backend.
//!
//! [`WgpuContext`] records commands as they arrive and resolves each draw to
//! a pipeline, bind groups and buffers immediately. Nothing reaches the GPU
//! until [`CommandContext::present`] or [`CommandContext::flush`], which
//! encode the recorded steps in order. Render passes are split wherever the
//! target changes, a clear follows a draw, or a buffer is written; writes
//! become staging copies so a constant buffer rewritten between draws (one
//! per shadow cascade) is seen with the right contents by each draw.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use prism_core::PrimitiveTopology;
use wgpu::util::DeviceExt;
use winit::window::Window;

use crate::error::{RenderError, RenderResult};
use crate::gpu::{
    BlendMode, BufferDescriptor, BufferId, BufferUsage, CommandContext, CullMode, DepthState,
    DepthTargetId, FillMode, GpuDevice, HandleAllocator, PassId, ProgramBinding, RasterizerState,
    RenderTarget, ShaderStage, StageId,
};
use crate::shader::{ResourceKind, VertexFormat, INSTANCE_SLOT, VERTEX_SLOT};
use crate::sync::lock;

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const HEADLESS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Layered depth texture with one view per layer.
#[derive(Debug)]
pub(crate) struct DepthArray {
    _texture: wgpu::Texture,
    array_view: wgpu::TextureView,
    layer_views: Vec<wgpu::TextureView>,
}

/// wgpu device and queue plus the resources created through [`GpuDevice`].
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    handles: HandleAllocator,
    buffers: Mutex<HashMap<BufferId, Arc<wgpu::Buffer>>>,
    stages: Mutex<HashMap<StageId, Arc<wgpu::ShaderModule>>>,
    depth_arrays: Mutex<HashMap<DepthTargetId, Arc<DepthArray>>>,
}

impl WgpuDevice {
    fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            handles: HandleAllocator::new(),
            buffers: Mutex::new(HashMap::new()),
            stages: Mutex::new(HashMap::new()),
            depth_arrays: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying wgpu device.
    pub fn raw(&self) -> &wgpu::Device {
        &self.device
    }

    /// The queue work is submitted to.
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn buffer(&self, id: BufferId) -> RenderResult<Arc<wgpu::Buffer>> {
        lock(&self.buffers)
            .get(&id)
            .cloned()
            .ok_or(RenderError::UnknownResource {
                kind: BufferId::KIND,
                id: id.0,
            })
    }

    fn stage(&self, id: StageId) -> RenderResult<Arc<wgpu::ShaderModule>> {
        lock(&self.stages)
            .get(&id)
            .cloned()
            .ok_or(RenderError::UnknownResource {
                kind: StageId::KIND,
                id: id.0,
            })
    }

    fn depth_array(&self, id: DepthTargetId) -> RenderResult<Arc<DepthArray>> {
        lock(&self.depth_arrays)
            .get(&id)
            .cloned()
            .ok_or(RenderError::UnknownResource {
                kind: DepthTargetId::KIND,
                id: id.0,
            })
    }

    /// Runs `create` inside an error scope so validation failures come back
    /// as errors instead of reaching the uncaptured-error handler.
    fn scoped<T>(
        &self,
        filter: wgpu::ErrorFilter,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> Result<T, wgpu::Error> {
        self.device.push_error_scope(filter);
        let value = create(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }
}

impl GpuDevice for WgpuDevice {
    fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> RenderResult<BufferId> {
        let usage = match desc.usage {
            BufferUsage::Vertex => wgpu::BufferUsages::VERTEX,
            BufferUsage::Index => wgpu::BufferUsages::INDEX,
            BufferUsage::Constant => wgpu::BufferUsages::UNIFORM,
        } | wgpu::BufferUsages::COPY_DST;
        let size = desc.size.max(4).next_multiple_of(4);

        let buffer = self
            .scoped(wgpu::ErrorFilter::OutOfMemory, |device| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(desc.label),
                    size,
                    usage,
                    mapped_at_creation: false,
                })
            })
            .map_err(|err| {
                RenderError::BufferCreationFailed(format!(
                    "'{}' ({} bytes): {err}",
                    desc.label, desc.size
                ))
            })?;

        let id = BufferId(self.handles.next());
        lock(&self.buffers).insert(id, Arc::new(buffer));
        Ok(id)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        lock(&self.buffers).remove(&buffer);
    }

    fn create_shader_stage(
        &self,
        stage: ShaderStage,
        words: &[u32],
        label: &str,
    ) -> RenderResult<StageId> {
        if stage == ShaderStage::Geometry {
            return Err(RenderError::NotSupported("geometry shader stages"));
        }
        let module = self
            .scoped(wgpu::ErrorFilter::Validation, |device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(label),
                    source: wgpu::ShaderSource::SpirV(Cow::Borrowed(words)),
                })
            })
            .map_err(|err| RenderError::PipelineCreationFailed {
                label: format!("{label} ({stage:?})"),
                message: err.to_string(),
            })?;

        let id = StageId(self.handles.next());
        lock(&self.stages).insert(id, Arc::new(module));
        Ok(id)
    }

    fn destroy_shader_stage(&self, stage: StageId) {
        lock(&self.stages).remove(&stage);
    }

    fn create_depth_array(
        &self,
        size: u32,
        layers: u32,
        label: &str,
    ) -> RenderResult<DepthTargetId> {
        let layers = layers.max(1);
        let texture = self
            .scoped(wgpu::ErrorFilter::OutOfMemory, |device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(label),
                    size: wgpu::Extent3d {
                        width: size.max(1),
                        height: size.max(1),
                        depth_or_array_layers: layers,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: DEPTH_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                })
            })
            .map_err(|err| {
                RenderError::BufferCreationFailed(format!("depth array '{label}': {err}"))
            })?;

        let array = DepthArray {
            array_view: texture.create_view(&wgpu::TextureViewDescriptor {
                label: Some(label),
                dimension: Some(wgpu::TextureViewDimension::D2Array),
                ..Default::default()
            }),
            layer_views: (0..layers)
                .map(|layer| {
                    texture.create_view(&wgpu::TextureViewDescriptor {
                        label: Some(label),
                        dimension: Some(wgpu::TextureViewDimension::D2),
                        base_array_layer: layer,
                        array_layer_count: Some(1),
                        ..Default::default()
                    })
                })
                .collect(),
            _texture: texture,
        };

        let id = DepthTargetId(self.handles.next());
        lock(&self.depth_arrays).insert(id, Arc::new(array));
        Ok(id)
    }

    fn destroy_depth_array(&self, target: DepthTargetId) {
        lock(&self.depth_arrays).remove(&target);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TargetKind {
    Colour,
    DepthOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    pass: PassId,
    vertex: Option<StageId>,
    pixel: Option<StageId>,
    topology: PrimitiveTopology,
    rasterizer: RasterizerState,
    blend: BlendMode,
    depth: DepthState,
    target: TargetKind,
    strides: Vec<(u32, u32)>,
}

type LayoutKey = Vec<(u32, ResourceKind)>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindGroupKey {
    layout: LayoutKey,
    resources: Vec<u64>,
}

/// Bindings in effect for the next draw.
#[derive(Default)]
struct DrawState {
    program: Option<Arc<ProgramBinding>>,
    blend: BlendMode,
    depth: DepthState,
    constants: BTreeMap<u32, BufferId>,
    shadow_map: Option<DepthTargetId>,
    vertex_buffers: BTreeMap<u32, (BufferId, u32)>,
    index_buffer: Option<BufferId>,
    topology: PrimitiveTopology,
}

#[derive(Debug, Clone, Copy)]
enum DrawCall {
    Vertices(u32),
    IndexedInstanced { index_count: u32, instance_count: u32 },
}

struct DrawItem {
    pipeline: Arc<wgpu::RenderPipeline>,
    bind_groups: Vec<Arc<wgpu::BindGroup>>,
    vertex_buffers: Vec<Arc<wgpu::Buffer>>,
    index_buffer: Option<Arc<wgpu::Buffer>>,
    call: DrawCall,
}

enum Attachment {
    Backbuffer,
    Slice(Arc<DepthArray>, usize),
}

struct Segment {
    attachment: Attachment,
    clear_colour: Option<wgpu::Color>,
    clear_depth: Option<f32>,
    draws: Vec<DrawItem>,
}

impl Segment {
    fn is_empty(&self) -> bool {
        self.clear_colour.is_none() && self.clear_depth.is_none() && self.draws.is_empty()
    }
}

enum Step {
    Copy {
        staging: wgpu::Buffer,
        target: Arc<wgpu::Buffer>,
        size: u64,
    },
    Pass(Segment),
}

struct SurfaceState {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

/// Command context over a wgpu device, drawing to a window surface or an
/// off-screen colour target.
pub struct WgpuContext {
    device: Arc<WgpuDevice>,
    surface: Option<SurfaceState>,
    format: wgpu::TextureFormat,
    size: (u32, u32),
    offscreen: (wgpu::Texture, wgpu::TextureView),
    depth: (wgpu::Texture, wgpu::TextureView),
    shadow_sampler: wgpu::Sampler,
    fallback_shadow: DepthArray,
    polygon_line: bool,
    wireframe_warned: bool,
    layouts: HashMap<LayoutKey, Arc<wgpu::BindGroupLayout>>,
    pipelines: HashMap<PipelineKey, Arc<wgpu::RenderPipeline>>,
    bind_groups: HashMap<BindGroupKey, Arc<wgpu::BindGroup>>,
    state: DrawState,
    target: RenderTarget,
    open: Option<Segment>,
    steps: Vec<Step>,
    deferred: Option<RenderError>,
}

impl WgpuContext {
    /// Creates a context presenting to `window`.
    pub async fn new_windowed(window: Arc<Window>, vsync: bool) -> RenderResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance.create_surface(window.clone())?;
        let (adapter, device, polygon_line) = request_device(&instance, Some(&surface)).await?;

        let size = window.inner_size();
        let width = size.width.max(1);
        let height = size.height.max(1);

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first())
            .copied()
            .ok_or(RenderError::SurfaceConfigurationFailed)?;
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width,
            height,
            present_mode: if vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(device.raw(), &config);
        log::info!(
            "wgpu context on '{}' ({width}x{height}, {format:?})",
            adapter.get_info().name
        );

        Ok(Self::with_device(
            device,
            Some(SurfaceState { surface, config }),
            format,
            (width, height),
            polygon_line,
        ))
    }

    /// Creates a context rendering into an off-screen colour target.
    pub async fn new_headless(width: u32, height: u32) -> RenderResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let (adapter, device, polygon_line) = request_device(&instance, None).await?;
        log::info!(
            "headless wgpu context on '{}' ({width}x{height})",
            adapter.get_info().name
        );
        Ok(Self::with_device(
            device,
            None,
            HEADLESS_FORMAT,
            (width.max(1), height.max(1)),
            polygon_line,
        ))
    }

    fn with_device(
        device: Arc<WgpuDevice>,
        surface: Option<SurfaceState>,
        format: wgpu::TextureFormat,
        size: (u32, u32),
        polygon_line: bool,
    ) -> Self {
        let raw = device.raw();
        let offscreen = create_colour_target(raw, format, size);
        let depth = create_depth_buffer(raw, size);
        let shadow_sampler = raw.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("shadow comparison sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            compare: Some(wgpu::CompareFunction::LessEqual),
            ..Default::default()
        });
        let fallback_shadow = create_fallback_shadow(raw);

        Self {
            device,
            surface,
            format,
            size,
            offscreen,
            depth,
            shadow_sampler,
            fallback_shadow,
            polygon_line,
            wireframe_warned: false,
            layouts: HashMap::new(),
            pipelines: HashMap::new(),
            bind_groups: HashMap::new(),
            state: DrawState::default(),
            target: RenderTarget::Backbuffer,
            open: None,
            steps: Vec::new(),
            deferred: None,
        }
    }

    /// Shared handle to the device, for creating resources from other threads.
    pub fn shared_device(&self) -> Arc<WgpuDevice> {
        self.device.clone()
    }

    /// Whether this context presents to a window.
    pub fn is_windowed(&self) -> bool {
        self.surface.is_some()
    }

    /// Colour format of the backbuffer.
    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    /// The off-screen colour target `flush` renders into.
    pub fn offscreen_texture(&self) -> &wgpu::Texture {
        &self.offscreen.0
    }

    fn defer(&mut self, err: RenderError) {
        log::error!("{err}");
        if self.deferred.is_none() {
            self.deferred = Some(err);
        }
    }

    fn close_segment(&mut self) {
        if let Some(segment) = self.open.take() {
            if !segment.is_empty() {
                self.steps.push(Step::Pass(segment));
            }
        }
    }

    /// The open segment for the current target, opening one if needed.
    /// Returns `None` when the target cannot be resolved.
    fn segment(&mut self) -> Option<&mut Segment> {
        if self.open.is_none() {
            let attachment = match self.target {
                RenderTarget::Backbuffer => Attachment::Backbuffer,
                RenderTarget::DepthSlice { target, layer } => {
                    match self.device.depth_array(target) {
                        Ok(array) if (layer as usize) < array.layer_views.len() => {
                            Attachment::Slice(array, layer as usize)
                        }
                        Ok(_) => {
                            self.defer(RenderError::MissingBinding(format!(
                                "{target:?} has no layer {layer}"
                            )));
                            return None;
                        }
                        Err(err) => {
                            self.defer(err);
                            return None;
                        }
                    }
                }
            };
            self.open = Some(Segment {
                attachment,
                clear_colour: None,
                clear_depth: None,
                draws: Vec::new(),
            });
        }
        self.open.as_mut()
    }

    fn record_draw(&mut self, call: DrawCall) {
        match self.resolve_draw(call) {
            Ok(item) => {
                if let Some(segment) = self.segment() {
                    segment.draws.push(item);
                }
            }
            Err(err) => self.defer(err),
        }
    }

    fn resolve_draw(&mut self, call: DrawCall) -> RenderResult<DrawItem> {
        let program = self
            .state
            .program
            .clone()
            .ok_or_else(|| RenderError::MissingBinding("draw without a bound program".into()))?;

        let mut strides = Vec::new();
        let mut vertex_buffers = Vec::new();
        for slot in [VERTEX_SLOT, INSTANCE_SLOT] {
            if !program.input_layout.uses_slot(slot) {
                continue;
            }
            let (id, stride) = self.state.vertex_buffers.get(&slot).copied().ok_or_else(|| {
                RenderError::MissingBinding(format!("{}: vertex buffer slot {slot}", program.label))
            })?;
            vertex_buffers.push(self.device.buffer(id)?);
            strides.push((slot, stride));
        }

        let index_buffer = match call {
            DrawCall::Vertices(_) => None,
            DrawCall::IndexedInstanced { .. } => {
                let id = self.state.index_buffer.ok_or_else(|| {
                    RenderError::MissingBinding(format!("{}: index buffer", program.label))
                })?;
                Some(self.device.buffer(id)?)
            }
        };

        let mut rasterizer = program.rasterizer;
        if rasterizer.fill == FillMode::Wireframe && !self.polygon_line {
            if !self.wireframe_warned {
                log::warn!("adapter lacks line polygon mode; wireframe passes draw solid");
                self.wireframe_warned = true;
            }
            rasterizer.fill = FillMode::Solid;
        }

        let key = PipelineKey {
            pass: program.pass,
            vertex: program.vertex.as_ref().map(|s| s.id),
            pixel: program.pixel.as_ref().map(|s| s.id),
            topology: self.state.topology,
            rasterizer,
            blend: self.state.blend,
            depth: self.state.depth,
            target: match self.target {
                RenderTarget::Backbuffer => TargetKind::Colour,
                RenderTarget::DepthSlice { .. } => TargetKind::DepthOnly,
            },
            strides,
        };

        let layouts = self.group_layouts(&program);
        let pipeline = match self.pipelines.get(&key) {
            Some(pipeline) => pipeline.clone(),
            None => {
                let pipeline = Arc::new(self.create_pipeline(&program, &key, &layouts)?);
                self.pipelines.insert(key, pipeline.clone());
                pipeline
            }
        };

        let bind_groups = layouts
            .iter()
            .map(|(layout_key, layout)| self.bind_group(&program, layout_key, layout))
            .collect::<RenderResult<Vec<_>>>()?;

        Ok(DrawItem {
            pipeline,
            bind_groups,
            vertex_buffers,
            index_buffer,
            call,
        })
    }

    /// One layout per bind group index up to the highest group the program uses.
    fn group_layouts(
        &mut self,
        program: &ProgramBinding,
    ) -> Vec<(LayoutKey, Arc<wgpu::BindGroupLayout>)> {
        let groups = program.resources.iter().map(|r| r.group + 1).max().unwrap_or(0);
        (0..groups)
            .map(|group| {
                let mut key: LayoutKey = program
                    .resources
                    .iter()
                    .filter(|r| r.group == group)
                    .map(|r| (r.binding, r.kind))
                    .collect();
                key.sort_by_key(|(binding, _)| *binding);
                let device = self.device.raw();
                let layout = self
                    .layouts
                    .entry(key.clone())
                    .or_insert_with(|| {
                        let entries: Vec<wgpu::BindGroupLayoutEntry> = key
                            .iter()
                            .map(|(binding, kind)| layout_entry(*binding, *kind))
                            .collect();
                        Arc::new(device.create_bind_group_layout(
                            &wgpu::BindGroupLayoutDescriptor {
                                label: Some("prism bind group layout"),
                                entries: &entries,
                            },
                        ))
                    })
                    .clone();
                (key, layout)
            })
            .collect()
    }

    fn bind_group(
        &mut self,
        program: &ProgramBinding,
        layout_key: &LayoutKey,
        layout: &wgpu::BindGroupLayout,
    ) -> RenderResult<Arc<wgpu::BindGroup>> {
        enum Bound {
            Buffer(Arc<wgpu::Buffer>),
            Shadow(Option<Arc<DepthArray>>),
            ComparisonSampler,
        }

        let mut bound = Vec::with_capacity(layout_key.len());
        let mut resources = Vec::with_capacity(layout_key.len());
        for (binding, kind) in layout_key {
            match kind {
                ResourceKind::UniformBuffer => {
                    let id = self.state.constants.get(binding).copied().ok_or_else(|| {
                        RenderError::MissingBinding(format!(
                            "{}: constant buffer slot {binding}",
                            program.label
                        ))
                    })?;
                    resources.push(id.0);
                    bound.push(Bound::Buffer(self.device.buffer(id)?));
                }
                ResourceKind::DepthTexture => {
                    let array = self
                        .state
                        .shadow_map
                        .map(|id| self.device.depth_array(id))
                        .transpose()?;
                    resources.push(self.state.shadow_map.map_or(0, |id| id.0));
                    bound.push(Bound::Shadow(array));
                }
                ResourceKind::ComparisonSampler => {
                    resources.push(0);
                    bound.push(Bound::ComparisonSampler);
                }
                ResourceKind::Texture | ResourceKind::Sampler => {
                    return Err(RenderError::MissingBinding(format!(
                        "{}: no texture bound at binding {binding}",
                        program.label
                    )));
                }
            }
        }

        let key = BindGroupKey {
            layout: layout_key.clone(),
            resources,
        };
        if let Some(group) = self.bind_groups.get(&key) {
            return Ok(group.clone());
        }

        let entries: Vec<wgpu::BindGroupEntry<'_>> = layout_key
            .iter()
            .zip(&bound)
            .map(|((binding, _), bound)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: match bound {
                    Bound::Buffer(buffer) => buffer.as_entire_binding(),
                    Bound::Shadow(array) => wgpu::BindingResource::TextureView(
                        &array.as_deref().unwrap_or(&self.fallback_shadow).array_view,
                    ),
                    Bound::ComparisonSampler => wgpu::BindingResource::Sampler(&self.shadow_sampler),
                },
            })
            .collect();
        let group = Arc::new(self.device.raw().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&program.label),
            layout,
            entries: &entries,
        }));
        drop(entries);
        self.bind_groups.insert(key, group.clone());
        Ok(group)
    }

    fn create_pipeline(
        &self,
        program: &ProgramBinding,
        key: &PipelineKey,
        layouts: &[(LayoutKey, Arc<wgpu::BindGroupLayout>)],
    ) -> RenderResult<wgpu::RenderPipeline> {
        let vertex = program.vertex.as_ref().ok_or_else(|| {
            RenderError::MissingBinding(format!("{}: no vertex stage", program.label))
        })?;
        let vertex_module = self.device.stage(vertex.id)?;
        let pixel = program
            .pixel
            .as_ref()
            .map(|stage| {
                self.device
                    .stage(stage.id)
                    .map(|module| (module, stage.entry_point.as_str()))
            })
            .transpose()?;

        let attributes: Vec<Vec<wgpu::VertexAttribute>> = key
            .strides
            .iter()
            .map(|(slot, _)| {
                program
                    .input_layout
                    .slot_elements(*slot)
                    .map(|element| wgpu::VertexAttribute {
                        format: vertex_format(element.format),
                        offset: u64::from(element.offset),
                        shader_location: element.location,
                    })
                    .collect()
            })
            .collect();
        let buffers: Vec<wgpu::VertexBufferLayout<'_>> = key
            .strides
            .iter()
            .zip(&attributes)
            .map(|((slot, stride), attributes)| wgpu::VertexBufferLayout {
                array_stride: u64::from(*stride),
                step_mode: if *slot == INSTANCE_SLOT {
                    wgpu::VertexStepMode::Instance
                } else {
                    wgpu::VertexStepMode::Vertex
                },
                attributes,
            })
            .collect();

        let group_layouts: Vec<&wgpu::BindGroupLayout> =
            layouts.iter().map(|(_, layout)| layout.as_ref()).collect();
        let device = self.device.raw();
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&program.label),
            bind_group_layouts: &group_layouts,
            push_constant_ranges: &[],
        });

        let colour_targets = [Some(wgpu::ColorTargetState {
            format: self.format,
            blend: Some(blend_state(key.blend)),
            write_mask: wgpu::ColorWrites::ALL,
        })];
        let targets: &[Option<wgpu::ColorTargetState>] = match key.target {
            TargetKind::Colour => &colour_targets,
            TargetKind::DepthOnly => &[],
        };

        let strip = matches!(
            key.topology,
            PrimitiveTopology::LineStrip | PrimitiveTopology::TriangleStrip
        );

        self.device
            .scoped(wgpu::ErrorFilter::Validation, |device| {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(&program.label),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &vertex_module,
                        entry_point: Some(vertex.entry_point.as_str()),
                        buffers: &buffers,
                        compilation_options: Default::default(),
                    },
                    fragment: pixel.as_ref().map(|(module, entry_point)| wgpu::FragmentState {
                        module,
                        entry_point: Some(*entry_point),
                        targets,
                        compilation_options: Default::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: topology(key.topology),
                        strip_index_format: strip.then_some(wgpu::IndexFormat::Uint32),
                        front_face: wgpu::FrontFace::Ccw,
                        cull_mode: match key.rasterizer.cull {
                            CullMode::None => None,
                            CullMode::Front => Some(wgpu::Face::Front),
                            CullMode::Back => Some(wgpu::Face::Back),
                        },
                        polygon_mode: match key.rasterizer.fill {
                            FillMode::Solid => wgpu::PolygonMode::Fill,
                            FillMode::Wireframe => wgpu::PolygonMode::Line,
                        },
                        ..Default::default()
                    },
                    depth_stencil: Some(wgpu::DepthStencilState {
                        format: DEPTH_FORMAT,
                        depth_write_enabled: key.depth.write,
                        depth_compare: if key.depth.test {
                            wgpu::CompareFunction::LessEqual
                        } else {
                            wgpu::CompareFunction::Always
                        },
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                })
            })
            .map_err(|err| RenderError::PipelineCreationFailed {
                label: program.label.clone(),
                message: err.to_string(),
            })
    }

    fn acquire(&self) -> RenderResult<Option<wgpu::SurfaceTexture>> {
        let Some(state) = &self.surface else {
            return Ok(None);
        };
        match state.surface.get_current_texture() {
            Ok(frame) => Ok(Some(frame)),
            Err(wgpu::SurfaceError::Lost) => {
                state.surface.configure(self.device.raw(), &state.config);
                Err(RenderError::SurfaceLost)
            }
            Err(wgpu::SurfaceError::Outdated) => {
                state.surface.configure(self.device.raw(), &state.config);
                Err(RenderError::SurfaceOutdated)
            }
            Err(wgpu::SurfaceError::OutOfMemory) => Err(RenderError::OutOfMemory),
            Err(err) => {
                log::warn!("skipping frame: {err}");
                Ok(None)
            }
        }
    }

    /// Forgets every recorded step and the per-frame draw state.
    fn reset_frame(&mut self) -> Vec<Step> {
        self.open = None;
        self.bind_groups.clear();
        self.state = DrawState::default();
        self.target = RenderTarget::Backbuffer;
        std::mem::take(&mut self.steps)
    }

    fn submit(&mut self, present: bool) -> RenderResult<()> {
        self.close_segment();
        let steps = self.reset_frame();
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }

        let frame = if present { self.acquire()? } else { None };
        if present && self.surface.is_some() && frame.is_none() {
            return Ok(());
        }
        let frame_view = frame
            .as_ref()
            .map(|f| f.texture.create_view(&wgpu::TextureViewDescriptor::default()));
        let colour_view = frame_view.as_ref().unwrap_or(&self.offscreen.1);

        let device = self.device.raw();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("prism frame"),
        });
        for step in &steps {
            match step {
                Step::Copy {
                    staging,
                    target,
                    size,
                } => encoder.copy_buffer_to_buffer(staging, 0, target, 0, *size),
                Step::Pass(segment) => self.encode_segment(&mut encoder, segment, colour_view),
            }
        }
        self.device.queue().submit(Some(encoder.finish()));
        if let Some(frame) = frame {
            frame.present();
        }
        Ok(())
    }

    fn encode_segment(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        segment: &Segment,
        colour_view: &wgpu::TextureView,
    ) {
        let (colour, depth_view) = match &segment.attachment {
            Attachment::Backbuffer => (Some(colour_view), &self.depth.1),
            Attachment::Slice(array, layer) => (None, &array.layer_views[*layer]),
        };
        let colour_attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = colour
            .map(|view| wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: segment
                        .clear_colour
                        .map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                },
            })
            .into_iter()
            .map(Some)
            .collect();

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("prism pass"),
            color_attachments: &colour_attachments,
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: segment
                        .clear_depth
                        .map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        for draw in &segment.draws {
            pass.set_pipeline(&draw.pipeline);
            for (index, group) in draw.bind_groups.iter().enumerate() {
                pass.set_bind_group(index as u32, &**group, &[]);
            }
            for (index, buffer) in draw.vertex_buffers.iter().enumerate() {
                pass.set_vertex_buffer(index as u32, buffer.slice(..));
            }
            match draw.call {
                DrawCall::Vertices(count) => pass.draw(0..count, 0..1),
                DrawCall::IndexedInstanced {
                    index_count,
                    instance_count,
                } => {
                    if let Some(indices) = &draw.index_buffer {
                        pass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);
                        pass.draw_indexed(0..index_count, 0, 0..instance_count);
                    }
                }
            }
        }
    }
}

impl CommandContext for WgpuContext {
    fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }

    fn write_buffer(&mut self, buffer: BufferId, data: &[u8]) -> RenderResult<()> {
        let target = self.device.buffer(buffer)?;
        if data.len() as u64 > target.size() {
            return Err(RenderError::BufferWriteOutOfRange {
                buffer: buffer.0,
                size: target.size(),
                len: data.len(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        // Copies must be 4-byte multiples; buffer sizes already are.
        let mut contents = data.to_vec();
        contents.resize(data.len().next_multiple_of(4), 0);
        let staging = self
            .device
            .raw()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("staging"),
                contents: &contents,
                usage: wgpu::BufferUsages::COPY_SRC,
            });

        if self.open.as_ref().is_some_and(|s| !s.draws.is_empty()) {
            self.close_segment();
        }
        self.steps.push(Step::Copy {
            staging,
            target,
            size: contents.len() as u64,
        });
        Ok(())
    }

    fn set_render_target(&mut self, target: RenderTarget) {
        if self.target != target {
            self.close_segment();
            self.target = target;
        }
    }

    fn clear_colour(&mut self, colour: [f32; 4]) {
        if self.open.as_ref().is_some_and(|s| !s.draws.is_empty()) {
            self.close_segment();
        }
        if let Some(segment) = self.segment() {
            segment.clear_colour = Some(wgpu::Color {
                r: f64::from(colour[0]),
                g: f64::from(colour[1]),
                b: f64::from(colour[2]),
                a: f64::from(colour[3]),
            });
        }
    }

    fn clear_depth(&mut self, depth: f32) {
        if self.open.as_ref().is_some_and(|s| !s.draws.is_empty()) {
            self.close_segment();
        }
        if let Some(segment) = self.segment() {
            segment.clear_depth = Some(depth);
        }
    }

    fn bind_program(&mut self, program: &Arc<ProgramBinding>) {
        self.state.program = Some(program.clone());
    }

    fn set_blend_mode(&mut self, mode: BlendMode) {
        self.state.blend = mode;
    }

    fn set_depth_state(&mut self, state: DepthState) {
        self.state.depth = state;
    }

    fn set_constant_buffer(&mut self, slot: u32, buffer: BufferId) {
        self.state.constants.insert(slot, buffer);
    }

    fn set_shadow_map(&mut self, target: Option<DepthTargetId>) {
        self.state.shadow_map = target;
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferId, stride: u32) {
        self.state.vertex_buffers.insert(slot, (buffer, stride));
    }

    fn set_index_buffer(&mut self, buffer: BufferId) {
        self.state.index_buffer = Some(buffer);
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.state.topology = topology;
    }

    fn draw(&mut self, vertex_count: u32) {
        self.record_draw(DrawCall::Vertices(vertex_count));
    }

    fn draw_indexed_instanced(&mut self, index_count: u32, instance_count: u32) {
        self.record_draw(DrawCall::IndexedInstanced {
            index_count,
            instance_count,
        });
    }

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let size = (width.max(1), height.max(1));
        self.size = size;
        if let Some(state) = &mut self.surface {
            state.config.width = size.0;
            state.config.height = size.1;
            state.surface.configure(self.device.raw(), &state.config);
        }
        self.offscreen = create_colour_target(self.device.raw(), self.format, size);
        self.depth = create_depth_buffer(self.device.raw(), size);
        // Recorded passes referenced the old attachments.
        self.open = None;
        self.steps.clear();
        Ok(())
    }

    fn backbuffer_size(&self) -> (u32, u32) {
        self.size
    }

    fn present(&mut self) -> RenderResult<()> {
        self.submit(true)
    }

    fn flush(&mut self) -> RenderResult<()> {
        self.submit(false)
    }

    fn discard(&mut self) {
        let dropped = self.reset_frame();
        self.deferred = None;
        if !dropped.is_empty() {
            log::debug!("discarded {} recorded steps", dropped.len());
        }
    }
}

async fn request_device(
    instance: &wgpu::Instance,
    surface: Option<&wgpu::Surface<'_>>,
) -> RenderResult<(wgpu::Adapter, Arc<WgpuDevice>, bool)> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface,
            force_fallback_adapter: false,
        })
        .await
        .ok_or(RenderError::AdapterCreationFailed)?;

    let polygon_line = adapter.features().contains(wgpu::Features::POLYGON_MODE_LINE);
    let required_features = if polygon_line {
        wgpu::Features::POLYGON_MODE_LINE
    } else {
        wgpu::Features::empty()
    };

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("prism device"),
                required_features,
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        )
        .await?;

    Ok((adapter, Arc::new(WgpuDevice::new(device, queue)), polygon_line))
}

fn create_colour_target(
    device: &wgpu::Device,
    format: wgpu::TextureFormat,
    (width, height): (u32, u32),
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("offscreen colour"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn create_depth_buffer(
    device: &wgpu::Device,
    (width, height): (u32, u32),
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("depth texture"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

/// 1x1 single-layer array sampled when no shadow map is bound.
fn create_fallback_shadow(device: &wgpu::Device) -> DepthArray {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("fallback shadow map"),
        size: wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        view_formats: &[],
    });
    DepthArray {
        array_view: texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("fallback shadow map"),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        }),
        layer_views: Vec::new(),
        _texture: texture,
    }
}

fn layout_entry(binding: u32, kind: ResourceKind) -> wgpu::BindGroupLayoutEntry {
    let ty = match kind {
        ResourceKind::UniformBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        ResourceKind::DepthTexture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Depth,
            view_dimension: wgpu::TextureViewDimension::D2Array,
            multisampled: false,
        },
        ResourceKind::Texture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        ResourceKind::Sampler => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        ResourceKind::ComparisonSampler => {
            wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Comparison)
        }
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
        ty,
        count: None,
    }
}

fn blend_state(mode: BlendMode) -> wgpu::BlendState {
    match mode {
        BlendMode::Opaque => wgpu::BlendState::REPLACE,
        BlendMode::AlphaBlend => wgpu::BlendState::ALPHA_BLENDING,
        BlendMode::Additive => {
            let add = wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::One,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            };
            wgpu::BlendState {
                color: add,
                alpha: add,
            }
        }
        BlendMode::Modulate => wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::Dst,
                dst_factor: wgpu::BlendFactor::Zero,
                operation: wgpu::BlendOperation::Add,
            },
            alpha: wgpu::BlendComponent {
                src_factor: wgpu::BlendFactor::Zero,
                dst_factor: wgpu::BlendFactor::One,
                operation: wgpu::BlendOperation::Add,
            },
        },
    }
}

fn topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
        PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        VertexFormat::Uint32x2 => wgpu::VertexFormat::Uint32x2,
        VertexFormat::Uint32x3 => wgpu::VertexFormat::Uint32x3,
        VertexFormat::Uint32x4 => wgpu::VertexFormat::Uint32x4,
        VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
        VertexFormat::Sint32x2 => wgpu::VertexFormat::Sint32x2,
        VertexFormat::Sint32x3 => wgpu::VertexFormat::Sint32x3,
        VertexFormat::Sint32x4 => wgpu::VertexFormat::Sint32x4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modulate_multiplies_destination() {
        let state = blend_state(BlendMode::Modulate);
        assert_eq!(state.color.src_factor, wgpu::BlendFactor::Dst);
        assert_eq!(state.color.dst_factor, wgpu::BlendFactor::Zero);
    }

    #[test]
    fn test_layout_entry_for_shadow_map_is_depth_array() {
        let entry = layout_entry(0, ResourceKind::DepthTexture);
        assert!(matches!(
            entry.ty,
            wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Depth,
                view_dimension: wgpu::TextureViewDimension::D2Array,
                ..
            }
        ));
    }

    #[test]
    fn test_vertex_formats_map_one_to_one() {
        assert_eq!(
            vertex_format(VertexFormat::Float32x3),
            wgpu::VertexFormat::Float32x3
        );
        assert_eq!(vertex_format(VertexFormat::Uint32), wgpu::VertexFormat::Uint32);
    }

    #[test]
    fn test_strip_topologies_map() {
        assert_eq!(
            topology(PrimitiveTopology::TriangleStrip),
            wgpu::PrimitiveTopology::TriangleStrip
        );
    }
}
