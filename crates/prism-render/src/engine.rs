//! Frame orchestration.
//!
//! The [`FrameOrchestrator`] owns the one command context, the shader cache
//! and every [`RenderWorld`]. Each call to [`FrameOrchestrator::render_frame`]
//! walks the worlds and runs the passes each one asks for, in the order
//! shadow, scene, lighting, post-process, GUI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use prism_core::{LightingSettings, PassFlags, RenderOptions};

use crate::camera::Camera;
use crate::cascade::ShadowCascadeGenerator;
use crate::constant_buffer::{
    ConstantBuffer, LightingConstants, PostProcessConstants, LIGHTING_SLOT, POST_PROCESS_SLOT,
};
use crate::context::{FrameBindings, FrameStats, RenderContext};
use crate::error::{RenderError, RenderResult};
use crate::gpu::{CommandContext, GpuDevice, RenderTarget};
use crate::shader::ShaderPass;
use crate::shader_cache::ShaderCache;
use crate::sync::{lock, read, write};
use crate::world_renderer::WorldRenderer;

/// Host-supplied overlay drawn last.
pub trait GuiLayer: Send {
    fn draw(&mut self, ctx: &mut RenderContext<'_>) -> RenderResult<()>;
}

/// Handle to a world registered with a [`FrameOrchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorldId(usize);

/// One scene drawn by the orchestrator: geometry, camera, lighting and the
/// passes it wants.
pub struct RenderWorld {
    name: String,
    renderer: Arc<WorldRenderer>,
    camera: Option<Camera>,
    renderable: bool,
    on_screen: bool,
    passes: PassFlags,
    lighting: LightingSettings,
    lighting_constants: ConstantBuffer<LightingConstants>,
    post_constants: ConstantBuffer<PostProcessConstants>,
    cascades: ShadowCascadeGenerator,
    pending_resize: Option<(u32, u32)>,
    gui: Option<Box<dyn GuiLayer>>,
}

impl RenderWorld {
    fn new(name: &str, options: &RenderOptions) -> Self {
        Self {
            name: name.to_string(),
            renderer: Arc::new(WorldRenderer::new()),
            camera: None,
            renderable: true,
            on_screen: true,
            passes: options.passes,
            lighting: LightingSettings::default(),
            lighting_constants: ConstantBuffer::new(
                format!("{name} lighting"),
                LightingConstants::default(),
            ),
            post_constants: ConstantBuffer::new(
                format!("{name} post"),
                PostProcessConstants::default(),
            ),
            cascades: ShadowCascadeGenerator::new(options.shadows.clone()),
            pending_resize: None,
            gui: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Geometry registry. Shared with game threads.
    pub fn renderer(&self) -> &Arc<WorldRenderer> {
        &self.renderer
    }

    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    pub fn camera_mut(&mut self) -> Option<&mut Camera> {
        self.camera.as_mut()
    }

    pub fn set_camera(&mut self, camera: Option<Camera>) {
        self.camera = camera;
    }

    pub fn is_renderable(&self) -> bool {
        self.renderable
    }

    pub fn set_renderable(&mut self, renderable: bool) {
        self.renderable = renderable;
    }

    /// Whether frames are presented (`true`) or only flushed.
    pub fn set_on_screen(&mut self, on_screen: bool) {
        self.on_screen = on_screen;
    }

    pub fn passes(&self) -> PassFlags {
        self.passes
    }

    pub fn set_passes(&mut self, passes: PassFlags) {
        self.passes = passes;
    }

    pub fn lighting(&self) -> &LightingSettings {
        &self.lighting
    }

    pub fn lighting_mut(&mut self) -> &mut LightingSettings {
        &mut self.lighting
    }

    pub fn post_process_mut(&mut self) -> &mut PostProcessConstants {
        self.post_constants.value_mut()
    }

    pub fn cascades(&self) -> &ShadowCascadeGenerator {
        &self.cascades
    }

    pub fn cascades_mut(&mut self) -> &mut ShadowCascadeGenerator {
        &mut self.cascades
    }

    pub fn set_gui(&mut self, gui: Option<Box<dyn GuiLayer>>) {
        self.gui = gui;
    }

    /// Whether a resize waits for the next frame.
    pub fn resize_pending(&self) -> bool {
        self.pending_resize.is_some()
    }

    fn bind_to_device(&mut self, device: &dyn GpuDevice) -> RenderResult<()> {
        self.renderer.bind_to_device(device)?;
        self.lighting_constants.bind_to_device(device)?;
        self.post_constants.bind_to_device(device)?;
        self.cascades.bind_to_device(device)
    }

    fn release(&mut self, device: &dyn GpuDevice) {
        self.renderer.release(device);
        self.lighting_constants.dispose(device);
        self.post_constants.dispose(device);
        self.cascades.release(device);
    }
}

/// What one [`FrameOrchestrator::render_frame`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub drawn: usize,
    pub skipped: usize,
    pub resized: usize,
    pub stats: FrameStats,
}

/// Passes looked up once after the shader cache is ready.
#[derive(Default)]
struct FramePasses {
    bindings: FrameBindings,
    haze: Option<Arc<ShaderPass>>,
    vignette: Option<Arc<ShaderPass>>,
}

impl FramePasses {
    fn from_cache(cache: &ShaderCache) -> Self {
        let pass = |shader: &str, pass: &str| {
            let found = cache.get(shader).and_then(|s| s.pass(pass).cloned());
            if found.is_none() {
                log::warn!("shader '{shader}' pass '{pass}' is not available");
            }
            found
        };
        Self {
            bindings: FrameBindings {
                world_pass: pass("world", "scene"),
                depth_pass: pass("world", "depth"),
                sky_pass: pass("sky", "sky"),
                ..FrameBindings::default()
            },
            haze: pass("lighting", "haze"),
            vignette: pass("post", "vignette"),
        }
    }
}

struct FrameState {
    context: Box<dyn CommandContext>,
    initialized: bool,
    passes: FramePasses,
}

/// Drives every world through its passes once per frame.
///
/// The command context is used under one lock; worlds may be edited from
/// other threads between frames.
pub struct FrameOrchestrator {
    state: Mutex<FrameState>,
    shaders: RwLock<ShaderCache>,
    worlds: Mutex<Vec<RenderWorld>>,
    options: RenderOptions,
    lighting_warned: AtomicBool,
    post_warned: AtomicBool,
}

impl FrameOrchestrator {
    /// Creates an orchestrator. Nothing touches the device until the first
    /// frame.
    pub fn new(context: Box<dyn CommandContext>, options: RenderOptions, shaders: ShaderCache) -> Self {
        Self {
            state: Mutex::new(FrameState {
                context,
                initialized: false,
                passes: FramePasses::default(),
            }),
            shaders: RwLock::new(shaders.configured(&options)),
            worlds: Mutex::new(Vec::new()),
            options,
            lighting_warned: AtomicBool::new(false),
            post_warned: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    /// Registers a world using the configured passes and shadow options.
    pub fn add_world(&self, name: &str) -> WorldId {
        let mut worlds = lock(&self.worlds);
        worlds.push(RenderWorld::new(name, &self.options));
        WorldId(worlds.len() - 1)
    }

    /// Runs `f` on a world. `None` when the id is unknown.
    pub fn with_world<R>(&self, id: WorldId, f: impl FnOnce(&mut RenderWorld) -> R) -> Option<R> {
        lock(&self.worlds).get_mut(id.0).map(f)
    }

    /// Geometry registry of a world.
    pub fn world_renderer(&self, id: WorldId) -> Option<Arc<WorldRenderer>> {
        self.with_world(id, |world| world.renderer.clone())
    }

    /// Records a surface size change; the next frame resizes and skips the
    /// world's draw.
    pub fn notify_resize(&self, id: WorldId, width: u32, height: u32) {
        self.with_world(id, |world| world.pending_resize = Some((width, height)));
    }

    /// Runs `f` with the loaded shader cache.
    pub fn with_shaders<R>(&self, f: impl FnOnce(&ShaderCache) -> R) -> R {
        f(&read(&self.shaders))
    }

    /// Renders one frame of every world.
    pub fn render_frame(&self) -> RenderResult<FrameReport> {
        let mut state = lock(&self.state);
        if !state.initialized {
            self.initialize(&mut state)?;
        }

        let FrameState {
            context, passes, ..
        } = &mut *state;
        let mut report = FrameReport::default();
        let mut worlds = lock(&self.worlds);
        for world in worlds.iter_mut() {
            if !world.renderable || world.camera.is_none() {
                report.skipped += 1;
                continue;
            }
            if let Some((width, height)) = world.pending_resize.take() {
                context.resize_backbuffer(width, height)?;
                let (width, height) = context.backbuffer_size();
                log::info!("world '{}': backbuffer resized to {width}x{height}", world.name);
                report.resized += 1;
                continue;
            }

            let stats = match self.render_world(context.as_mut(), passes, world) {
                Ok(stats) => stats,
                Err(err) => {
                    context.discard();
                    log::error!("world '{}': frame failed: {err}", world.name);
                    return Err(err);
                }
            };
            add_stats(&mut report.stats, stats);

            let submitted = if world.on_screen {
                context.present()
            } else {
                context.flush()
            };
            match submitted {
                Ok(()) => report.drawn += 1,
                Err(RenderError::SurfaceLost | RenderError::SurfaceOutdated) => {
                    log::warn!("world '{}': surface changed, frame dropped", world.name);
                    report.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    fn initialize(&self, state: &mut FrameState) -> RenderResult<()> {
        let device = state.context.device();
        let mut shaders = write(&self.shaders);
        if let Err(err) = shaders.init(device) {
            log::error!("shader initialisation failed: {err}");
            return Err(err);
        }
        for world in lock(&self.worlds).iter_mut() {
            world.bind_to_device(device)?;
        }
        state.passes = FramePasses::from_cache(&shaders);
        state.initialized = true;
        log::info!("renderer initialised with {} shaders", shaders.len());
        Ok(())
    }

    fn render_world(
        &self,
        commands: &mut dyn CommandContext,
        passes: &FramePasses,
        world: &mut RenderWorld,
    ) -> RenderResult<FrameStats> {
        let (width, height) = commands.backbuffer_size();
        let Some(camera) = world.camera.as_mut() else {
            return Ok(FrameStats::default());
        };
        camera.set_viewport(width, height);
        let camera = camera.clone();
        let flags = world.passes;

        let mut ctx = RenderContext::new(commands, passes.bindings.clone());
        world
            .lighting_constants
            .set(LightingConstants::from(&world.lighting));
        world.lighting_constants.update(&mut ctx)?;
        ctx.frame.lighting = world.lighting_constants.buffer();

        if flags.contains(PassFlags::SHADOW) && world.cascades.options().enabled {
            world.cascades.render(
                &mut ctx,
                &camera,
                &world.renderer,
                world.lighting.light_direction(),
            )?;
        } else {
            world.cascades.disable(&mut ctx)?;
        }

        ctx.commands.set_render_target(RenderTarget::Backbuffer);
        ctx.commands.clear_colour(self.options.clear_colour);
        ctx.commands.clear_depth(1.0);

        if flags.contains(PassFlags::SCENE) {
            world.renderer.draw(&mut ctx, &camera, false)?;
        }

        if flags.contains(PassFlags::LIGHTING) {
            match &passes.haze {
                Some(haze) => {
                    if !flags.contains(PassFlags::SCENE) {
                        world.renderer.upload_camera(&mut ctx, &camera)?;
                    }
                    haze.apply(&mut ctx)?;
                    world.renderer.bind_camera(&mut ctx);
                    if let Some(lighting) = ctx.frame.lighting {
                        ctx.commands.set_constant_buffer(LIGHTING_SLOT, lighting);
                    }
                    ctx.draw(3);
                }
                None => warn_once(&self.lighting_warned, "lighting shader missing; haze skipped"),
            }
        }

        if flags.contains(PassFlags::POST_PROCESS) {
            match &passes.vignette {
                Some(vignette) => {
                    world.post_constants.update(&mut ctx)?;
                    vignette.apply(&mut ctx)?;
                    world.post_constants.bind(&mut ctx, POST_PROCESS_SLOT);
                    ctx.draw(3);
                }
                None => warn_once(&self.post_warned, "post shader missing; post-processing skipped"),
            }
        }

        if flags.contains(PassFlags::GUI) {
            if let Some(gui) = world.gui.as_mut() {
                ctx.invalidate_state();
                gui.draw(&mut ctx)?;
            }
        }

        Ok(ctx.stats)
    }

    /// Releases every GPU resource. No frames may be rendered afterwards.
    pub fn shutdown(&self) {
        let state = lock(&self.state);
        let device = state.context.device();
        for world in lock(&self.worlds).iter_mut() {
            world.release(device);
        }
        read(&self.shaders).release(device);
        log::debug!("renderer shut down");
    }
}

fn warn_once(flag: &AtomicBool, message: &str) {
    if !flag.swap(true, Ordering::Relaxed) {
        log::warn!("{message}");
    }
}

fn add_stats(total: &mut FrameStats, frame: FrameStats) {
    total.draw_calls += frame.draw_calls;
    total.instances += frame.instances;
    total.program_binds += frame.program_binds;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{Command, CommandLog, RecordingContext};
    use crate::instance::SceneInstance;
    use crate::shader::NagaCompiler;
    use crate::shader_cache::EMBEDDED_SOURCES;
    use crate::test_support::CountingCompiler;
    use prism_core::{PrimitiveShape, ShadowOptions, Vec3};

    fn orchestrator(options: RenderOptions) -> (FrameOrchestrator, CommandLog) {
        let context = RecordingContext::new(320, 240);
        let log = context.log();
        let cache = ShaderCache::new(Arc::new(NagaCompiler::new()));
        (FrameOrchestrator::new(Box::new(context), options, cache), log)
    }

    fn small_shadows() -> RenderOptions {
        RenderOptions {
            shadows: ShadowOptions {
                map_size: 64,
                ..ShadowOptions::default()
            },
            ..RenderOptions::default()
        }
    }

    fn add_scene(orchestrator: &FrameOrchestrator) -> WorldId {
        let id = orchestrator.add_world("main");
        orchestrator.with_world(id, |world| {
            world.set_camera(Some(Camera::new(1.0)));
            world
                .renderer()
                .add_primitive(PrimitiveShape::Cube, Arc::new(SceneInstance::new(Vec3::ZERO)));
        });
        id
    }

    fn program_labels(log: &CommandLog) -> Vec<String> {
        log.commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::BindProgram { label, .. } => Some(label),
                _ => None,
            })
            .collect()
    }

    struct CountingGui(Arc<Mutex<usize>>);

    impl GuiLayer for CountingGui {
        fn draw(&mut self, ctx: &mut RenderContext<'_>) -> RenderResult<()> {
            *lock(&self.0) += 1;
            ctx.draw(6);
            Ok(())
        }
    }

    #[test]
    fn test_first_frame_initializes_once() {
        let compiler = Arc::new(CountingCompiler::default());
        let context = RecordingContext::new(64, 64);
        let orchestrator = FrameOrchestrator::new(
            Box::new(context),
            small_shadows(),
            ShaderCache::new(compiler.clone()),
        );
        add_scene(&orchestrator);
        assert!(!orchestrator.is_initialized());

        orchestrator.render_frame().unwrap();
        let calls = compiler.calls();
        assert!(calls > 0);
        orchestrator.render_frame().unwrap();
        assert_eq!(compiler.calls(), calls);
        assert!(orchestrator.is_initialized());
    }

    #[test]
    fn test_pass_order() {
        let (orchestrator, log) = orchestrator(small_shadows());
        let id = add_scene(&orchestrator);
        let gui_calls = Arc::new(Mutex::new(0));
        orchestrator.with_world(id, |world| {
            world.set_gui(Some(Box::new(CountingGui(gui_calls.clone()))));
        });

        let report = orchestrator.render_frame().unwrap();
        assert_eq!(report.drawn, 1);
        assert_eq!(
            program_labels(&log),
            vec![
                "world/depth",
                "sky/sky",
                "world/scene",
                "lighting/haze",
                "post/vignette"
            ]
        );
        assert_eq!(*lock(&gui_calls), 1);
        assert_eq!(log.commands().last(), Some(&Command::Present));
        assert_eq!(log.draws().last(), Some(&Command::Draw { vertex_count: 6 }));
    }

    #[test]
    fn test_pass_subset() {
        let (orchestrator, log) = orchestrator(small_shadows());
        let id = add_scene(&orchestrator);
        orchestrator.with_world(id, |world| world.set_passes(PassFlags::SCENE));

        orchestrator.render_frame().unwrap();
        assert_eq!(program_labels(&log), vec!["sky/sky", "world/scene"]);
        assert_eq!(
            log.count(|c| matches!(c, Command::SetRenderTarget(RenderTarget::DepthSlice { .. }))),
            0
        );
        assert!(log.commands().contains(&Command::SetShadowMap(None)));
    }

    #[test]
    fn test_skips_worlds_without_camera_or_disabled() {
        let (orchestrator, log) = orchestrator(small_shadows());
        orchestrator.add_world("no camera");
        let hidden = add_scene(&orchestrator);
        orchestrator.with_world(hidden, |world| world.set_renderable(false));

        let report = orchestrator.render_frame().unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.drawn, 0);
        assert!(log.draws().is_empty());
    }

    #[test]
    fn test_resize_skips_one_frame() {
        let (orchestrator, log) = orchestrator(small_shadows());
        let id = add_scene(&orchestrator);
        orchestrator.render_frame().unwrap();
        log.clear();

        orchestrator.notify_resize(id, 800, 600);
        let report = orchestrator.render_frame().unwrap();
        assert_eq!(report.resized, 1);
        assert_eq!(
            log.commands(),
            vec![Command::ResizeBackbuffer {
                width: 800,
                height: 600
            }]
        );

        let report = orchestrator.render_frame().unwrap();
        assert_eq!(report.drawn, 1);
        let aspect = orchestrator
            .with_world(id, |world| world.camera().unwrap().aspect_ratio)
            .unwrap();
        assert!((aspect - 800.0 / 600.0).abs() < 1e-6);
    }

    #[test]
    fn test_off_screen_world_flushes() {
        let (orchestrator, log) = orchestrator(small_shadows());
        let id = add_scene(&orchestrator);
        orchestrator.with_world(id, |world| world.set_on_screen(false));
        orchestrator.render_frame().unwrap();
        assert_eq!(log.commands().last(), Some(&Command::Flush));
        assert_eq!(log.count(|c| *c == Command::Present), 0);
    }

    #[test]
    fn test_missing_optional_shaders_are_skipped() {
        let sources = EMBEDDED_SOURCES
            .iter()
            .filter(|(origin, _)| origin.contains("world") || origin.contains("sky"))
            .map(|(origin, text)| ((*origin).to_string(), (*text).to_string()))
            .collect();
        let cache = ShaderCache::with_sources(Arc::new(NagaCompiler::new()), sources);
        let context = RecordingContext::new(64, 64);
        let log = context.log();
        let orchestrator = FrameOrchestrator::new(Box::new(context), small_shadows(), cache);
        add_scene(&orchestrator);

        orchestrator.render_frame().unwrap();
        assert_eq!(
            program_labels(&log),
            vec!["world/depth", "sky/sky", "world/scene"]
        );
    }

    #[test]
    fn test_compile_failure_aborts_startup() {
        let broken = vec![(
            "broken.wgsl".to_string(),
            "<shader name=\"broken\"><pass name=\"main\" vertex=\"vs_main\"/></shader>\nfn nope(".to_string(),
        )];
        let cache = ShaderCache::with_sources(Arc::new(NagaCompiler::new()), broken);
        let orchestrator =
            FrameOrchestrator::new(Box::new(RecordingContext::new(8, 8)), RenderOptions::default(), cache);
        let err = orchestrator.render_frame().unwrap_err();
        assert!(matches!(err, RenderError::ShaderCompile { .. }));
        assert!(!orchestrator.is_initialized());
    }

    #[test]
    fn test_failed_frame_discards_recorded_work() {
        let options = RenderOptions {
            shadows: ShadowOptions {
                map_size: 64,
                filterable: true,
                ..ShadowOptions::default()
            },
            ..RenderOptions::default()
        };
        let (orchestrator, log) = orchestrator(options);
        add_scene(&orchestrator);

        for _ in 0..2 {
            log.clear();
            let err = orchestrator.render_frame().unwrap_err();
            assert!(matches!(err, RenderError::NotSupported(_)));
            assert_eq!(log.commands().last(), Some(&Command::Discard));
            assert_eq!(log.count(|c| *c == Command::Present), 0);
            assert_eq!(
                log.count(|c| matches!(c, Command::SetRenderTarget(RenderTarget::DepthSlice { .. }))),
                0
            );
        }
    }

    #[test]
    fn test_camera_range_change_refreshes_splits_next_frame() {
        let (orchestrator, _log) = orchestrator(small_shadows());
        let id = add_scene(&orchestrator);
        orchestrator.with_world(id, |world| {
            let camera = world.camera_mut().unwrap();
            camera.near = 0.5;
            camera.far = 200.0;
        });
        orchestrator.render_frame().unwrap();

        orchestrator.with_world(id, |world| world.camera_mut().unwrap().far = 50.0);
        orchestrator.render_frame().unwrap();
        orchestrator.with_world(id, |world| {
            assert_eq!(*world.cascades().splits().last().unwrap(), 49.5);
            let count = world.cascades().cascades().len();
            assert_eq!(world.cascades().receiver().splits[count - 1], 50.0);
        });
    }

    #[test]
    fn test_shutdown_releases_resources() {
        let context = RecordingContext::new(64, 64);
        let device = context.recording_device().clone();
        let orchestrator = FrameOrchestrator::new(
            Box::new(context),
            small_shadows(),
            ShaderCache::new(Arc::new(NagaCompiler::new())),
        );
        add_scene(&orchestrator);
        orchestrator.render_frame().unwrap();
        assert!(device.live_buffers() > 0);

        orchestrator.shutdown();
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_stages(), 0);
        assert_eq!(device.live_depth_arrays(), 0);
    }
}
