//! In-memory backend.
//!
//! [`RecordingDevice`] keeps buffer contents in host memory and
//! [`RecordingContext`] appends every command to a shared [`CommandLog`].
//! Used by tests and for running the renderer without a GPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use prism_core::PrimitiveTopology;

use crate::error::{RenderError, RenderResult};
use crate::gpu::{
    BlendMode, BufferDescriptor, BufferId, BufferUsage, CommandContext, DepthState, DepthTargetId,
    GpuDevice, HandleAllocator, PassId, ProgramBinding, RenderTarget, ShaderStage, StageId,
};
use crate::sync::lock;

/// One recorded call on a [`RecordingContext`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    WriteBuffer { buffer: BufferId, len: usize },
    SetRenderTarget(RenderTarget),
    ClearColour([f32; 4]),
    ClearDepth(f32),
    BindProgram { pass: PassId, label: String },
    SetBlendMode(BlendMode),
    SetDepthState(DepthState),
    SetConstantBuffer { slot: u32, buffer: BufferId },
    SetShadowMap(Option<DepthTargetId>),
    SetVertexBuffer { slot: u32, buffer: BufferId, stride: u32 },
    SetIndexBuffer(BufferId),
    SetPrimitiveTopology(PrimitiveTopology),
    Draw { vertex_count: u32 },
    DrawIndexedInstanced { index_count: u32, instance_count: u32 },
    ResizeBackbuffer { width: u32, height: u32 },
    Present,
    Flush,
    Discard,
}

impl Command {
    /// Whether this command issues a draw call.
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            Command::Draw { .. } | Command::DrawIndexedInstanced { .. }
        )
    }
}

/// Shared handle to the commands recorded by a context.
#[derive(Debug, Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<Command>>>);

impl CommandLog {
    /// Snapshot of every command recorded so far.
    pub fn commands(&self) -> Vec<Command> {
        lock(&self.0).clone()
    }

    /// Recorded draw calls only.
    pub fn draws(&self) -> Vec<Command> {
        lock(&self.0).iter().filter(|c| c.is_draw()).cloned().collect()
    }

    /// Number of commands matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        lock(&self.0).iter().filter(|c| predicate(c)).count()
    }

    /// Discards the recorded commands.
    pub fn clear(&self) {
        lock(&self.0).clear();
    }

    fn push(&self, command: Command) {
        lock(&self.0).push(command);
    }
}

/// A buffer held in host memory.
#[derive(Debug, Clone)]
pub struct RecordedBuffer {
    pub label: String,
    pub usage: BufferUsage,
    pub contents: Vec<u8>,
}

#[derive(Debug, Default)]
struct Resources {
    buffers: HashMap<BufferId, RecordedBuffer>,
    stages: HashMap<StageId, (ShaderStage, String)>,
    depth_arrays: HashMap<DepthTargetId, (u32, u32)>,
}

/// Device that keeps every resource in host memory.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    handles: HandleAllocator,
    resources: Mutex<Resources>,
    buffers_created: AtomicUsize,
    fail_allocations: AtomicBool,
}

impl RecordingDevice {
    /// Creates an empty device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent buffer and depth-array creation fail.
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Relaxed);
    }

    /// Copy of a live buffer.
    pub fn buffer(&self, id: BufferId) -> Option<RecordedBuffer> {
        lock(&self.resources).buffers.get(&id).cloned()
    }

    /// Current contents of a live buffer.
    pub fn buffer_contents(&self, id: BufferId) -> Option<Vec<u8>> {
        self.buffer(id).map(|b| b.contents)
    }

    /// Number of buffers created over the device's lifetime.
    pub fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::Relaxed)
    }

    pub fn live_buffers(&self) -> usize {
        lock(&self.resources).buffers.len()
    }

    pub fn live_stages(&self) -> usize {
        lock(&self.resources).stages.len()
    }

    pub fn live_depth_arrays(&self) -> usize {
        lock(&self.resources).depth_arrays.len()
    }

    fn write(&self, id: BufferId, data: &[u8]) -> RenderResult<()> {
        let mut resources = lock(&self.resources);
        let buffer = resources
            .buffers
            .get_mut(&id)
            .ok_or(RenderError::UnknownResource {
                kind: BufferId::KIND,
                id: id.0,
            })?;
        if data.len() > buffer.contents.len() {
            return Err(RenderError::BufferWriteOutOfRange {
                buffer: id.0,
                size: buffer.contents.len() as u64,
                len: data.len(),
            });
        }
        buffer.contents[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl GpuDevice for RecordingDevice {
    fn create_buffer(&self, desc: &BufferDescriptor<'_>) -> RenderResult<BufferId> {
        if self.fail_allocations.load(Ordering::Relaxed) {
            return Err(RenderError::BufferCreationFailed(format!(
                "'{}' ({} bytes): allocation refused",
                desc.label, desc.size
            )));
        }
        let size = usize::try_from(desc.size)
            .map_err(|_| RenderError::BufferCreationFailed(desc.label.to_string()))?;
        let id = BufferId(self.handles.next());
        lock(&self.resources).buffers.insert(
            id,
            RecordedBuffer {
                label: desc.label.to_string(),
                usage: desc.usage,
                contents: vec![0; size],
            },
        );
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        lock(&self.resources).buffers.remove(&buffer);
    }

    fn create_shader_stage(
        &self,
        stage: ShaderStage,
        _words: &[u32],
        label: &str,
    ) -> RenderResult<StageId> {
        let id = StageId(self.handles.next());
        lock(&self.resources)
            .stages
            .insert(id, (stage, label.to_string()));
        Ok(id)
    }

    fn destroy_shader_stage(&self, stage: StageId) {
        lock(&self.resources).stages.remove(&stage);
    }

    fn create_depth_array(
        &self,
        size: u32,
        layers: u32,
        label: &str,
    ) -> RenderResult<DepthTargetId> {
        if self.fail_allocations.load(Ordering::Relaxed) {
            return Err(RenderError::BufferCreationFailed(format!(
                "depth array '{label}': allocation refused"
            )));
        }
        let id = DepthTargetId(self.handles.next());
        lock(&self.resources).depth_arrays.insert(id, (size, layers));
        Ok(id)
    }

    fn destroy_depth_array(&self, target: DepthTargetId) {
        lock(&self.resources).depth_arrays.remove(&target);
    }
}

/// Command context that records instead of submitting.
pub struct RecordingContext {
    device: Arc<RecordingDevice>,
    log: CommandLog,
    size: (u32, u32),
    presented: usize,
}

impl RecordingContext {
    /// Creates a context with its own device.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_device(Arc::new(RecordingDevice::new()), width, height)
    }

    /// Creates a context submitting to `device`.
    pub fn with_device(device: Arc<RecordingDevice>, width: u32, height: u32) -> Self {
        Self {
            device,
            log: CommandLog::default(),
            size: (width, height),
            presented: 0,
        }
    }

    /// Handle to the command log. Stays valid after the context is boxed.
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    /// The recording device.
    pub fn recording_device(&self) -> &Arc<RecordingDevice> {
        &self.device
    }

    /// Number of presented frames.
    pub fn presented_frames(&self) -> usize {
        self.presented
    }
}

impl CommandContext for RecordingContext {
    fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }

    fn write_buffer(&mut self, buffer: BufferId, data: &[u8]) -> RenderResult<()> {
        self.device.write(buffer, data)?;
        self.log.push(Command::WriteBuffer {
            buffer,
            len: data.len(),
        });
        Ok(())
    }

    fn set_render_target(&mut self, target: RenderTarget) {
        self.log.push(Command::SetRenderTarget(target));
    }

    fn clear_colour(&mut self, colour: [f32; 4]) {
        self.log.push(Command::ClearColour(colour));
    }

    fn clear_depth(&mut self, depth: f32) {
        self.log.push(Command::ClearDepth(depth));
    }

    fn bind_program(&mut self, program: &Arc<ProgramBinding>) {
        self.log.push(Command::BindProgram {
            pass: program.pass,
            label: program.label.clone(),
        });
    }

    fn set_blend_mode(&mut self, mode: BlendMode) {
        self.log.push(Command::SetBlendMode(mode));
    }

    fn set_depth_state(&mut self, state: DepthState) {
        self.log.push(Command::SetDepthState(state));
    }

    fn set_constant_buffer(&mut self, slot: u32, buffer: BufferId) {
        self.log.push(Command::SetConstantBuffer { slot, buffer });
    }

    fn set_shadow_map(&mut self, target: Option<DepthTargetId>) {
        self.log.push(Command::SetShadowMap(target));
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferId, stride: u32) {
        self.log.push(Command::SetVertexBuffer {
            slot,
            buffer,
            stride,
        });
    }

    fn set_index_buffer(&mut self, buffer: BufferId) {
        self.log.push(Command::SetIndexBuffer(buffer));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.log.push(Command::SetPrimitiveTopology(topology));
    }

    fn draw(&mut self, vertex_count: u32) {
        self.log.push(Command::Draw { vertex_count });
    }

    fn draw_indexed_instanced(&mut self, index_count: u32, instance_count: u32) {
        self.log.push(Command::DrawIndexedInstanced {
            index_count,
            instance_count,
        });
    }

    fn resize_backbuffer(&mut self, width: u32, height: u32) -> RenderResult<()> {
        self.size = (width.max(1), height.max(1));
        self.log.push(Command::ResizeBackbuffer { width, height });
        Ok(())
    }

    fn backbuffer_size(&self) -> (u32, u32) {
        self.size
    }

    fn present(&mut self) -> RenderResult<()> {
        self.presented += 1;
        self.log.push(Command::Present);
        Ok(())
    }

    fn flush(&mut self) -> RenderResult<()> {
        self.log.push(Command::Flush);
        Ok(())
    }

    fn discard(&mut self) {
        self.log.push(Command::Discard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_buffer_updates_contents() {
        let mut ctx = RecordingContext::new(8, 8);
        let id = ctx
            .device()
            .create_buffer(&BufferDescriptor {
                label: "test",
                size: 8,
                usage: BufferUsage::Constant,
            })
            .unwrap();
        ctx.write_buffer(id, &[1, 2, 3, 4]).unwrap();

        let contents = ctx.recording_device().buffer_contents(id).unwrap();
        assert_eq!(contents, vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(
            ctx.log().commands(),
            vec![Command::WriteBuffer { buffer: id, len: 4 }]
        );
    }

    #[test]
    fn test_write_past_end_fails() {
        let mut ctx = RecordingContext::new(8, 8);
        let id = ctx
            .device()
            .create_buffer(&BufferDescriptor {
                label: "small",
                size: 4,
                usage: BufferUsage::Vertex,
            })
            .unwrap();
        assert!(matches!(
            ctx.write_buffer(id, &[0; 8]),
            Err(RenderError::BufferWriteOutOfRange { .. })
        ));
    }

    #[test]
    fn test_write_to_destroyed_buffer_fails() {
        let mut ctx = RecordingContext::new(8, 8);
        let id = ctx
            .device()
            .create_buffer(&BufferDescriptor {
                label: "gone",
                size: 4,
                usage: BufferUsage::Vertex,
            })
            .unwrap();
        ctx.device().destroy_buffer(id);
        assert!(matches!(
            ctx.write_buffer(id, &[0; 4]),
            Err(RenderError::UnknownResource { .. })
        ));
    }

    #[test]
    fn test_failed_allocation() {
        let device = RecordingDevice::new();
        device.set_fail_allocations(true);
        let result = device.create_buffer(&BufferDescriptor {
            label: "instances",
            size: 112,
            usage: BufferUsage::Vertex,
        });
        assert!(matches!(result, Err(RenderError::BufferCreationFailed(_))));
        assert_eq!(device.buffers_created(), 0);
    }
}
