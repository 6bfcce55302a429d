//! Per-frame render context.
//!
//! A [`RenderContext`] is created by the frame orchestrator for every world it
//! draws and passed by reference to everything that records commands. It
//! caches the active pass and topology so redundant binds are skipped.

use std::sync::Arc;

use prism_core::PrimitiveTopology;

use crate::gpu::{BufferId, CommandContext, DepthTargetId, GpuDevice, PassId};
use crate::shader::ShaderPass;

/// Frame-wide shader and resource bindings for one world.
#[derive(Clone, Default)]
pub struct FrameBindings {
    /// Pass used for lit world geometry.
    pub world_pass: Option<Arc<ShaderPass>>,
    /// Depth-only pass used for shadow casters.
    pub depth_pass: Option<Arc<ShaderPass>>,
    /// Pass used for the sky backdrop.
    pub sky_pass: Option<Arc<ShaderPass>>,
    /// Lighting constants (slot 1).
    pub lighting: Option<BufferId>,
    /// Shadow receiver constants (slot 2).
    pub shadow_receiver: Option<BufferId>,
    /// Cascade depth array sampled by the world pass.
    pub shadow_map: Option<DepthTargetId>,
}

/// Counters for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub draw_calls: u32,
    pub instances: u32,
    pub program_binds: u32,
}

/// Render context passed through every draw call.
pub struct RenderContext<'a> {
    /// The command context of the device.
    pub commands: &'a mut dyn CommandContext,
    /// Frame-wide bindings.
    pub frame: FrameBindings,
    /// Counters.
    pub stats: FrameStats,
    current_pass: Option<PassId>,
    current_topology: Option<PrimitiveTopology>,
}

impl<'a> RenderContext<'a> {
    /// Creates a context with an empty state cache.
    pub fn new(commands: &'a mut dyn CommandContext, frame: FrameBindings) -> Self {
        Self {
            commands,
            frame,
            stats: FrameStats::default(),
            current_pass: None,
            current_topology: None,
        }
    }

    /// The device behind the command context.
    pub fn device(&self) -> &dyn GpuDevice {
        self.commands.device()
    }

    /// Pass bound by the last `ShaderPass::apply`.
    pub fn current_pass(&self) -> Option<PassId> {
        self.current_pass
    }

    pub(crate) fn set_current_pass(&mut self, pass: PassId) {
        self.current_pass = Some(pass);
        self.stats.program_binds += 1;
    }

    /// Topology bound by the last [`Self::set_topology`].
    pub fn current_topology(&self) -> Option<PrimitiveTopology> {
        self.current_topology
    }

    /// Binds `topology` unless it is already bound.
    pub fn set_topology(&mut self, topology: PrimitiveTopology) {
        if self.current_topology != Some(topology) {
            self.commands.set_primitive_topology(topology);
            self.current_topology = Some(topology);
        }
    }

    /// Forgets the cached pass and topology so the next binds are issued.
    pub fn invalidate_state(&mut self) {
        self.current_pass = None;
        self.current_topology = None;
    }

    /// Indexed-instanced draw with statistics.
    pub fn draw_indexed_instanced(&mut self, index_count: u32, instance_count: u32) {
        self.commands.draw_indexed_instanced(index_count, instance_count);
        self.stats.draw_calls += 1;
        self.stats.instances += instance_count;
    }

    /// Non-indexed draw with statistics.
    pub fn draw(&mut self, vertex_count: u32) {
        self.commands.draw(vertex_count);
        self.stats.draw_calls += 1;
        self.stats.instances += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{Command, RecordingContext};

    #[test]
    fn test_topology_switches_only_on_change() {
        let mut commands = RecordingContext::new(64, 64);
        let log = commands.log();
        let mut ctx = RenderContext::new(&mut commands, FrameBindings::default());

        ctx.set_topology(PrimitiveTopology::TriangleList);
        ctx.set_topology(PrimitiveTopology::TriangleList);
        ctx.set_topology(PrimitiveTopology::LineList);

        let topology_changes = log
            .commands()
            .into_iter()
            .filter(|c| matches!(c, Command::SetPrimitiveTopology(_)))
            .count();
        assert_eq!(topology_changes, 2);
    }

    #[test]
    fn test_stats_count_draws() {
        let mut commands = RecordingContext::new(64, 64);
        let mut ctx = RenderContext::new(&mut commands, FrameBindings::default());
        ctx.draw(3);
        ctx.draw_indexed_instanced(36, 5);
        assert_eq!(ctx.stats.draw_calls, 2);
        assert_eq!(ctx.stats.instances, 6);
    }
}
