//! Instanced render objects.
//!
//! One object draws every instance of a (geometry, material) pair with a
//! single indexed-instanced draw. Instances live in a dense array; the CPU
//! mirror holds their packed records at the same indices and is uploaded in
//! full whenever it changed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use prism_core::{InstanceRenderData, Material, Vertex};

use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::geometry::Geometry;
use crate::gpu::{BufferDescriptor, BufferId, BufferUsage, GpuDevice};
use crate::instance::{RenderObjectId, Renderable};
use crate::shader::{INSTANCE_SLOT, VERTEX_SLOT};
use crate::sync::lock;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

const STRIDE: usize = InstanceRenderData::STRIDE;

/// Removes `items[index]` by moving the last element into its place.
///
/// `on_move` is called with the moved element and its new index. Returns
/// `None` when `index` is out of range.
pub fn swap_remove_indexed<T>(
    items: &mut Vec<T>,
    index: usize,
    on_move: impl FnOnce(&T, usize),
) -> Option<T> {
    if index >= items.len() {
        return None;
    }
    let removed = items.swap_remove(index);
    if let Some(moved) = items.get(index) {
        on_move(moved, index);
    }
    Some(removed)
}

#[derive(Default)]
struct InstanceStore {
    instances: Vec<Arc<dyn Renderable>>,
    /// `STRIDE * capacity` bytes.
    mirror: Vec<u8>,
    buffer: Option<BufferId>,
    /// Instances the GPU buffer holds.
    gpu_capacity: usize,
    dirty: bool,
}

impl InstanceStore {
    fn capacity(&self) -> usize {
        self.mirror.len() / STRIDE
    }

    fn write_slot(&mut self, index: usize, data: &InstanceRenderData) {
        let start = index * STRIDE;
        self.mirror[start..start + STRIDE].copy_from_slice(data.as_bytes());
        self.dirty = true;
    }

    /// Grows the mirror to double the required size when it cannot hold
    /// `required` instances (at least one). Existing bytes are kept.
    fn grow_mirror(&mut self, required: usize) {
        let required = required.max(1);
        if self.capacity() >= required {
            return;
        }
        let mut grown = vec![0u8; required * 2 * STRIDE];
        grown[..self.mirror.len()].copy_from_slice(&self.mirror);
        log::debug!(
            "instance mirror grows from {} to {} instances",
            self.capacity(),
            required * 2
        );
        self.mirror = grown;
    }
}

/// All instances of one geometry drawn with one material.
pub struct InstancedRenderObject {
    id: RenderObjectId,
    geometry: Arc<Geometry>,
    material: Arc<Material>,
    store: Mutex<InstanceStore>,
}

impl InstancedRenderObject {
    pub fn new(geometry: Arc<Geometry>, material: Arc<Material>) -> Self {
        Self {
            id: RenderObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            geometry,
            material,
            store: Mutex::new(InstanceStore::default()),
        }
    }

    pub fn id(&self) -> RenderObjectId {
        self.id
    }

    pub fn geometry(&self) -> &Arc<Geometry> {
        &self.geometry
    }

    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }

    /// Number of attached instances.
    pub fn count(&self) -> usize {
        lock(&self.store).instances.len()
    }

    /// Instances the CPU mirror can hold.
    pub fn capacity(&self) -> usize {
        lock(&self.store).capacity()
    }

    /// Size of the CPU mirror in bytes.
    pub fn capacity_bytes(&self) -> usize {
        lock(&self.store).mirror.len()
    }

    /// Whether the mirror has changes not yet uploaded.
    pub fn is_dirty(&self) -> bool {
        lock(&self.store).dirty
    }

    /// The instance buffer, once built.
    pub fn gpu_buffer(&self) -> Option<BufferId> {
        lock(&self.store).buffer
    }

    /// Snapshot of the dense instance array.
    pub fn instances(&self) -> Vec<Arc<dyn Renderable>> {
        lock(&self.store).instances.clone()
    }

    /// Record stored in the mirror at `index`.
    pub fn mirror_record(&self, index: usize) -> Option<InstanceRenderData> {
        let store = lock(&self.store);
        if index >= store.instances.len() {
            return None;
        }
        let start = index * STRIDE;
        Some(bytemuck::pod_read_unaligned(
            &store.mirror[start..start + STRIDE],
        ))
    }

    /// Appends `instance`. Returns `false` (and changes nothing) when the
    /// instance is already held by an object.
    ///
    /// The slot is claimed atomically, so concurrent adds of one instance
    /// attach it exactly once.
    pub fn add(&self, instance: Arc<dyn Renderable>) -> bool {
        if !instance.render_slot().try_claim(self.id) {
            log::warn!(
                "instance already attached to {:?}; not adding to {:?}",
                instance.render_slot().owner(),
                self.id
            );
            return false;
        }

        let mut store = lock(&self.store);
        let index = store.instances.len();
        store.grow_mirror(index + 1);
        instance.render_slot().set_index(index);
        let data = instance.render_data();
        store.instances.push(instance);
        store.write_slot(index, &data);
        true
    }

    /// Detaches `instance`, moving the last instance into its slot.
    ///
    /// An instance that is not where its slot says is left alone and the
    /// inconsistency logged. Returns whether the instance was removed.
    pub fn remove(&self, instance: &dyn Renderable) -> bool {
        let mut store = lock(&self.store);
        if store.instances.is_empty() {
            return false;
        }

        let slot = instance.render_slot();
        let index = slot.index();
        let consistent = slot.owner() == Some(self.id)
            && usize::try_from(index)
                .ok()
                .and_then(|i| store.instances.get(i))
                .is_some_and(|held| same_instance(held.as_ref(), instance));
        if !consistent {
            log::warn!(
                "remove from {:?}: instance index {index} (owner {:?}) does not match the instance array of {} entries",
                self.id,
                slot.owner(),
                store.instances.len()
            );
            return false;
        }

        let index = index as usize;
        let removed = swap_remove_indexed(&mut store.instances, index, |moved, new_index| {
            moved.render_slot().set_index(new_index);
        });
        if removed.is_none() {
            return false;
        }
        slot.detach();

        if let Some(moved) = store.instances.get(index) {
            let data = moved.render_data();
            store.write_slot(index, &data);
        } else {
            store.dirty = true;
        }
        true
    }

    /// Rewrites `instance`'s record. Detached instances, instances of other
    /// objects and objects without a mirror are ignored.
    pub fn update_instance(&self, instance: &dyn Renderable) {
        let slot = instance.render_slot();
        if !slot.is_attached() || slot.owner() != Some(self.id) {
            return;
        }
        let mut store = lock(&self.store);
        if store.mirror.is_empty() {
            return;
        }
        let Ok(index) = usize::try_from(slot.index()) else {
            return;
        };
        if index < store.instances.len() {
            let data = instance.render_data();
            store.write_slot(index, &data);
        }
    }

    /// Makes the mirror and the GPU buffer hold every instance (at least
    /// one), doubling the required size on growth. Never shrinks.
    pub fn expand_buffers(&self, device: &dyn GpuDevice) -> RenderResult<()> {
        let mut store = lock(&self.store);
        Self::expand(&mut store, &self.geometry, device)
    }

    fn expand(
        store: &mut InstanceStore,
        geometry: &Geometry,
        device: &dyn GpuDevice,
    ) -> RenderResult<()> {
        let count = store.instances.len();
        store.grow_mirror(count);
        if store.buffer.is_some() && store.gpu_capacity >= store.capacity() {
            return Ok(());
        }

        let label = format!("{} instances", geometry.name());
        let buffer = device.create_buffer(&BufferDescriptor {
            label: &label,
            size: store.mirror.len() as u64,
            usage: BufferUsage::Vertex,
        })?;
        if let Some(old) = store.buffer.replace(buffer) {
            device.destroy_buffer(old);
        }
        log::debug!(
            "{label}: instance buffer holds {} (was {})",
            store.capacity(),
            store.gpu_capacity
        );
        store.gpu_capacity = store.capacity();
        store.dirty = true;
        Ok(())
    }

    /// Uploads pending changes and draws every instance.
    pub fn draw(&self, ctx: &mut RenderContext<'_>) -> RenderResult<()> {
        let mut store = lock(&self.store);
        let geometry = self.geometry.buffers(ctx)?;
        Self::expand(&mut store, &self.geometry, ctx.device())?;
        let Some(buffer) = store.buffer else {
            return Ok(());
        };

        if store.dirty {
            ctx.commands.write_buffer(buffer, &store.mirror)?;
            store.dirty = false;
        }

        let count = store.instances.len();
        if count == 0 {
            return Ok(());
        }

        ctx.commands
            .set_vertex_buffer(VERTEX_SLOT, geometry.vertices, Vertex::STRIDE);
        ctx.commands
            .set_vertex_buffer(INSTANCE_SLOT, buffer, STRIDE as u32);
        ctx.commands.set_index_buffer(geometry.indices);
        ctx.set_topology(self.geometry.topology());
        ctx.draw_indexed_instanced(geometry.index_count, count as u32);
        Ok(())
    }

    /// Destroys the instance buffer. The next draw rebuilds it.
    pub fn release(&self, device: &dyn GpuDevice) {
        let mut store = lock(&self.store);
        if let Some(buffer) = store.buffer.take() {
            device.destroy_buffer(buffer);
        }
        store.gpu_capacity = 0;
        store.dirty = true;
    }
}

fn same_instance(a: &dyn Renderable, b: &dyn Renderable) -> bool {
    std::ptr::addr_eq(a as *const dyn Renderable, b as *const dyn Renderable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{Command, RecordingContext};
    use crate::context::FrameBindings;
    use crate::instance::{RenderSlot, SceneInstance};
    use prism_core::{PrimitiveShape, PrimitiveTopology, Vec3};
    use proptest::prelude::*;

    fn object() -> InstancedRenderObject {
        InstancedRenderObject::new(
            Arc::new(Geometry::primitive(PrimitiveShape::Cube)),
            Arc::new(Material::default()),
        )
    }

    fn instance(x: f32) -> Arc<SceneInstance> {
        Arc::new(SceneInstance::new(Vec3::new(x, 0.0, 0.0)))
    }

    #[test]
    fn test_swap_remove_indexed_reports_moved_element() {
        let mut items = vec!['a', 'b', 'c', 'd'];
        let mut moved = None;
        let removed = swap_remove_indexed(&mut items, 1, |item, index| moved = Some((*item, index)));
        assert_eq!(removed, Some('b'));
        assert_eq!(items, vec!['a', 'd', 'c']);
        assert_eq!(moved, Some(('d', 1)));
    }

    #[test]
    fn test_swap_remove_indexed_last_moves_nothing() {
        let mut items = vec![1, 2];
        let mut called = false;
        assert_eq!(swap_remove_indexed(&mut items, 1, |_, _| called = true), Some(2));
        assert!(!called);
        assert_eq!(swap_remove_indexed(&mut items, 5, |_, _| called = true), None);
    }

    #[test]
    fn test_add_sets_slot_and_mirror() {
        let object = object();
        let a = instance(1.0);
        let b = instance(2.0);
        assert!(object.add(a.clone()));
        assert!(object.add(b.clone()));

        assert_eq!(a.render_slot().index(), 0);
        assert_eq!(b.render_slot().index(), 1);
        assert_eq!(b.render_slot().owner(), Some(object.id()));
        assert_eq!(object.mirror_record(1), Some(b.render_data()));
        assert!(object.is_dirty());
    }

    #[test]
    fn test_add_attached_instance_is_refused() {
        let first = object();
        let second = object();
        let a = instance(0.0);
        assert!(first.add(a.clone()));
        assert!(!second.add(a.clone()));
        assert_eq!(second.count(), 0);
        assert_eq!(a.render_slot().owner(), Some(first.id()));
    }

    /// Slow to produce its record, so a second `add` lands while the first
    /// still holds the store.
    struct SlowInstance {
        slot: RenderSlot,
        gate: std::sync::Barrier,
    }

    impl Renderable for SlowInstance {
        fn render_slot(&self) -> &RenderSlot {
            &self.slot
        }

        fn render_data(&self) -> InstanceRenderData {
            std::thread::sleep(std::time::Duration::from_millis(20));
            InstanceRenderData::default()
        }
    }

    #[test]
    fn test_concurrent_add_attaches_once() {
        let object = Arc::new(object());
        let shared = Arc::new(SlowInstance {
            slot: RenderSlot::new(),
            gate: std::sync::Barrier::new(2),
        });

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let object = object.clone();
                let shared = shared.clone();
                std::thread::spawn(move || {
                    shared.gate.wait();
                    object.add(shared.clone())
                })
            })
            .collect();
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|added| **added).count(), 1);
        assert_eq!(object.count(), 1);
        assert_eq!(shared.render_slot().index(), 0);
        assert!(object.remove(shared.as_ref()));
        assert_eq!(object.count(), 0);
    }

    #[test]
    fn test_remove_moves_last_into_hole() {
        let object = object();
        let items: Vec<_> = (0..3).map(|i| instance(i as f32)).collect();
        for item in &items {
            object.add(item.clone());
        }

        assert!(object.remove(items[0].as_ref()));
        assert_eq!(object.count(), 2);
        assert_eq!(items[0].render_slot().index(), RenderSlot::DETACHED);
        assert_eq!(items[0].render_slot().owner(), None);
        assert_eq!(items[2].render_slot().index(), 0);
        assert_eq!(object.mirror_record(0), Some(items[2].render_data()));
    }

    #[test]
    fn test_remove_from_empty_is_noop() {
        let object = object();
        let a = instance(0.0);
        assert!(!object.remove(a.as_ref()));
    }

    #[test]
    fn test_remove_inconsistent_index_is_logged_not_fatal() {
        let object = object();
        let a = instance(0.0);
        let b = instance(1.0);
        object.add(a.clone());
        object.add(b.clone());

        // Simulates a racing mutation that left a stale index behind.
        a.render_slot().set_index(7);
        assert!(!object.remove(a.as_ref()));
        assert_eq!(object.count(), 2);
    }

    #[test]
    fn test_update_detached_instance_is_noop() {
        let object = object();
        let a = instance(0.0);
        object.update_instance(a.as_ref());
        assert_eq!(object.capacity_bytes(), 0);
        assert!(!object.is_dirty());
    }

    #[test]
    fn test_update_rewrites_slot() {
        let object = object();
        let a = instance(0.0);
        object.add(a.clone());
        a.set_translation(Vec3::new(4.0, 5.0, 6.0));
        object.update_instance(a.as_ref());
        assert_eq!(object.mirror_record(0), Some(a.render_data()));
    }

    #[test]
    fn test_expand_allocates_at_least_one_instance() {
        let commands = RecordingContext::new(8, 8);
        let device = commands.recording_device().clone();
        let object = object();
        object.expand_buffers(device.as_ref()).unwrap();
        assert_eq!(object.capacity(), 2);
        let buffer = object.gpu_buffer().unwrap();
        assert_eq!(
            device.buffer_contents(buffer).unwrap().len(),
            2 * InstanceRenderData::STRIDE
        );
    }

    #[test]
    fn test_allocation_failure_propagates() {
        let commands = RecordingContext::new(8, 8);
        let device = commands.recording_device().clone();
        device.set_fail_allocations(true);
        let object = object();
        object.add(instance(0.0));
        assert!(object.expand_buffers(device.as_ref()).is_err());
    }

    #[test]
    fn test_draw_issues_one_instanced_call() {
        let mut commands = RecordingContext::new(8, 8);
        let log = commands.log();
        let mut ctx = RenderContext::new(&mut commands, FrameBindings::default());

        let object = object();
        for i in 0..3 {
            object.add(instance(i as f32));
        }
        object.draw(&mut ctx).unwrap();

        assert_eq!(
            log.draws(),
            vec![Command::DrawIndexedInstanced {
                index_count: 36,
                instance_count: 3
            }]
        );
        assert!(!object.is_dirty());
        assert_eq!(ctx.current_topology(), Some(PrimitiveTopology::TriangleList));
    }

    #[test]
    fn test_clean_draw_skips_upload() {
        let mut commands = RecordingContext::new(8, 8);
        let log = commands.log();
        let mut ctx = RenderContext::new(&mut commands, FrameBindings::default());

        let object = object();
        object.add(instance(0.0));
        object.draw(&mut ctx).unwrap();
        let buffer = object.gpu_buffer().unwrap();
        object.draw(&mut ctx).unwrap();

        let uploads = log.count(|c| matches!(c, Command::WriteBuffer { buffer: b, .. } if *b == buffer));
        assert_eq!(uploads, 1);
    }

    #[test]
    fn test_removing_only_instance_draws_nothing() {
        let mut commands = RecordingContext::new(8, 8);
        let log = commands.log();
        let mut ctx = RenderContext::new(&mut commands, FrameBindings::default());

        let object = object();
        let a = instance(0.0);
        object.add(a.clone());
        object.remove(a.as_ref());
        assert_eq!(object.count(), 0);

        object.draw(&mut ctx).unwrap();
        assert!(log.draws().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add,
        Remove(usize),
        Move(usize, f32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Add),
            2 => any::<usize>().prop_map(Op::Remove),
            1 => (any::<usize>(), -100.0f32..100.0).prop_map(|(i, x)| Op::Move(i, x)),
        ]
    }

    proptest! {
        #[test]
        fn prop_indices_and_mirror_match_dense_array(ops in prop::collection::vec(op(), 0..64)) {
            let object = object();
            let mut pool: Vec<Arc<SceneInstance>> = Vec::new();
            let mut capacity = 0;

            for op in ops {
                match op {
                    Op::Add => {
                        let item = instance(pool.len() as f32);
                        object.add(item.clone());
                        pool.push(item);
                    }
                    Op::Remove(i) if !pool.is_empty() => {
                        let item = &pool[i % pool.len()];
                        object.remove(item.as_ref());
                    }
                    Op::Move(i, x) if !pool.is_empty() => {
                        let item = &pool[i % pool.len()];
                        item.set_translation(Vec3::new(x, 1.0, 2.0));
                        object.update_instance(item.as_ref());
                    }
                    _ => {}
                }
                prop_assert!(object.capacity() >= capacity);
                capacity = object.capacity();
            }

            let dense = object.instances();
            prop_assert_eq!(dense.len(), object.count());
            prop_assert!(object.capacity_bytes() >= InstanceRenderData::STRIDE * dense.len());
            for (position, item) in dense.iter().enumerate() {
                prop_assert_eq!(item.render_slot().index(), position as i64);
                prop_assert_eq!(object.mirror_record(position), Some(item.render_data()));
            }
            let attached = pool.iter().filter(|i| i.render_slot().is_attached()).count();
            prop_assert_eq!(attached, dense.len());
        }
    }
}
