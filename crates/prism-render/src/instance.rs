//! Drawable instances and their render-object back-references.
//!
//! An instance does not own its place in a render object. It carries a
//! [`RenderSlot`]: the id of the object holding it and its index in that
//! object's dense array. Only render objects change a slot; detaching sets
//! the index to `-1` and clears the owner.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

use glam::{Mat4, Quat, Vec3, Vec4};
use prism_core::{InstanceRenderData, Material};

use crate::sync::{read, write};

/// Identity of an instanced render object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderObjectId(pub u64);

/// Where an instance lives: owning object and index in its dense array.
#[derive(Debug)]
pub struct RenderSlot {
    owner: AtomicU64,
    index: AtomicI64,
}

impl RenderSlot {
    pub const DETACHED: i64 = -1;

    pub const fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
            index: AtomicI64::new(Self::DETACHED),
        }
    }

    /// Index in the owner's dense array, `-1` when detached.
    pub fn index(&self) -> i64 {
        self.index.load(Ordering::Acquire)
    }

    /// Owning render object, if attached.
    pub fn owner(&self) -> Option<RenderObjectId> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            id => Some(RenderObjectId(id)),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.index() != Self::DETACHED
    }

    /// Takes the slot for `owner`. Fails when any object already holds it,
    /// including one that has claimed it but not yet set the index.
    pub(crate) fn try_claim(&self, owner: RenderObjectId) -> bool {
        self.owner
            .compare_exchange(0, owner.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_index(&self, index: usize) {
        self.index.store(index as i64, Ordering::Release);
    }

    pub(crate) fn detach(&self) {
        self.index.store(Self::DETACHED, Ordering::Release);
        self.owner.store(0, Ordering::Release);
    }
}

impl Default for RenderSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Something drawn through an instanced render object.
///
/// Implementors are owned by the game side and shared with the renderer
/// through `Arc`. `render_data` may be called from the render thread while
/// game threads mutate the instance.
pub trait Renderable: Send + Sync {
    /// Back-reference maintained by the render object.
    fn render_slot(&self) -> &RenderSlot;

    /// Current per-instance record.
    fn render_data(&self) -> InstanceRenderData;
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    translation: Vec3,
    rotation: Quat,
    size: Vec3,
    colour: Vec4,
    material_index: u32,
}

/// Ready-made [`Renderable`]: a transform, size, colour and material index.
///
/// Setters only change the stored values; call
/// `WorldRenderer::update_instance` afterwards so the change reaches the
/// instance buffer.
#[derive(Debug)]
pub struct SceneInstance {
    slot: RenderSlot,
    placement: RwLock<Placement>,
}

impl SceneInstance {
    /// Unit-sized white instance at `translation`.
    pub fn new(translation: Vec3) -> Self {
        Self {
            slot: RenderSlot::new(),
            placement: RwLock::new(Placement {
                translation,
                rotation: Quat::IDENTITY,
                size: Vec3::ONE,
                colour: Vec4::ONE,
                material_index: 0,
            }),
        }
    }

    /// Takes colour and packed index from `material`.
    #[must_use]
    pub fn with_material(self, material: &Material) -> Self {
        self.set_material(material);
        self
    }

    #[must_use]
    pub fn with_size(self, size: Vec3) -> Self {
        self.set_size(size);
        self
    }

    #[must_use]
    pub fn with_rotation(self, rotation: Quat) -> Self {
        self.set_rotation(rotation);
        self
    }

    pub fn translation(&self) -> Vec3 {
        read(&self.placement).translation
    }

    pub fn set_translation(&self, translation: Vec3) {
        write(&self.placement).translation = translation;
    }

    pub fn set_rotation(&self, rotation: Quat) {
        write(&self.placement).rotation = rotation;
    }

    pub fn set_size(&self, size: Vec3) {
        write(&self.placement).size = size;
    }

    pub fn set_colour(&self, colour: Vec4) {
        write(&self.placement).colour = colour;
    }

    pub fn set_material(&self, material: &Material) {
        let mut placement = write(&self.placement);
        placement.colour = Vec4::from_array(material.colour);
        placement.material_index = material.packed_index();
    }
}

impl Renderable for SceneInstance {
    fn render_slot(&self) -> &RenderSlot {
        &self.slot
    }

    fn render_data(&self) -> InstanceRenderData {
        let placement = *read(&self.placement);
        InstanceRenderData::new(
            Mat4::from_rotation_translation(placement.rotation, placement.translation),
            placement.size,
            placement.colour,
            placement.material_index,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::ShaderVariant;

    #[test]
    fn test_new_slot_is_detached() {
        let slot = RenderSlot::new();
        assert_eq!(slot.index(), RenderSlot::DETACHED);
        assert_eq!(slot.owner(), None);
        assert!(!slot.is_attached());
    }

    #[test]
    fn test_claim_set_index_and_detach() {
        let slot = RenderSlot::new();
        assert!(slot.try_claim(RenderObjectId(3)));
        assert!(!slot.try_claim(RenderObjectId(4)));
        slot.set_index(5);
        assert_eq!(slot.index(), 5);
        assert_eq!(slot.owner(), Some(RenderObjectId(3)));
        slot.detach();
        assert!(!slot.is_attached());
        assert_eq!(slot.owner(), None);
        assert!(slot.try_claim(RenderObjectId(4)));
    }

    #[test]
    fn test_scene_instance_render_data() {
        let material = Material::flat("red", [1.0, 0.0, 0.0, 1.0]).with_index(7);
        let instance = SceneInstance::new(Vec3::new(1.0, 2.0, 3.0))
            .with_size(Vec3::splat(2.0))
            .with_material(&material);

        let data = instance.render_data();
        assert_eq!(data.model_matrix().w_axis.truncate(), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(data.size, [2.0, 2.0, 2.0, 0.0]);
        assert_eq!(data.colour, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(data.material_index >> 24, ShaderVariant::Flat.code());
        assert_eq!(data.material_index & 0xFF_FFFF, 7);
    }
}
