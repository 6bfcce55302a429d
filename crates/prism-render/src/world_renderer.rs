//! Per-world registry of instanced render objects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use prism_core::{Material, PrimitiveShape};

use crate::camera::Camera;
use crate::constant_buffer::{
    CameraConstants, ConstantBuffer, CAMERA_SLOT, LIGHTING_SLOT, SHADOW_RECEIVER_SLOT,
};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::geometry::Geometry;
use crate::gpu::{BlendMode, DepthState, GpuDevice};
use crate::instance::{RenderObjectId, Renderable};
use crate::instanced::InstancedRenderObject;
use crate::sync::lock;

/// Registry key: geometry by name, material by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ObjectKey {
    geometry: String,
    material: usize,
}

impl ObjectKey {
    fn new(geometry: &Geometry, material: &Arc<Material>) -> Self {
        Self {
            geometry: geometry.name().to_string(),
            material: Arc::as_ptr(material) as usize,
        }
    }
}

#[derive(Default)]
struct Registry {
    /// In creation order.
    objects: Vec<Arc<InstancedRenderObject>>,
    index: HashMap<ObjectKey, usize>,
}

/// Draws the opaque geometry of one world.
///
/// Objects are created on first use of a (geometry, material) pair and drawn
/// in creation order after the four primitive objects. Registry changes and
/// the draw traversal share one lock.
pub struct WorldRenderer {
    registry: Mutex<Registry>,
    primitives: [Arc<InstancedRenderObject>; 4],
    camera: Mutex<ConstantBuffer<CameraConstants>>,
    missing_pass_warned: AtomicBool,
}

impl WorldRenderer {
    pub fn new() -> Self {
        let material = Arc::new(Material::primitive());
        let primitives = PrimitiveShape::ALL.map(|shape| {
            Arc::new(InstancedRenderObject::new(
                Arc::new(Geometry::primitive(shape)),
                material.clone(),
            ))
        });
        Self {
            registry: Mutex::new(Registry::default()),
            primitives,
            camera: Mutex::new(ConstantBuffer::new(
                "world camera",
                CameraConstants::default(),
            )),
            missing_pass_warned: AtomicBool::new(false),
        }
    }

    /// Object drawing `geometry` with `material`, created on first request.
    pub fn object_for(
        &self,
        geometry: &Arc<Geometry>,
        material: &Arc<Material>,
    ) -> Arc<InstancedRenderObject> {
        let key = ObjectKey::new(geometry, material);
        let mut registry = lock(&self.registry);
        if let Some(&index) = registry.index.get(&key) {
            return registry.objects[index].clone();
        }

        let object = Arc::new(InstancedRenderObject::new(
            geometry.clone(),
            material.clone(),
        ));
        log::debug!(
            "new render object {:?} for '{}' / '{}'",
            object.id(),
            geometry.name(),
            material.name
        );
        let index = registry.objects.len();
        registry.objects.push(object.clone());
        registry.index.insert(key, index);
        object
    }

    /// Object drawing a built-in shape.
    pub fn primitive(&self, shape: PrimitiveShape) -> &Arc<InstancedRenderObject> {
        let index = PrimitiveShape::ALL
            .iter()
            .position(|s| *s == shape)
            .unwrap_or_default();
        &self.primitives[index]
    }

    /// Adds `instance` to the object for (`geometry`, `material`).
    pub fn add_instance(
        &self,
        geometry: &Arc<Geometry>,
        material: &Arc<Material>,
        instance: Arc<dyn Renderable>,
    ) -> bool {
        self.object_for(geometry, material).add(instance)
    }

    /// Adds `instance` to a primitive object.
    pub fn add_primitive(&self, shape: PrimitiveShape, instance: Arc<dyn Renderable>) -> bool {
        self.primitive(shape).add(instance)
    }

    /// Removes `instance` from whichever object holds it.
    pub fn remove_instance(&self, instance: &dyn Renderable) -> bool {
        match self.owner_of(instance) {
            Some(object) => object.remove(instance),
            None => false,
        }
    }

    /// Rewrites `instance`'s record in the object holding it.
    pub fn update_instance(&self, instance: &dyn Renderable) {
        if let Some(object) = self.owner_of(instance) {
            object.update_instance(instance);
        }
    }

    fn owner_of(&self, instance: &dyn Renderable) -> Option<Arc<InstancedRenderObject>> {
        let owner: RenderObjectId = instance.render_slot().owner()?;
        if let Some(object) = self.primitives.iter().find(|o| o.id() == owner) {
            return Some(object.clone());
        }
        lock(&self.registry)
            .objects
            .iter()
            .find(|o| o.id() == owner)
            .cloned()
    }

    /// Number of registered (geometry, material) objects.
    pub fn object_count(&self) -> usize {
        lock(&self.registry).objects.len()
    }

    /// Instances across every object, primitives included.
    pub fn instance_count(&self) -> usize {
        let registered: usize = lock(&self.registry)
            .objects
            .iter()
            .map(|o| o.count())
            .sum();
        registered + self.primitives.iter().map(|o| o.count()).sum::<usize>()
    }

    /// Creates the camera constant buffer.
    pub fn bind_to_device(&self, device: &dyn GpuDevice) -> RenderResult<()> {
        lock(&self.camera).bind_to_device(device)
    }

    /// Draws every object.
    ///
    /// The scene pass first sets opaque state, uploads the camera, draws the
    /// sky and binds the world pass with its lighting, receiver and shadow
    /// map. The shadow pass expects the caller to have bound the depth pass
    /// and cascade camera.
    pub fn draw(
        &self,
        ctx: &mut RenderContext<'_>,
        camera: &Camera,
        is_shadow_pass: bool,
    ) -> RenderResult<()> {
        if !is_shadow_pass && !self.bind_scene_state(ctx, camera)? {
            return Ok(());
        }

        for object in &self.primitives {
            object.draw(ctx)?;
        }
        let registry = lock(&self.registry);
        for object in &registry.objects {
            object.draw(ctx)?;
        }
        Ok(())
    }

    /// Returns `false` when no world pass is available.
    fn bind_scene_state(&self, ctx: &mut RenderContext<'_>, camera: &Camera) -> RenderResult<bool> {
        ctx.commands.set_blend_mode(BlendMode::Opaque);
        ctx.commands.set_depth_state(DepthState::OPAQUE);
        ctx.invalidate_state();

        self.upload_camera(ctx, camera)?;
        self.bind_camera(ctx);

        if let Some(sky) = ctx.frame.sky_pass.clone() {
            sky.apply(ctx)?;
            if let Some(lighting) = ctx.frame.lighting {
                ctx.commands.set_constant_buffer(LIGHTING_SLOT, lighting);
            }
            ctx.draw(3);
        }

        let Some(world) = ctx.frame.world_pass.clone() else {
            if !self.missing_pass_warned.swap(true, Ordering::Relaxed) {
                log::warn!("world shader is not loaded; world geometry is not drawn");
            }
            return Ok(false);
        };
        world.apply(ctx)?;
        if let Some(lighting) = ctx.frame.lighting {
            ctx.commands.set_constant_buffer(LIGHTING_SLOT, lighting);
        }
        if let Some(receiver) = ctx.frame.shadow_receiver {
            ctx.commands
                .set_constant_buffer(SHADOW_RECEIVER_SLOT, receiver);
        }
        ctx.commands.set_shadow_map(ctx.frame.shadow_map);
        Ok(true)
    }

    /// Writes `camera` into the world's camera constants.
    pub fn upload_camera(&self, ctx: &mut RenderContext<'_>, camera: &Camera) -> RenderResult<()> {
        let mut constants = lock(&self.camera);
        constants.set(CameraConstants::from_camera(camera));
        constants.update(ctx)
    }

    /// Binds the world's camera constants to slot 0.
    pub fn bind_camera(&self, ctx: &mut RenderContext<'_>) {
        lock(&self.camera).bind(ctx, CAMERA_SLOT);
    }

    /// Destroys every GPU resource the world holds.
    pub fn release(&self, device: &dyn GpuDevice) {
        lock(&self.camera).dispose(device);
        for object in &self.primitives {
            object.release(device);
            object.geometry().release(device);
        }
        for object in &lock(&self.registry).objects {
            object.release(device);
            object.geometry().release(device);
        }
    }
}

impl Default for WorldRenderer {
    fn default() -> Self {
        Self::new()
    }
}
