//! Instanced drawing through the full frame path on the recording backend.

mod common;

use std::sync::Arc;

use prism::*;

fn scene_only() -> RenderOptions {
    RenderOptions {
        passes: PassFlags::SCENE,
        ..RenderOptions::default()
    }
}

fn instanced_draws(log: &CommandLog) -> Vec<(u32, u32)> {
    log.draws()
        .into_iter()
        .filter_map(|c| match c {
            Command::DrawIndexedInstanced {
                index_count,
                instance_count,
            } => Some((index_count, instance_count)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_shared_geometry_and_material_draw_once() {
    let (renderer, log) = recording(320, 240, scene_only()).unwrap();
    let world = renderer.add_world("main");
    let geometry = Arc::new(Geometry::new("crate", PrimitiveShape::Cube.mesh()).unwrap());
    let material = Arc::new(Material::new("wood"));

    renderer.with_world(world, |world| {
        world.set_camera(Some(Camera::new(4.0 / 3.0)));
        for i in 0..3 {
            let instance = Arc::new(SceneInstance::new(Vec3::new(i as f32, 0.0, 0.0)));
            assert!(world.renderer().add_instance(&geometry, &material, instance));
        }
        for shape in PrimitiveShape::ALL {
            world
                .renderer()
                .add_primitive(shape, Arc::new(SceneInstance::new(Vec3::Y)));
        }
    });

    let report = renderer.render_frame().unwrap();
    assert_eq!(report.drawn, 1);

    let draws = instanced_draws(&log);
    assert_eq!(draws.len(), PrimitiveShape::ALL.len() + 1);
    for (shape, (index_count, instance_count)) in PrimitiveShape::ALL.iter().zip(&draws) {
        assert_eq!(*index_count, shape.mesh().indices.len() as u32);
        assert_eq!(*instance_count, 1);
    }
    assert_eq!(draws.last(), Some(&(geometry.index_count(), 3)));
    assert_eq!(log.commands().last(), Some(&Command::Present));
}

#[test]
fn test_removed_instances_stop_drawing() {
    let (renderer, log) = recording(64, 64, scene_only()).unwrap();
    let world = renderer.add_world("main");
    let geometry = Arc::new(Geometry::new("crate", PrimitiveShape::Cube.mesh()).unwrap());
    let material = Arc::new(Material::new("wood"));
    let instances: Vec<Arc<SceneInstance>> = (0..3)
        .map(|i| Arc::new(SceneInstance::new(Vec3::new(i as f32, 0.0, 0.0))))
        .collect();

    let world_renderer = renderer.world_renderer(world).unwrap();
    renderer.with_world(world, |world| world.set_camera(Some(Camera::new(1.0))));
    for instance in &instances {
        world_renderer.add_instance(&geometry, &material, instance.clone());
    }
    renderer.render_frame().unwrap();
    assert_eq!(instanced_draws(&log), vec![(geometry.index_count(), 3)]);

    log.clear();
    assert!(world_renderer.remove_instance(instances[0].as_ref()));
    instances[2].set_translation(Vec3::splat(5.0));
    world_renderer.update_instance(instances[2].as_ref());
    renderer.render_frame().unwrap();
    assert_eq!(instanced_draws(&log), vec![(geometry.index_count(), 2)]);

    log.clear();
    world_renderer.remove_instance(instances[1].as_ref());
    world_renderer.remove_instance(instances[2].as_ref());
    renderer.render_frame().unwrap();
    assert!(instanced_draws(&log).is_empty());
    assert_eq!(world_renderer.instance_count(), 0);
}

#[test]
fn test_full_pass_set_runs_in_order() {
    let options = RenderOptions {
        shadows: ShadowOptions {
            map_size: 64,
            cascade_count: 2,
            ..ShadowOptions::default()
        },
        ..RenderOptions::default()
    };
    let (renderer, log) = recording(128, 128, options).unwrap();
    let world = renderer.add_world("main");
    renderer.with_world(world, |world| {
        world.set_camera(Some(Camera::new(1.0)));
        world
            .renderer()
            .add_primitive(PrimitiveShape::Sphere, Arc::new(SceneInstance::new(Vec3::ZERO)));
    });

    renderer.render_frame().unwrap();
    assert_eq!(
        log.count(|c| matches!(c, Command::ClearDepth(_))),
        3,
        "two cascade slices and the backbuffer"
    );
    let labels: Vec<String> = log
        .commands()
        .into_iter()
        .filter_map(|c| match c {
            Command::BindProgram { label, .. } => Some(label),
            _ => None,
        })
        .collect();
    assert_eq!(
        labels,
        vec![
            "world/depth",
            "sky/sky",
            "world/scene",
            "lighting/haze",
            "post/vignette"
        ]
    );
    renderer.shutdown();
}
