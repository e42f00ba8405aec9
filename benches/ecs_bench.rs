use criterion::{criterion_group, criterion_main, Criterion};

use hive_ecs::{Component, EntityManager};

#[derive(Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
}
impl Component for Position {}

#[derive(Clone, Copy)]
struct Velocity {
    x: f32,
    y: f32,
}
impl Component for Velocity {}

fn bench_create_entities(c: &mut Criterion) {
    c.bench_function("create_10k_entities", |b| {
        b.iter(|| {
            let mut manager = EntityManager::new();
            let archetype = manager
                .archetype_builder()
                .mark_component::<Position>()
                .mark_component::<Velocity>()
                .build()
                .unwrap();
            for _ in 0..10_000 {
                manager.create_entity_in(archetype).unwrap();
            }
            manager
        });
    });
}

fn bench_component_churn(c: &mut Criterion) {
    c.bench_function("add_remove_component_1k", |b| {
        let mut manager = EntityManager::new();
        let entities: Vec<_> = (0..1_000)
            .map(|_| {
                let entity = manager.create_entity();
                manager
                    .add_component(entity, Position { x: 0.0, y: 0.0 })
                    .unwrap();
                entity
            })
            .collect();
        b.iter(|| {
            for &entity in &entities {
                manager
                    .add_component(entity, Velocity { x: 1.0, y: 1.0 })
                    .unwrap();
            }
            for &entity in &entities {
                manager.remove_component::<Velocity>(entity).unwrap();
            }
        });
    });
}

fn bench_filter_iteration(c: &mut Criterion) {
    let mut manager = EntityManager::new();
    let archetype = manager
        .archetype_builder()
        .mark_component::<Position>()
        .mark_component::<Velocity>()
        .build()
        .unwrap();
    for _ in 0..10_000 {
        let entity = manager.create_entity_in(archetype).unwrap();
        manager
            .set_component(entity, Position { x: 1.0, y: 2.0 })
            .unwrap();
        manager
            .set_component(entity, Velocity { x: 0.1, y: 0.2 })
            .unwrap();
    }
    let filter = manager
        .filter_builder()
        .require::<Position>()
        .require::<Velocity>()
        .build()
        .unwrap();
    let position_id = manager.component_id::<Position>();
    let velocity_id = manager.component_id::<Velocity>();

    c.bench_function("iterate_10k_two_columns", |b| {
        b.iter(|| {
            let mut sum = 0.0f32;
            for accessor in manager.filter_entities(&filter) {
                let positions = accessor.component_array::<Position>(position_id);
                let velocities = accessor.component_array::<Velocity>(velocity_id);
                for at in 0..accessor.entity_count() {
                    sum += positions[at].x + velocities[at].y;
                }
            }
            sum
        });
    });
}

criterion_group!(
    benches,
    bench_create_entities,
    bench_component_churn,
    bench_filter_iteration
);
criterion_main!(benches);
