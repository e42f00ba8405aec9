//! Structural invariants under churn: location integrity, archetype
//! uniqueness, chunk packing, round-trip add/remove, id versioning.

use hive_ecs::{Component, EcsError, EntityManager, World};

#[derive(Clone, Copy, PartialEq, Debug)]
struct Position {
    x: f32,
    y: f32,
}
impl Component for Position {}

#[derive(Clone, Copy, PartialEq, Debug)]
struct Velocity {
    x: f32,
}
impl Component for Velocity {}

#[derive(Clone, Copy, PartialEq, Debug)]
struct Flag(u8);
impl Component for Flag {}

#[test]
fn test_archetypes_are_unique_per_signature() {
    let mut manager = EntityManager::new();
    let forward = manager
        .archetype_builder()
        .mark_component::<Position>()
        .mark_component::<Velocity>()
        .build()
        .unwrap();
    let backward = manager
        .archetype_builder()
        .mark_component::<Velocity>()
        .mark_component::<Position>()
        .build()
        .unwrap();
    assert_eq!(forward, backward);
}

#[test]
fn test_add_remove_round_trip_preserves_archetype_and_data() {
    let mut manager = EntityManager::new();
    let entity = manager.create_entity();
    manager.add_component(entity, Position { x: 1.5, y: -2.0 }).unwrap();
    manager.add_component(entity, Velocity { x: 0.25 }).unwrap();
    let original_archetype = manager.entity_archetype(entity).unwrap();

    manager.add_component(entity, Flag(9)).unwrap();
    assert_ne!(manager.entity_archetype(entity).unwrap(), original_archetype);
    manager.remove_component::<Flag>(entity).unwrap();

    assert_eq!(manager.entity_archetype(entity).unwrap(), original_archetype);
    assert_eq!(
        manager.get_component::<Position>(entity).unwrap(),
        Position { x: 1.5, y: -2.0 }
    );
    assert_eq!(
        manager.get_component::<Velocity>(entity).unwrap(),
        Velocity { x: 0.25 }
    );
}

#[test]
fn test_duplicate_add_and_missing_set_are_rejected() {
    let mut manager = EntityManager::new();
    let entity = manager.create_entity();
    manager.add_component(entity, Flag(1)).unwrap();
    assert!(matches!(
        manager.add_component(entity, Flag(2)),
        Err(EcsError::ComponentAlreadyPresent)
    ));
    assert!(matches!(
        manager.set_component(entity, Position { x: 0.0, y: 0.0 }),
        Err(EcsError::MissingComponent)
    ));
    // The failed add did not clobber the stored value.
    assert_eq!(manager.get_component::<Flag>(entity).unwrap(), Flag(1));
}

#[test]
fn test_locations_survive_swap_heavy_churn() {
    let mut manager = EntityManager::new();
    let entities: Vec<_> = (0..100)
        .map(|at| {
            let entity = manager.create_entity();
            manager.add_component(entity, Flag(at as u8)).unwrap();
            entity
        })
        .collect();

    // Destroy every third entity; swap-with-last relocates survivors.
    for entity in entities.iter().step_by(3) {
        manager.destroy_entity(*entity).unwrap();
    }

    for (at, entity) in entities.iter().enumerate() {
        if at % 3 == 0 {
            assert!(!manager.is_alive(*entity));
        } else {
            assert_eq!(
                manager.get_component::<Flag>(*entity).unwrap(),
                Flag(at as u8),
                "entity {at} lost its column data"
            );
        }
    }

    let filter = manager.filter_builder().require::<Flag>().build().unwrap();
    let accessors = manager.filter_entities(&filter);
    let total: usize = accessors.iter().map(|accessor| accessor.entity_count()).sum();
    assert_eq!(total, manager.entity_count(&filter));
    // All chunks but the last are full.
    for accessor in &accessors[..accessors.len() - 1] {
        assert_eq!(accessor.entity_count(), accessors[0].entity_count());
    }
}

#[test]
fn test_freed_ids_are_reissued_with_bumped_version_after_tick() {
    let mut world = World::new();
    let entity = world.entity_manager().create_entity();
    world.entity_manager().destroy_entity(entity).unwrap();

    // Same tick: the id stays quarantined.
    let same_tick = world.entity_manager().create_entity();
    assert_ne!(same_tick.id, entity.id);

    world.tick().unwrap();

    let reissued = world.entity_manager().create_entity();
    assert_eq!(reissued.id, entity.id);
    assert_eq!(reissued.version, entity.version + 1);
    assert!(!world.entity_manager().is_alive(entity));
}

#[test]
fn test_stale_handle_never_resolves() {
    let mut world = World::new();
    let entity = world.entity_manager().create_entity();
    world.entity_manager().add_component(entity, Flag(3)).unwrap();
    world.entity_manager().destroy_entity(entity).unwrap();
    world.tick().unwrap();

    let reissued = world.entity_manager().create_entity();
    assert_eq!(reissued.id, entity.id);

    // The stale handle still fails even though its id is live again.
    assert!(matches!(
        world.entity_manager().get_component::<Flag>(entity),
        Err(EcsError::InvalidEntity)
    ));
}
