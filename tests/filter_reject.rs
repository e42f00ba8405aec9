//! Filter require/reject semantics over component masks.

use hive_ecs::{Component, EntityManager};

#[derive(Clone, Copy, PartialEq, Debug)]
struct Position(u32);
impl Component for Position {}

#[derive(Clone, Copy)]
struct Velocity(u32);
impl Component for Velocity {}

#[test]
fn test_reject_excludes_archetypes_with_the_component() {
    let mut manager = EntityManager::new();

    let moving = manager.create_entity();
    manager.add_component(moving, Position(1)).unwrap();
    manager.add_component(moving, Velocity(5)).unwrap();

    let still = manager.create_entity();
    manager.add_component(still, Position(2)).unwrap();

    let filter = manager
        .filter_builder()
        .require::<Position>()
        .reject::<Velocity>()
        .build()
        .unwrap();

    assert_eq!(manager.entity_count(&filter), 1);
    let accessors = manager.filter_entities(&filter);
    assert_eq!(accessors.len(), 1);
    assert_eq!(accessors[0].entity_array(), &[still]);

    let position_id = manager.component_id::<Position>();
    assert_eq!(
        accessors[0].component_array::<Position>(position_id),
        &[Position(2)]
    );
}

#[test]
fn test_empty_filter_matches_all_entities() {
    let mut manager = EntityManager::new();
    let a = manager.create_entity();
    let b = manager.create_entity();
    manager.add_component(b, Position(0)).unwrap();

    let filter = manager.filter_builder().build().unwrap();
    assert_eq!(manager.entity_count(&filter), 2);

    let entities: Vec<_> = manager
        .filter_entities(&filter)
        .iter()
        .flat_map(|accessor| accessor.entity_array().to_vec())
        .collect();
    assert!(entities.contains(&a));
    assert!(entities.contains(&b));
}
