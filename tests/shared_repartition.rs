//! Setting a shared component repartitions entities between combinations and
//! keeps the interning refcounts exact.

use hive_ecs::{Component, EntityManager, SharedComponent};

#[derive(Clone, Copy, PartialEq, Debug)]
struct Marker(u32);
impl Component for Marker {}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct Zone(u32);
impl SharedComponent for Zone {}

#[test]
fn test_set_shared_component_splits_combination() {
    let mut manager = EntityManager::new();

    let first = manager.create_entity();
    let second = manager.create_entity();
    for (entity, marker) in [(first, Marker(1)), (second, Marker(2))] {
        manager.add_component(entity, marker).unwrap();
        manager.add_shared_component(entity, Zone(1)).unwrap();
    }

    // One combination, one interned value referenced twice.
    let zone1_index = manager.shared_component_index(&Zone(1)).unwrap();
    assert_eq!(manager.shared_component_refcount(zone1_index), 2);
    let both = manager
        .filter_builder()
        .require_shared_value(&Zone(1))
        .build()
        .unwrap();
    assert_eq!(manager.entity_count(&both), 2);
    assert_eq!(manager.chunk_count(&both), 1);

    manager.set_shared_component(second, Zone(2)).unwrap();

    // Two combinations now, each value referenced once.
    let zone2_index = manager.shared_component_index(&Zone(2)).unwrap();
    assert_ne!(zone1_index, zone2_index);
    assert_eq!(manager.shared_component_refcount(zone1_index), 1);
    assert_eq!(manager.shared_component_refcount(zone2_index), 1);
    assert_eq!(manager.shared_component::<Zone>(zone2_index), Some(&Zone(2)));

    // Both entities stayed in the same archetype.
    assert_eq!(
        manager.entity_archetype(first).unwrap(),
        manager.entity_archetype(second).unwrap()
    );

    // A filter on the new value sees exactly the moved entity.
    let moved = manager
        .filter_builder()
        .require_shared_value(&Zone(2))
        .build()
        .unwrap();
    assert_eq!(manager.entity_count(&moved), 1);
    let accessors = manager.filter_entities(&moved);
    assert_eq!(accessors.len(), 1);
    assert_eq!(accessors[0].entity_array(), &[second]);
    assert_eq!(
        accessors[0].shared_component_index(manager.shared_component_id::<Zone>()),
        Some(zone2_index)
    );
}

#[test]
fn test_set_shared_component_to_same_value_is_stable() {
    let mut manager = EntityManager::new();
    let entity = manager.create_entity();
    manager.add_shared_component(entity, Zone(9)).unwrap();
    let index = manager.shared_component_index(&Zone(9)).unwrap();

    manager.set_shared_component(entity, Zone(9)).unwrap();

    assert_eq!(manager.shared_component_index(&Zone(9)), Some(index));
    assert_eq!(manager.shared_component_refcount(index), 1);
    assert!(manager.is_alive(entity));
}

#[test]
fn test_remove_shared_component_releases_reference() {
    let mut manager = EntityManager::new();
    let entity = manager.create_entity();
    manager.add_component(entity, Marker(7)).unwrap();
    manager.add_shared_component(entity, Zone(3)).unwrap();
    let index = manager.shared_component_index(&Zone(3)).unwrap();

    manager.remove_shared_component::<Zone>(entity).unwrap();

    assert_eq!(manager.shared_component_refcount(index), 0);
    assert_eq!(manager.shared_component_index(&Zone(3)), None);
    assert_eq!(manager.get_component::<Marker>(entity).unwrap(), Marker(7));
}
