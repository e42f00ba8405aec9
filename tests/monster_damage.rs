//! Full world + scheduler exercise: persistent damage with manual counters.
//!
//! Monsters take damage every tick until they die; a manual counter component
//! outlives each monster so a collection pass can read how many hits it took,
//! then releases the entity by removing the manual component.

use std::sync::Arc;

use parking_lot::Mutex;

use hive_ecs::{
    ChunkAccessor, ChunkTask, Component, Entity, EntityCommandBuffer, EntityFilter, Instance,
    System, SystemContext,
};

#[derive(Clone, Copy)]
struct MonsterHealth {
    value: u32,
}
impl Component for MonsterHealth {}

#[derive(Clone, Copy)]
struct PersistentDamage {
    value: u32,
}
impl Component for PersistentDamage {}

#[derive(Clone, Copy)]
struct ManualDamageCounter {
    index: u32,
    damage_taken_count: u32,
}
impl Component for ManualDamageCounter {
    const MANUAL: bool = true;
}

struct DamageTask {
    health_id: u32,
    damage_id: u32,
    counter_id: u32,
}

impl ChunkTask for DamageTask {
    fn execute(
        &self,
        accessor: &ChunkAccessor,
        _chunk_index: usize,
        _first_entity_index: usize,
        buffer: &mut EntityCommandBuffer,
    ) {
        let entities = accessor.entity_array();
        // SAFETY: this task is the only writer of these columns this phase;
        // the collection pass runs on disjoint archetypes.
        let healths = unsafe { accessor.component_array_mut::<MonsterHealth>(self.health_id) };
        let counters =
            unsafe { accessor.component_array_mut::<ManualDamageCounter>(self.counter_id) };
        let damages = accessor.component_array::<PersistentDamage>(self.damage_id);
        for at in 0..accessor.entity_count() {
            if healths[at].value <= damages[at].value {
                buffer.destroy_entity(entities[at]);
            } else {
                healths[at].value -= damages[at].value;
            }
            counters[at].damage_taken_count += 1;
        }
    }
}

struct CollectCounterTask {
    counter_id: u32,
    damage_taken_counts: Arc<Mutex<Vec<u32>>>,
}

impl ChunkTask for CollectCounterTask {
    fn execute(
        &self,
        accessor: &ChunkAccessor,
        _chunk_index: usize,
        _first_entity_index: usize,
        buffer: &mut EntityCommandBuffer,
    ) {
        let entities = accessor.entity_array();
        let counters = accessor.component_array::<ManualDamageCounter>(self.counter_id);
        let mut counts = self.damage_taken_counts.lock();
        for at in 0..accessor.entity_count() {
            counts[counters[at].index as usize] = counters[at].damage_taken_count;
            buffer.remove_component::<ManualDamageCounter>(entities[at]);
        }
    }
}

#[derive(Default)]
struct MonsterDamageCounterSystem {
    monster_filter: Option<EntityFilter>,
    collect_filter: Option<EntityFilter>,
    health_id: u32,
    damage_id: u32,
    counter_id: u32,
    damage_taken_counts: Arc<Mutex<Vec<u32>>>,
}

impl System for MonsterDamageCounterSystem {
    fn on_enter(&mut self, ctx: &mut SystemContext<'_>) {
        let manager = ctx.entity_manager();
        let archetype = manager
            .archetype_builder()
            .mark_component::<MonsterHealth>()
            .mark_component::<PersistentDamage>()
            .mark_component::<ManualDamageCounter>()
            .build()
            .unwrap();

        let entities: Vec<Entity> = (0..4)
            .map(|_| manager.create_entity_in(archetype).unwrap())
            .collect();
        for (at, &(health, damage)) in [(3, 2), (8, 3), (4, 1), (6, 2)].iter().enumerate() {
            manager
                .set_component(entities[at], MonsterHealth { value: health })
                .unwrap();
            manager
                .set_component(entities[at], PersistentDamage { value: damage })
                .unwrap();
            manager
                .set_component(
                    entities[at],
                    ManualDamageCounter {
                        index: at as u32,
                        damage_taken_count: 0,
                    },
                )
                .unwrap();
        }

        self.monster_filter = Some(
            manager
                .filter_builder()
                .require::<MonsterHealth>()
                .require::<PersistentDamage>()
                .require::<ManualDamageCounter>()
                .build()
                .unwrap(),
        );
        self.collect_filter = Some(
            manager
                .filter_builder()
                .require::<ManualDamageCounter>()
                .reject::<MonsterHealth>()
                .build()
                .unwrap(),
        );
        self.health_id = manager.component_id::<MonsterHealth>();
        self.damage_id = manager.component_id::<PersistentDamage>();
        self.counter_id = manager.component_id::<ManualDamageCounter>();
        self.damage_taken_counts.lock().resize(4, 0);
    }

    fn on_update(&mut self, ctx: &mut SystemContext<'_>) {
        let monster_filter = self.monster_filter.as_ref().unwrap();
        let collect_filter = self.collect_filter.as_ref().unwrap();

        let predecessor = ctx.predecessor().clone();
        let damage_handle = ctx.schedule(
            Arc::new(DamageTask {
                health_id: self.health_id,
                damage_id: self.damage_id,
                counter_id: self.counter_id,
            }),
            monster_filter,
            &predecessor,
        );
        let collect_handle = ctx.schedule(
            Arc::new(CollectCounterTask {
                counter_id: self.counter_id,
                damage_taken_counts: self.damage_taken_counts.clone(),
            }),
            collect_filter,
            &predecessor,
        );
        let joined = ctx.combine(&[damage_handle, collect_handle]);
        ctx.set_predecessor(joined);

        let manager = ctx.entity_manager();
        if manager.entity_count(monster_filter) == 0 && manager.entity_count(collect_filter) == 0 {
            ctx.quit();
        }
    }
}

#[test]
fn test_monsters_die_and_counters_survive_collection() {
    let counts = Arc::new(Mutex::new(Vec::new()));
    let system = MonsterDamageCounterSystem {
        damage_taken_counts: counts.clone(),
        ..Default::default()
    };

    let mut instance = Instance::new();
    instance.register_system(Box::new(system));
    instance.start().unwrap();

    // (3,2) -> 2 hits, (8,3) -> 3, (4,1) -> 4, (6,2) -> 3.
    assert_eq!(*counts.lock(), vec![2, 3, 4, 3]);
}
