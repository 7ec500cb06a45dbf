use crate::patch::Patch;
use crate::replicate::Replicate;
use josh_core::distribution::Distribution;
use josh_core::entity::MutableEntity;
use josh_core::error::{EngineError, Result};
use josh_core::geometry::{GeometryFactory, Space};
use josh_core::machine::MachineContext;
use josh_core::units::{UnitConverter, Units};
use josh_core::value::Value;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

/// Machine context for handlers running inside a replicate.
///
/// One scope is built per (entity, substep) invocation while the entity's
/// lock is held. Spatial queries hand back frozen snapshots so handlers
/// never hold two substep locks at once; peers are visited in ascending
/// sequence order (the global lock order) with a bounded wait.
pub struct ReplicateScope<'a> {
    replicate: &'a Replicate,
    patch: Arc<Patch>,
    entity: Arc<MutableEntity>,
    rng: StdRng,
    lock_timeout: Duration,
}

impl<'a> ReplicateScope<'a> {
    pub fn new(
        replicate: &'a Replicate,
        patch: Arc<Patch>,
        entity: Arc<MutableEntity>,
        seed: Option<u64>,
        lock_timeout: Duration,
    ) -> ReplicateScope<'a> {
        // Derive a per-entity stream from the configured seed so parallel
        // substeps stay reproducible regardless of scheduling.
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(
                seed ^ entity.sequence() ^ replicate.current_step().wrapping_mul(0x9e37_79b9),
            ),
            None => StdRng::from_entropy(),
        };
        ReplicateScope {
            replicate,
            patch,
            entity,
            rng,
            lock_timeout,
        }
    }
}

impl<'a> MachineContext for ReplicateScope<'a> {
    fn entity(&self) -> &Arc<MutableEntity> {
        &self.entity
    }

    fn converter(&self) -> &UnitConverter {
        self.replicate.converter()
    }

    fn rng(&mut self) -> &mut dyn RngCore {
        &mut self.rng
    }

    fn neighbors(&mut self, target: &str, distance: &Value) -> Result<Distribution> {
        let geometry = self.entity.geometry().ok_or_else(|| {
            EngineError::Resolution {
                name: format!("{} has no geometry", self.entity.display_name()),
            }
        })?;
        let radius = distance.as_f64()?;
        let (x, y, _) = geometry.grid_footprint();
        let probe = GeometryFactory::grid().circle(x, y, radius, Space::Grid)?;

        // Ascending sequence is the global acquisition order; taking peers
        // in that order keeps concurrent queries deadlock-free.
        let candidates = self
            .replicate
            .index()
            .query(&probe, target)
            .into_iter()
            .sorted_by_key(|candidate| candidate.sequence());

        let mut found = Vec::new();
        for candidate in candidates {
            let snapshot = if Arc::ptr_eq(&candidate, &self.entity) {
                candidate.snapshot()
            } else {
                candidate.try_snapshot(self.lock_timeout)?
            };
            found.push(Value::frozen_entity(snapshot));
        }
        Ok(Distribution::realized(found, Units::empty()))
    }

    fn spawn(&mut self, name: &str, count: i64) -> Result<()> {
        self.replicate.queue_spawn(&self.patch, name, count)
    }

    fn read_external(&mut self, source: &str) -> Result<Distribution> {
        match self.replicate.resources() {
            Some(cache) => cache.get_or_read(source, self.entity.geometry().as_deref()),
            None => Err(EngineError::Io {
                resource: source.to_string(),
                detail: "no resource reader configured for this replicate".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use josh_core::geometry::GeometryFactory;
    use josh_core::machine::EventMachine;
    use josh_core::schema::EntitySchemaBuilder;

    fn grid_replicate(rows: usize) -> Arc<Replicate> {
        let replicate = Replicate::new();
        replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
        replicate.register_schema(EntitySchemaBuilder::new("Agent").build());
        let factory = GeometryFactory::grid();
        for row in 0..rows {
            let geometry = Arc::new(
                factory
                    .square(0.0, row as f64, 1.0, Space::Grid)
                    .unwrap(),
            );
            replicate.add_patch("Patch", geometry).unwrap();
        }
        replicate
    }

    #[test]
    fn spatial_query_counts_reachable_patches() {
        let replicate = grid_replicate(3);
        let patch = replicate.patch_at(0).unwrap();
        let agent = replicate.add_member(&patch, "Agent").unwrap();

        let mut scope = ReplicateScope::new(
            &replicate,
            patch,
            agent,
            Some(7),
            Duration::from_millis(200),
        );
        let mut machine = EventMachine::new(&mut scope);
        machine.push(Value::int(1, Units::count()));
        machine.execute_spatial_query("Patch").unwrap();
        machine.count().unwrap();
        assert_eq!(
            machine.result().unwrap(),
            Value::int(2, Units::count())
        );
    }

    #[test]
    fn spawn_routes_to_the_scope_patch() {
        let replicate = grid_replicate(1);
        let patch = replicate.patch_at(0).unwrap();
        let agent = replicate.add_member(&patch, "Agent").unwrap();

        let mut scope = ReplicateScope::new(
            &replicate,
            patch,
            agent,
            Some(7),
            Duration::from_millis(200),
        );
        let mut machine = EventMachine::new(&mut scope);
        machine.push(Value::int(2, Units::count()));
        machine.create_entity("Agent").unwrap();

        let drained = replicate.take_spawned();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.len(), 2);
    }

    #[test]
    fn missing_resource_reader_is_an_io_error() {
        let replicate = grid_replicate(1);
        let patch = replicate.patch_at(0).unwrap();
        let agent = replicate.add_member(&patch, "Agent").unwrap();

        let mut scope = ReplicateScope::new(
            &replicate,
            patch,
            agent,
            None,
            Duration::from_millis(200),
        );
        let err = scope.read_external("elevation.tif").unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
    }
}
