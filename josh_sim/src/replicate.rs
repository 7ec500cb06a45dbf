use crate::cache::ResourceCache;
use crate::index::SpatialIndex;
use crate::patch::Patch;
use fxhash::FxHashMap;
use josh_core::entity::MutableEntity;
use josh_core::error::{EngineError, Result};
use josh_core::geometry::Geometry;
use josh_core::schema::EntitySchema;
use josh_core::units::UnitConverter;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One independent run of the simulation: the schema registry, the patch
/// grid, the spatial index, and the buckets of entities created mid-step.
///
/// Entities queued by `create` handlers are built immediately (so their
/// constant attributes exist) but only join the grid and the index when
/// the orchestrator drains the buckets at a substep boundary.
pub struct Replicate {
    schemas: RwLock<FxHashMap<Arc<str>, Arc<EntitySchema>>>,
    patches: RwLock<Vec<Arc<Patch>>>,
    index: SpatialIndex,
    spawned: Mutex<FxHashMap<usize, Vec<Arc<MutableEntity>>>>,
    converter: Arc<UnitConverter>,
    resources: Option<Arc<ResourceCache>>,
    step: AtomicU64,
}

impl Replicate {
    pub fn new() -> Arc<Replicate> {
        Replicate::builder().build()
    }

    pub fn builder() -> ReplicateBuilder {
        ReplicateBuilder {
            converter: None,
            resources: None,
        }
    }

    pub fn register_schema(&self, schema: Arc<EntitySchema>) {
        debug!(entity = %schema.name(), "registered schema");
        self.schemas
            .write()
            .insert(schema.name().clone(), schema);
    }

    pub fn schema(&self, name: &str) -> Result<Arc<EntitySchema>> {
        self.schemas
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Resolution {
                name: name.to_string(),
            })
    }

    /// Creates a root spatial entity of the named type and its patch.
    pub fn add_patch(&self, schema_name: &str, geometry: Arc<Geometry>) -> Result<Arc<Patch>> {
        let schema = self.schema(schema_name)?;
        let entity = MutableEntity::with_geometry(schema, geometry);
        let patch = {
            let mut patches = self.patches.write();
            let patch = Patch::new(patches.len(), entity.clone());
            patches.push(patch.clone());
            patch
        };
        self.index.insert(entity);
        Ok(patch)
    }

    /// Creates a member entity on an existing patch, borrowing the patch
    /// geometry.
    pub fn add_member(
        &self,
        patch: &Arc<Patch>,
        schema_name: &str,
    ) -> Result<Arc<MutableEntity>> {
        let schema = self.schema(schema_name)?;
        let member = MutableEntity::member_of(schema, patch.entity());
        patch.add_member(member.clone());
        self.index.insert(member.clone());
        Ok(member)
    }

    pub fn patches(&self) -> Vec<Arc<Patch>> {
        self.patches.read().clone()
    }

    pub fn patch_at(&self, position: usize) -> Option<Arc<Patch>> {
        self.patches.read().get(position).cloned()
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    pub fn converter(&self) -> &UnitConverter {
        &self.converter
    }

    pub fn resources(&self) -> Option<&Arc<ResourceCache>> {
        self.resources.as_ref()
    }

    pub fn current_step(&self) -> u64 {
        self.step.load(Ordering::Relaxed)
    }

    pub fn advance_step(&self) -> u64 {
        let next = self.step.fetch_add(1, Ordering::Relaxed) + 1;
        info!(step = next, "advanced time step");
        next
    }

    /// Builds `count` entities of the named type at a patch and parks them
    /// in the patch's spawn bucket. Called from handlers mid-substep; the
    /// new entities do not join the grid until the boundary.
    pub fn queue_spawn(&self, patch: &Arc<Patch>, schema_name: &str, count: i64) -> Result<()> {
        let schema = self.schema(schema_name)?;
        let mut bucket = self.spawned.lock();
        let slot = bucket.entry(patch.position()).or_default();
        for _ in 0..count {
            slot.push(MutableEntity::member_of(schema.clone(), patch.entity()));
        }
        debug!(
            entity = %schema_name,
            count,
            patch = patch.position(),
            "queued spawned entities"
        );
        Ok(())
    }

    /// Drains the spawn buckets, pairing each with its patch. The caller
    /// (the orchestrator) finishes construction: constant/init substeps,
    /// patch membership, and index registration.
    pub fn take_spawned(&self) -> Vec<(Arc<Patch>, Vec<Arc<MutableEntity>>)> {
        let drained: Vec<(usize, Vec<Arc<MutableEntity>>)> =
            self.spawned.lock().drain().collect();
        drained
            .into_iter()
            .filter_map(|(position, members)| {
                self.patch_at(position).map(|patch| (patch, members))
            })
            .collect()
    }

    /// Registers a finished spawned entity with its patch and the index.
    pub fn attach(&self, patch: &Arc<Patch>, entity: Arc<MutableEntity>) {
        patch.add_member(entity.clone());
        self.index.insert(entity);
    }

    /// Detaches an entity from its patch and the index. The `remove`
    /// substep has already run by the time this is called.
    pub fn detach(&self, patch: &Arc<Patch>, entity: &Arc<MutableEntity>) -> bool {
        let detached = patch.remove_member(&entity.identity_key()).is_some();
        self.index.remove(entity);
        detached
    }
}

pub struct ReplicateBuilder {
    converter: Option<Arc<UnitConverter>>,
    resources: Option<Arc<ResourceCache>>,
}

impl ReplicateBuilder {
    pub fn converter(mut self, converter: Arc<UnitConverter>) -> ReplicateBuilder {
        self.converter = Some(converter);
        self
    }

    pub fn resources(mut self, resources: Arc<ResourceCache>) -> ReplicateBuilder {
        self.resources = Some(resources);
        self
    }

    pub fn build(self) -> Arc<Replicate> {
        Arc::new(Replicate {
            schemas: RwLock::new(FxHashMap::default()),
            patches: RwLock::new(Vec::new()),
            index: SpatialIndex::new(),
            spawned: Mutex::new(FxHashMap::default()),
            converter: self
                .converter
                .unwrap_or_else(|| Arc::new(UnitConverter::with_defaults())),
            resources: self.resources,
            step: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use josh_core::geometry::{GeometryFactory, Space};
    use josh_core::schema::EntitySchemaBuilder;

    fn replicate_with_grid(rows: usize) -> Arc<Replicate> {
        let replicate = Replicate::new();
        replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
        replicate.register_schema(EntitySchemaBuilder::new("Tree").build());
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
    fn patches_join_the_index() {
        let replicate = replicate_with_grid(3);
        assert_eq!(replicate.patches().len(), 3);
        assert_eq!(replicate.index().len(), 3);
        assert_eq!(replicate.patch_at(1).unwrap().position(), 1);
    }

    #[test]
    fn unknown_schema_is_a_resolution_error() {
        let replicate = Replicate::new();
        let err = replicate.schema("Pine").unwrap_err();
        assert!(matches!(err, EngineError::Resolution { .. }));
    }

    #[test]
    fn spawn_buckets_drain_to_their_patch() {
        let replicate = replicate_with_grid(2);
        let patch = replicate.patch_at(1).unwrap();
        replicate.queue_spawn(&patch, "Tree", 3).unwrap();

        let drained = replicate.take_spawned();
        assert_eq!(drained.len(), 1);
        let (target, members) = &drained[0];
        assert_eq!(target.position(), 1);
        assert_eq!(members.len(), 3);
        // A second drain is empty.
        assert!(replicate.take_spawned().is_empty());
        // Queued entities are not on the grid yet.
        assert_eq!(patch.member_count(), 0);

        for member in members {
            replicate.attach(target, member.clone());
        }
        assert_eq!(patch.member_count(), 3);
        assert_eq!(replicate.index().len(), 2 + 3);
    }

    #[test]
    fn detach_removes_from_patch_and_index() {
        let replicate = replicate_with_grid(1);
        let patch = replicate.patch_at(0).unwrap();
        let tree = replicate.add_member(&patch, "Tree").unwrap();
        assert_eq!(replicate.index().len(), 2);

        assert!(replicate.detach(&patch, &tree));
        assert_eq!(patch.member_count(), 0);
        assert_eq!(replicate.index().len(), 1);
    }

    #[test]
    fn step_counter_advances() {
        let replicate = Replicate::new();
        assert_eq!(replicate.current_step(), 0);
        assert_eq!(replicate.advance_step(), 1);
        assert_eq!(replicate.current_step(), 1);
    }
}
