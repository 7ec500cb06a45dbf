use fxhash::FxHashMap;
use josh_core::entity::MutableEntity;
use josh_core::geometry::{GeoKey, Geometry};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// Read-mostly spatial index over every registered entity.
///
/// Keys are location-based ([`GeoKey`] equality ignores the entity), so
/// each slot holds the bucket of entities sharing a grid location. Writes
/// happen only at entity creation and removal; queries take the read lock.
pub struct SpatialIndex {
    entries: RwLock<FxHashMap<GeoKey, Vec<Arc<MutableEntity>>>>,
}

impl SpatialIndex {
    pub fn new() -> SpatialIndex {
        SpatialIndex {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Registers an entity under its location. Entities without geometry
    /// are not spatial and are skipped.
    pub fn insert(&self, entity: Arc<MutableEntity>) -> bool {
        let key = match entity.geo_key() {
            Some(key) => key,
            None => return false,
        };
        trace!(entity = %entity.display_name(), key = %key, "indexed entity");
        self.entries.write().entry(key).or_default().push(entity);
        true
    }

    /// Drops an entity from its location bucket.
    pub fn remove(&self, entity: &Arc<MutableEntity>) -> bool {
        let key = match entity.geo_key() {
            Some(key) => key,
            None => return false,
        };
        let mut entries = self.entries.write();
        let removed = match entries.get_mut(&key) {
            Some(bucket) => {
                let before = bucket.len();
                bucket.retain(|candidate| !Arc::ptr_eq(candidate, entity));
                if bucket.is_empty() {
                    entries.remove(&key);
                }
                before > 0
            }
            None => false,
        };
        removed
    }

    /// Entities of the named type whose grid geometry intersects the
    /// probe. Order is unspecified; callers needing determinism sort.
    pub fn query(&self, probe: &Geometry, target: &str) -> Vec<Arc<MutableEntity>> {
        let entries = self.entries.read();
        let mut found = Vec::new();
        for bucket in entries.values() {
            for entity in bucket {
                if entity.schema().name().as_ref() != target {
                    continue;
                }
                let geometry = match entity.geometry() {
                    Some(geometry) => geometry,
                    None => continue,
                };
                if probe.intersects(&geometry) {
                    found.push(entity.clone());
                }
            }
        }
        found
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for SpatialIndex {
    fn default() -> SpatialIndex {
        SpatialIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use josh_core::geometry::{GeometryFactory, Space};
    use josh_core::schema::EntitySchemaBuilder;

    fn patch_at(y: f64) -> Arc<MutableEntity> {
        let schema = EntitySchemaBuilder::new("Patch").build();
        let geometry = Arc::new(
            GeometryFactory::grid()
                .square(0.0, y, 1.0, Space::Grid)
                .unwrap(),
        );
        MutableEntity::with_geometry(schema, geometry)
    }

    #[test]
    fn query_filters_by_type_and_intersection() {
        let index = SpatialIndex::new();
        for y in 0..3 {
            index.insert(patch_at(y as f64));
        }
        let other_schema = EntitySchemaBuilder::new("Marker").build();
        let marker_geometry = Arc::new(
            GeometryFactory::grid()
                .point(0.0, 0.0, Space::Grid)
                .unwrap(),
        );
        index.insert(MutableEntity::with_geometry(other_schema, marker_geometry));
        assert_eq!(index.len(), 4);

        let probe = GeometryFactory::grid()
            .circle(0.0, 0.0, 1.0, Space::Grid)
            .unwrap();
        let found = index.query(&probe, "Patch");
        // Radius 1 reaches the home square and the one directly above.
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn co_located_entities_share_a_bucket() {
        let index = SpatialIndex::new();
        let a = patch_at(0.0);
        let b = patch_at(0.0);
        index.insert(a.clone());
        index.insert(b.clone());
        assert_eq!(index.len(), 2);

        assert!(index.remove(&a));
        let probe = GeometryFactory::grid()
            .point(0.0, 0.0, Space::Grid)
            .unwrap();
        let found = index.query(&probe, "Patch");
        assert_eq!(found.len(), 1);
        assert!(Arc::ptr_eq(&found[0], &b));
    }

    #[test]
    fn non_spatial_entities_are_skipped() {
        let index = SpatialIndex::new();
        let schema = EntitySchemaBuilder::new("Ghost").build();
        assert!(!index.insert(MutableEntity::new(schema)));
        assert!(index.is_empty());
    }
}
