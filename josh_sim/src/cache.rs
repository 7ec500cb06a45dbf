use fxhash::FxHashMap;
use josh_core::distribution::Distribution;
use josh_core::error::Result;
use josh_core::geometry::Geometry;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

const SHARD_COUNT: usize = 16;

/// Reader for values that live outside the simulation (rasters, remote
/// layers). Implemented by the surface layer. Readers never touch entity
/// state, so a handler invoking one while its own substep lock is held
/// cannot deadlock.
pub trait ResourceReader: Send + Sync {
    fn read(&self, source: &str, geometry: Option<&Geometry>) -> Result<Distribution>;
}

/// Sharded cache in front of a [`ResourceReader`].
///
/// Hits contend only on their shard; a miss holds its shard lock through
/// the read so concurrent misses for the same key collapse into one fetch.
/// Failed reads are retried up to the configured budget before the error
/// surfaces.
pub struct ResourceCache {
    shards: Vec<Mutex<FxHashMap<String, Distribution>>>,
    reader: Arc<dyn ResourceReader>,
    retries: usize,
}

impl ResourceCache {
    pub fn new(reader: Arc<dyn ResourceReader>, retries: usize) -> ResourceCache {
        ResourceCache {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(FxHashMap::default()))
                .collect(),
            reader,
            retries,
        }
    }

    fn cache_key(source: &str, geometry: Option<&Geometry>) -> String {
        match geometry {
            Some(geometry) => {
                let (x, y, _) = geometry.grid_footprint();
                format!("{}@{:.6},{:.6}", source, x, y)
            }
            None => source.to_string(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<FxHashMap<String, Distribution>> {
        let hash = fxhash::hash64(key.as_bytes());
        &self.shards[(hash % SHARD_COUNT as u64) as usize]
    }

    pub fn get_or_read(
        &self,
        source: &str,
        geometry: Option<&Geometry>,
    ) -> Result<Distribution> {
        let key = ResourceCache::cache_key(source, geometry);
        let mut shard = self.shard(&key).lock();
        if let Some(hit) = shard.get(&key) {
            return Ok(hit.clone());
        }

        let mut last_error = None;
        for attempt in 0..=self.retries {
            match self.reader.read(source, geometry) {
                Ok(distribution) => {
                    shard.insert(key.clone(), distribution.clone());
                    return Ok(distribution);
                }
                Err(error) => {
                    warn!(
                        source,
                        attempt,
                        error = %error,
                        "external resource read failed"
                    );
                    last_error = Some(error);
                }
            }
        }
        // The loop always runs at least once, so an error is present here.
        Err(last_error.unwrap_or_else(|| {
            josh_core::error::EngineError::Data {
                detail: format!("resource `{}` unreadable", source),
            }
        }))
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use josh_core::error::EngineError;
    use josh_core::units::Units;
    use josh_core::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReader {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl CountingReader {
        fn new(fail_first: usize) -> Arc<CountingReader> {
            Arc::new(CountingReader {
                calls: AtomicUsize::new(0),
                fail_first,
            })
        }
    }

    impl ResourceReader for CountingReader {
        fn read(&self, source: &str, _geometry: Option<&Geometry>) -> Result<Distribution> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(EngineError::Io {
                    resource: source.to_string(),
                    detail: "transient".to_string(),
                });
            }
            Ok(Distribution::realized(
                vec![Value::decimal(1.0, Units::of("m"))],
                Units::of("m"),
            ))
        }
    }

    #[test]
    fn hits_do_not_touch_the_reader() {
        let reader = CountingReader::new(0);
        let cache = ResourceCache::new(reader.clone(), 0);
        cache.get_or_read("elevation.tif", None).unwrap();
        cache.get_or_read("elevation.tif", None).unwrap();
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn transient_failures_are_retried() {
        let reader = CountingReader::new(2);
        let cache = ResourceCache::new(reader.clone(), 3);
        cache.get_or_read("elevation.tif", None).unwrap();
        assert_eq!(reader.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_retries_surface_the_error() {
        let reader = CountingReader::new(10);
        let cache = ResourceCache::new(reader.clone(), 2);
        let err = cache.get_or_read("elevation.tif", None).unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
        // 1 initial attempt + 2 retries.
        assert_eq!(reader.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn keys_include_the_grid_footprint() {
        use josh_core::geometry::{GeometryFactory, Space};
        let reader = CountingReader::new(0);
        let cache = ResourceCache::new(reader.clone(), 0);
        let factory = GeometryFactory::grid();
        let here = factory.square(0.0, 0.0, 1.0, Space::Grid).unwrap();
        let there = factory.square(0.0, 1.0, 1.0, Space::Grid).unwrap();
        cache.get_or_read("cover.tif", Some(&here)).unwrap();
        cache.get_or_read("cover.tif", Some(&there)).unwrap();
        assert_eq!(reader.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }
}
