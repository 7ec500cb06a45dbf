use crate::error::{EngineError, Result};
use crate::geometry::{GeoKey, Geometry, IdentityKey};
use crate::handler::Event;
use crate::schema::EntitySchema;
use crate::value::Value;
use bit_set::BitSet;
use lock_api::RawReentrantMutex;
use parking_lot::{RawMutex, RawThreadId};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// Process-wide counter backing lazily-assigned entity sequence ids. The
/// ids only matter for display and identity keys, never for behavior.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Re-entrant lock guarding an entity for the duration of a substep.
///
/// The raw form is used instead of `ReentrantMutex<T>` because the substep
/// protocol holds the lock across separate `start_substep`/`end_substep`
/// calls, which a scoped guard cannot express. The hold count is tracked
/// alongside so tests and diagnostics can observe balance.
pub struct SubstepLock {
    raw: RawReentrantMutex<RawMutex, RawThreadId>,
    holds: AtomicUsize,
}

impl SubstepLock {
    pub fn new() -> SubstepLock {
        SubstepLock {
            raw: RawReentrantMutex::INIT,
            holds: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) {
        self.raw.lock();
        self.holds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        if self.raw.try_lock_for(timeout) {
            self.holds.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        self.holds.fetch_sub(1, Ordering::Relaxed);
        // Safety: callers only release holds they acquired; every release
        // in this module is paired with an acquire on the same code path.
        unsafe { self.raw.unlock() };
    }

    pub fn held_by_current_thread(&self) -> bool {
        self.raw.is_owned_by_current_thread()
    }

    pub fn hold_count(&self) -> usize {
        self.holds.load(Ordering::Relaxed)
    }
}

impl Default for SubstepLock {
    fn default() -> SubstepLock {
        SubstepLock::new()
    }
}

/// Where an entity's geometry comes from.
///
/// Root spatial entities (patches) own theirs; member entities (agents,
/// disturbances) keep a non-owning back-reference to their parent so the
/// geometry is shared without the member keeping the parent alive.
#[derive(Clone)]
pub enum GeometryRef {
    Owned(Arc<Geometry>),
    Parent(Weak<MutableEntity>),
}

struct EntityState {
    attributes: Vec<Option<Value>>,
    prior: Vec<Option<Value>>,
    only_on_prior: BitSet,
    substep: Option<Event>,
}

impl EntityState {
    fn read_slot(&self, index: usize) -> Option<Value> {
        match &self.attributes[index] {
            Some(value) => Some(value.clone()),
            None => self.prior[index].clone(),
        }
    }
}

/// One live entity: per-instance attribute arrays over a shared immutable
/// schema, guarded by a re-entrant substep lock.
///
/// Reads return the value written this substep when there is one, else the
/// value committed at the last freeze. The `only_on_prior` bitmap remembers
/// which slots were valid at the last commit but have not been rewritten,
/// which is what lets `freeze` carry untouched attributes forward.
///
/// Schema, geometry, and sequence id never change after construction and
/// are readable without the lock.
pub struct MutableEntity {
    schema: Arc<EntitySchema>,
    geometry: Option<GeometryRef>,
    sequence: AtomicU64,
    lock: SubstepLock,
    state: RefCell<EntityState>,
}

// Safety: `state` is only touched inside `locked`, which serializes access
// across threads through the raw re-entrant mutex. The RefCell turns any
// illegal same-thread aliasing into a loud panic instead of UB. Everything
// outside the RefCell is immutable or atomic.
unsafe impl Send for MutableEntity {}
unsafe impl Sync for MutableEntity {}

struct HoldGuard<'a> {
    lock: &'a SubstepLock,
}

impl<'a> Drop for HoldGuard<'a> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl MutableEntity {
    pub fn new(schema: Arc<EntitySchema>) -> Arc<MutableEntity> {
        MutableEntity::build(schema, None)
    }

    pub fn with_geometry(schema: Arc<EntitySchema>, geometry: Arc<Geometry>) -> Arc<MutableEntity> {
        MutableEntity::build(schema, Some(GeometryRef::Owned(geometry)))
    }

    /// A member entity borrowing its parent's geometry. The back-reference
    /// is weak: the member never keeps the parent alive.
    pub fn member_of(
        schema: Arc<EntitySchema>,
        parent: &Arc<MutableEntity>,
    ) -> Arc<MutableEntity> {
        MutableEntity::build(schema, Some(GeometryRef::Parent(Arc::downgrade(parent))))
    }

    fn build(schema: Arc<EntitySchema>, geometry: Option<GeometryRef>) -> Arc<MutableEntity> {
        let count = schema.attribute_count();
        let attributes = schema.initial_values().to_vec();
        Arc::new(MutableEntity {
            schema,
            geometry,
            sequence: AtomicU64::new(0),
            lock: SubstepLock::new(),
            state: RefCell::new(EntityState {
                attributes,
                prior: vec![None; count],
                only_on_prior: BitSet::with_capacity(count),
                substep: None,
            }),
        })
    }

    fn locked<R>(&self, f: impl FnOnce(&RefCell<EntityState>) -> R) -> R {
        self.lock.acquire();
        let _guard = HoldGuard { lock: &self.lock };
        f(&self.state)
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    /// Lazily-assigned process-unique id, used for display and identity
    /// keys only.
    pub fn sequence(&self) -> u64 {
        let assigned = self.sequence.load(Ordering::Relaxed);
        if assigned != 0 {
            return assigned;
        }
        let fresh = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        match self
            .sequence
            .compare_exchange(0, fresh, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => fresh,
            Err(existing) => existing,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{}#{}", self.schema.name(), self.sequence())
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            name: self.schema.name().clone(),
            sequence: self.sequence(),
        }
    }

    /// The entity's geometry, resolving member back-references through the
    /// parent. `None` for non-spatial entities or when the parent is gone.
    pub fn geometry(&self) -> Option<Arc<Geometry>> {
        resolve_geometry(&self.geometry)
    }

    pub fn geo_key(&self) -> Option<GeoKey> {
        let geometry = self.geometry()?;
        Some(GeoKey::new(
            geometry,
            self.schema.name().clone(),
            self.sequence(),
        ))
    }

    /// Current-substep value when written, else the prior-substep value.
    /// Unknown names read as `None`.
    pub fn get_attribute(&self, name: &str) -> Result<Option<Value>> {
        match self.schema.attribute_index(name) {
            Some(index) => self.get_attribute_by_index(index),
            None => Ok(None),
        }
    }

    pub fn get_attribute_by_index(&self, index: u32) -> Result<Option<Value>> {
        self.locked(|cell| {
            let state = cell.borrow();
            if index as usize >= state.attributes.len() {
                return Err(self.index_error(index, state.attributes.len()));
            }
            Ok(state.read_slot(index as usize))
        })
    }

    /// The value committed at the last freeze, ignoring writes made this
    /// substep.
    pub fn get_prior(&self, name: &str) -> Result<Option<Value>> {
        match self.schema.attribute_index(name) {
            Some(index) => self.locked(|cell| Ok(cell.borrow().prior[index as usize].clone())),
            None => Ok(None),
        }
    }

    pub fn set_attribute(&self, name: &str, value: Value) -> Result<()> {
        let index = self.schema.attribute_index(name).ok_or_else(|| {
            EngineError::schema(
                self.schema.name(),
                format!("unknown attribute `{}`", name),
            )
        })?;
        self.set_attribute_by_index(index, value)
    }

    pub fn set_attribute_by_index(&self, index: u32, value: Value) -> Result<()> {
        self.locked(|cell| {
            let mut state = cell.borrow_mut();
            if index as usize >= state.attributes.len() {
                return Err(self.index_error(index, state.attributes.len()));
            }
            state.only_on_prior.remove(index as usize);
            state.attributes[index as usize] = Some(value);
            Ok(())
        })
    }

    fn index_error(&self, index: u32, len: usize) -> EngineError {
        EngineError::schema(
            self.schema.name(),
            format!("attribute index {} out of range ({} attributes)", index, len),
        )
    }

    /// Enters a substep: acquires the lock (held until `end_substep`) and
    /// records the active substep. Nesting a second substep is fatal.
    pub fn start_substep(&self, event: Event) -> Result<()> {
        self.lock.acquire();
        self.enter_substep(event)
    }

    /// As `start_substep`, but gives up after `timeout` when another thread
    /// holds the entity.
    pub fn try_start_substep(&self, event: Event, timeout: Duration) -> Result<()> {
        if !self.lock.try_acquire_for(timeout) {
            return Err(EngineError::Contention {
                entity: self.display_name(),
                waited_ms: timeout.as_millis() as u64,
            });
        }
        self.enter_substep(event)
    }

    fn enter_substep(&self, event: Event) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(active) = state.substep {
            drop(state);
            self.lock.release();
            return Err(EngineError::state(
                self.schema.name(),
                format!(
                    "cannot start substep `{}` while `{}` is active",
                    event, active
                ),
            ));
        }
        trace!(entity = %self.schema.name(), substep = %event, "substep started");
        state.substep = Some(event);
        Ok(())
    }

    /// Leaves the active substep and releases the hold taken by
    /// `start_substep`.
    pub fn end_substep(&self) -> Result<()> {
        if !self.lock.held_by_current_thread() {
            return Err(EngineError::state(
                self.schema.name(),
                "end_substep without a matching start_substep".to_string(),
            ));
        }
        let mut state = self.state.borrow_mut();
        match state.substep.take() {
            Some(event) => {
                trace!(entity = %self.schema.name(), substep = %event, "substep ended");
                drop(state);
                self.lock.release();
                Ok(())
            }
            None => Err(EngineError::state(
                self.schema.name(),
                "end_substep with no active substep".to_string(),
            )),
        }
    }

    pub fn active_substep(&self) -> Option<Event> {
        self.locked(|cell| cell.borrow().substep)
    }

    /// O(1) consult of the schema's no-handler bitmap.
    pub fn has_no_handlers(&self, attribute: &str, event: Event) -> bool {
        match self.schema.attribute_index(attribute) {
            Some(index) => self.schema.has_no_handlers(event, index),
            None => false,
        }
    }

    pub fn hold_count(&self) -> usize {
        self.lock.hold_count()
    }

    /// Commit boundary. Promotes untouched prior slots, swaps the current
    /// array into `prior`, starts a fresh current array, and returns an
    /// immutable snapshot of the committed values. Fatal while a substep is
    /// active.
    pub fn freeze(&self) -> Result<Arc<FrozenEntity>> {
        self.locked(|cell| {
            let committed = {
                let mut state = cell.borrow_mut();
                if let Some(active) = state.substep {
                    return Err(EngineError::state(
                        self.schema.name(),
                        format!("cannot freeze while substep `{}` is active", active),
                    ));
                }
                let count = state.attributes.len();
                for index in 0..count {
                    if state.only_on_prior.contains(index) && state.attributes[index].is_none() {
                        let carried = state.prior[index].clone();
                        state.attributes[index] = carried;
                    }
                }
                let committed = std::mem::replace(&mut state.attributes, vec![None; count]);
                state.prior = committed.clone();
                state.only_on_prior.clear();
                for index in 0..count {
                    if state.prior[index].is_some() {
                        state.only_on_prior.insert(index);
                    }
                }
                committed
            };

            // Deep-freeze outside the mutable borrow: freezing an entity
            // reference snapshots the referenced entity, which may re-enter
            // this one.
            let frozen: Vec<Option<Value>> = committed
                .iter()
                .map(|slot| slot.as_ref().map(Value::freeze))
                .collect();
            cell.borrow_mut().prior = frozen.clone();

            Ok(Arc::new(FrozenEntity {
                schema: self.schema.clone(),
                attributes: frozen,
                geometry: self.geometry(),
                sequence: self.sequence(),
            }))
        })
    }

    /// As `snapshot`, but gives up with `ContentionError` when another
    /// thread keeps the entity locked past the timeout. Cross-entity reads
    /// go through this so a substep never blocks unboundedly on a peer.
    pub fn try_snapshot(&self, timeout: Duration) -> Result<Arc<FrozenEntity>> {
        if !self.lock.try_acquire_for(timeout) {
            return Err(EngineError::Contention {
                entity: self.display_name(),
                waited_ms: timeout.as_millis() as u64,
            });
        }
        let _guard = HoldGuard { lock: &self.lock };
        Ok(self.snapshot_inner())
    }

    /// Read-only snapshot of the currently visible values, without moving
    /// the commit boundary. Used to deep-freeze entity references.
    pub fn snapshot(&self) -> Arc<FrozenEntity> {
        self.locked(|_| self.snapshot_inner())
    }

    fn snapshot_inner(&self) -> Arc<FrozenEntity> {
        let view: Vec<Option<Value>> = {
            let state = self.state.borrow();
            (0..state.attributes.len())
                .map(|index| state.read_slot(index))
                .collect()
        };
        let attributes = view
            .iter()
            .map(|slot| slot.as_ref().map(Value::freeze))
            .collect();
        Arc::new(FrozenEntity {
            schema: self.schema.clone(),
            attributes,
            geometry: self.geometry(),
            sequence: self.sequence(),
        })
    }
}

impl fmt::Debug for MutableEntity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutableEntity")
            .field("name", &self.display_name())
            .finish()
    }
}

fn resolve_geometry(geometry: &Option<GeometryRef>) -> Option<Arc<Geometry>> {
    match geometry {
        Some(GeometryRef::Owned(g)) => Some(g.clone()),
        Some(GeometryRef::Parent(parent)) => parent.upgrade().and_then(|p| p.geometry()),
        None => None,
    }
}

/// Immutable snapshot of an entity at a commit boundary.
#[derive(Clone)]
pub struct FrozenEntity {
    schema: Arc<EntitySchema>,
    attributes: Vec<Option<Value>>,
    geometry: Option<Arc<Geometry>>,
    sequence: u64,
}

impl FrozenEntity {
    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn name(&self) -> &Arc<str> {
        self.schema.name()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn display_name(&self) -> String {
        format!("{}#{}", self.schema.name(), self.sequence)
    }

    pub fn get_attribute(&self, name: &str) -> Option<&Value> {
        let index = self.schema.attribute_index(name)?;
        self.attributes.get(index as usize)?.as_ref()
    }

    pub fn get_attribute_by_index(&self, index: u32) -> Option<&Value> {
        self.attributes.get(index as usize)?.as_ref()
    }

    pub fn attributes(&self) -> &[Option<Value>] {
        &self.attributes
    }

    pub fn geometry(&self) -> Option<&Arc<Geometry>> {
        self.geometry.as_ref()
    }

    /// Freezing a frozen entity is the identity.
    pub fn freeze(self: &Arc<Self>) -> Arc<FrozenEntity> {
        Arc::clone(self)
    }
}

impl PartialEq for FrozenEntity {
    fn eq(&self, other: &FrozenEntity) -> bool {
        Arc::ptr_eq(&self.schema, &other.schema)
            && self.sequence == other.sequence
            && self.attributes == other.attributes
            && self.geometry == other.geometry
    }
}

impl fmt::Debug for FrozenEntity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FrozenEntity")
            .field("name", &self.display_name())
            .field("attributes", &self.attributes.len())
            .finish()
    }
}
