use crate::handler::{Event, EventHandler, EventHandlerGroup, EventKey};
use crate::value::Value;
use bit_set::BitSet;
use fxhash::{FxHashMap, FxHashSet};
use itertools::Itertools;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

/// Candidate handler groups for one resolution key. Almost always one or
/// two entries (the unqualified group, then the state-qualified group).
pub type CandidateGroups = SmallVec<[Arc<EventHandlerGroup>; 2]>;

/// Shared immutable metadata for one entity type.
///
/// Built once per declaration and shared by reference across every
/// instance and thread; all per-instance state lives in the entity itself.
/// Attribute names are assigned indices in alphabetical order so that
/// iteration order is deterministic across runs.
pub struct EntitySchema {
    name: Arc<str>,
    attr_index: FxHashMap<Arc<str>, u32>,
    attr_names: Vec<Arc<str>>,
    attribute_set: FxHashSet<Arc<str>>,
    handlers_by_key: FxHashMap<EventKey, Arc<EventHandlerGroup>>,
    no_handlers: Vec<BitSet>,
    handler_cache: FxHashMap<String, CandidateGroups>,
    uses_state: bool,
    state_attribute: Option<u32>,
    initial_values: Vec<Option<Value>>,
}

impl EntitySchema {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn attribute_count(&self) -> usize {
        self.attr_names.len()
    }

    pub fn attribute_index(&self, name: &str) -> Option<u32> {
        self.attr_index.get(name).copied()
    }

    pub fn attribute_name(&self, index: u32) -> Option<&Arc<str>> {
        self.attr_names.get(index as usize)
    }

    /// Attribute names in index order (alphabetical).
    pub fn attribute_names(&self) -> &[Arc<str>] {
        &self.attr_names
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute_set.contains(name)
    }

    pub fn initial_values(&self) -> &[Option<Value>] {
        &self.initial_values
    }

    pub fn group(&self, key: &EventKey) -> Option<&Arc<EventHandlerGroup>> {
        self.handlers_by_key.get(key)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Arc<EventHandlerGroup>> {
        self.handlers_by_key.values()
    }

    /// Whether any handler key on this schema carries a state qualifier.
    pub fn uses_state(&self) -> bool {
        self.uses_state
    }

    /// Index of the `state` attribute, when declared.
    pub fn state_attribute(&self) -> Option<u32> {
        self.state_attribute
    }

    /// O(1) test for "this attribute keeps its prior value through this
    /// substep": it had an initial value and no handler group matches the
    /// substep under any state.
    pub fn has_no_handlers(&self, event: Event, index: u32) -> bool {
        self.no_handlers[event.index()].contains(index as usize)
    }

    /// Ordered candidate groups for `(attribute, event, state)`. The
    /// unqualified group always precedes the state-qualified one. Returns
    /// an empty slice when nothing matches.
    pub fn candidate_groups(
        &self,
        attribute: &str,
        event: Event,
        state: Option<&str>,
    ) -> &[Arc<EventHandlerGroup>] {
        let key = match state {
            Some(state) if !state.is_empty() => {
                format!("{}:{}:{}", attribute, event, state)
            }
            _ => format!("{}:{}", attribute, event),
        };
        match self.handler_cache.get(&key) {
            Some(groups) => groups,
            None => &[],
        }
    }
}

impl std::fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EntitySchema")
            .field("name", &self.name)
            .field("attributes", &self.attr_names)
            .field("groups", &self.handlers_by_key.len())
            .field("uses_state", &self.uses_state)
            .finish()
    }
}

/// Builds one [`EntitySchema`] from declared handlers and initial
/// attribute values.
pub struct EntitySchemaBuilder {
    name: Arc<str>,
    groups: FxHashMap<EventKey, EventHandlerGroup>,
    initial: FxHashMap<Arc<str>, Value>,
}

impl EntitySchemaBuilder {
    pub fn new(name: &str) -> EntitySchemaBuilder {
        EntitySchemaBuilder {
            name: Arc::from(name),
            groups: FxHashMap::default(),
            initial: FxHashMap::default(),
        }
    }

    pub fn initial_attribute(mut self, name: &str, value: Value) -> EntitySchemaBuilder {
        self.initial.insert(Arc::from(name), value);
        self
    }

    /// Adds a handler, grouping it with any previous handlers that share
    /// its key. Declaration order within the group is preserved.
    pub fn handler(mut self, handler: EventHandler) -> EntitySchemaBuilder {
        let key = handler.key.clone();
        self.groups
            .entry(key.clone())
            .or_insert_with(|| EventHandlerGroup::new(key))
            .push(handler);
        self
    }

    pub fn handler_group(mut self, group: EventHandlerGroup) -> EntitySchemaBuilder {
        let key = group.key().clone();
        let entry = self
            .groups
            .entry(key.clone())
            .or_insert_with(|| EventHandlerGroup::new(key));
        for handler in group.handlers() {
            entry.push(handler.clone());
        }
        self
    }

    pub fn build(self) -> Arc<EntitySchema> {
        let EntitySchemaBuilder {
            name,
            groups,
            initial,
        } = self;

        // Attribute universe: declared initial attributes plus every
        // attribute targeted by a handler.
        let mut attribute_set: FxHashSet<Arc<str>> = initial.keys().cloned().collect();
        for group in groups.values() {
            attribute_set.insert(group.key().attribute.clone());
            for attr in group.target_attributes() {
                attribute_set.insert(attr.clone());
            }
        }

        let attr_names: Vec<Arc<str>> = attribute_set.iter().cloned().sorted().collect();
        let attr_index: FxHashMap<Arc<str>, u32> = attr_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u32))
            .collect();

        // Groups that ended up with no handlers carry no behavior; keeping
        // them would leave cache entries behind bitmap-cleared attributes.
        let handlers_by_key: FxHashMap<EventKey, Arc<EventHandlerGroup>> = groups
            .into_iter()
            .filter(|(_, group)| !group.is_empty())
            .map(|(key, group)| (key, Arc::new(group)))
            .collect();

        // Per-substep bitmap: starts with every initialized attribute set,
        // then any handler targeting the attribute in that substep clears
        // the bit, state-qualified or not.
        let mut no_handlers: Vec<BitSet> = Event::ALL
            .iter()
            .map(|_| {
                let mut bits = BitSet::with_capacity(attr_names.len());
                for name in initial.keys() {
                    if let Some(&i) = attr_index.get(name) {
                        bits.insert(i as usize);
                    }
                }
                bits
            })
            .collect();
        for (key, group) in handlers_by_key.iter() {
            let bits = &mut no_handlers[key.event.index()];
            for attr in group.target_attributes() {
                if let Some(&i) = attr_index.get(attr) {
                    bits.remove(i as usize);
                }
            }
        }

        // Resolution cache. Keys are "attr:substep" and
        // "attr:substep:state"; the unqualified group is always listed
        // before the state-qualified one, and empty candidate lists are
        // never stored.
        let mut states: FxHashSet<Arc<str>> = FxHashSet::default();
        for key in handlers_by_key.keys() {
            if let Some(state) = &key.state {
                states.insert(state.clone());
            }
        }
        let uses_state = !states.is_empty();

        let mut handler_cache: FxHashMap<String, CandidateGroups> = FxHashMap::default();
        for attr in attr_names.iter() {
            for event in Event::ALL.iter() {
                let bare_key = EventKey {
                    attribute: attr.clone(),
                    event: *event,
                    state: None,
                };
                let bare = handlers_by_key.get(&bare_key).cloned();

                if let Some(group) = bare.clone() {
                    let mut list = CandidateGroups::new();
                    list.push(group);
                    handler_cache.insert(bare_key.cache_key(), list);
                }

                for state in states.iter() {
                    let qualified_key = EventKey {
                        attribute: attr.clone(),
                        event: *event,
                        state: Some(state.clone()),
                    };
                    let mut list = CandidateGroups::new();
                    if let Some(group) = bare.clone() {
                        list.push(group);
                    }
                    if let Some(group) = handlers_by_key.get(&qualified_key) {
                        list.push(group.clone());
                    }
                    if !list.is_empty() {
                        handler_cache.insert(qualified_key.cache_key(), list);
                    }
                }
            }
        }

        let mut initial_values: Vec<Option<Value>> = vec![None; attr_names.len()];
        for (attr, value) in initial.into_iter() {
            if let Some(&i) = attr_index.get(&attr) {
                initial_values[i as usize] = Some(value);
            }
        }

        let state_attribute = attr_index.get("state").copied();

        debug!(
            entity = %name,
            attributes = attr_names.len(),
            groups = handlers_by_key.len(),
            cached_keys = handler_cache.len(),
            "built entity schema"
        );

        Arc::new(EntitySchema {
            name,
            attr_index,
            attr_names,
            attribute_set,
            handlers_by_key,
            no_handlers,
            handler_cache,
            uses_state,
            state_attribute,
            initial_values,
        })
    }
}
