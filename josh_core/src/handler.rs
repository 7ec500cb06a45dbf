use crate::error::Result;
use crate::machine::EventMachine;
use std::fmt;
use std::sync::Arc;

/// The closed set of substeps a handler may be bound to.
///
/// `Remove` is not part of the per-step cycle; it runs only while an entity
/// is being destroyed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Event {
    Init,
    Start,
    Step,
    End,
    Constant,
    Remove,
}

impl Event {
    pub const ALL: [Event; 6] = [
        Event::Init,
        Event::Start,
        Event::Step,
        Event::End,
        Event::Constant,
        Event::Remove,
    ];

    /// Substeps driven during one time step, in execution order.
    pub const STEP_CYCLE: [Event; 3] = [Event::Start, Event::Step, Event::End];

    pub fn name(self) -> &'static str {
        match self {
            Event::Init => "init",
            Event::Start => "start",
            Event::Step => "step",
            Event::End => "end",
            Event::Constant => "constant",
            Event::Remove => "remove",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Event::Init => 0,
            Event::Start => 1,
            Event::Step => 2,
            Event::End => 3,
            Event::Constant => 4,
            Event::Remove => 5,
        }
    }

    pub fn from_name(name: &str) -> Option<Event> {
        Event::ALL.iter().copied().find(|e| e.name() == name)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identity of a handler group: target attribute, substep, and an optional
/// state qualifier. State-qualified keys are distinct from their
/// unqualified counterparts.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct EventKey {
    pub attribute: Arc<str>,
    pub event: Event,
    pub state: Option<Arc<str>>,
}

impl EventKey {
    pub fn new(attribute: &str, event: Event) -> EventKey {
        EventKey {
            attribute: Arc::from(attribute),
            event,
            state: None,
        }
    }

    pub fn with_state(attribute: &str, event: Event, state: &str) -> EventKey {
        EventKey {
            attribute: Arc::from(attribute),
            event,
            state: Some(Arc::from(state)),
        }
    }

    /// Key under which this group is found in the schema handler cache.
    pub fn cache_key(&self) -> String {
        match &self.state {
            Some(state) => format!("{}:{}:{}", self.attribute, self.event, state),
            None => format!("{}:{}", self.attribute, self.event),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.cache_key())
    }
}

/// Compiled predicate deciding whether a handler fires. Runs on the
/// expression machine bound to the locked entity.
pub type CompiledSelector = Arc<dyn Fn(&mut EventMachine<'_>) -> Result<bool> + Send + Sync>;

/// Compiled handler body. Its terminal stack value becomes the attribute
/// value.
pub type CompiledAction = Arc<dyn Fn(&mut EventMachine<'_>) -> Result<()> + Send + Sync>;

/// One event handler: an optional selector gate plus an action.
#[derive(Clone)]
pub struct EventHandler {
    pub key: EventKey,
    pub selector: Option<CompiledSelector>,
    pub action: CompiledAction,
}

impl EventHandler {
    pub fn new(key: EventKey, action: CompiledAction) -> EventHandler {
        EventHandler {
            key,
            selector: None,
            action,
        }
    }

    pub fn with_selector(
        key: EventKey,
        selector: CompiledSelector,
        action: CompiledAction,
    ) -> EventHandler {
        EventHandler {
            key,
            selector: Some(selector),
            action,
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.selector.is_some()
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("key", &self.key)
            .field("conditional", &self.is_conditional())
            .finish()
    }
}

/// Ordered handlers sharing one [`EventKey`]. Declaration order is
/// resolution order: the first handler whose selector passes fires.
#[derive(Clone, Debug)]
pub struct EventHandlerGroup {
    key: EventKey,
    handlers: Vec<EventHandler>,
}

impl EventHandlerGroup {
    pub fn new(key: EventKey) -> EventHandlerGroup {
        EventHandlerGroup {
            key,
            handlers: Vec::new(),
        }
    }

    pub fn of(key: EventKey, handlers: Vec<EventHandler>) -> EventHandlerGroup {
        EventHandlerGroup { key, handlers }
    }

    pub fn push(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    pub fn key(&self) -> &EventKey {
        &self.key
    }

    pub fn handlers(&self) -> &[EventHandler] {
        &self.handlers
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Attributes written by this group's handlers. Usually just the key
    /// attribute, but each handler carries its own key so compound groups
    /// stay honest.
    pub fn target_attributes(&self) -> impl Iterator<Item = &Arc<str>> {
        self.handlers.iter().map(|h| &h.key.attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_round_trip() {
        for event in Event::ALL.iter() {
            assert_eq!(Event::from_name(event.name()), Some(*event));
        }
        assert_eq!(Event::from_name("later"), None);
    }

    #[test]
    fn cache_keys_distinguish_state() {
        let bare = EventKey::new("age", Event::Step);
        let qualified = EventKey::with_state("age", Event::Step, "adult");
        assert_eq!(bare.cache_key(), "age:step");
        assert_eq!(qualified.cache_key(), "age:step:adult");
        assert_ne!(bare, qualified);
    }
}
