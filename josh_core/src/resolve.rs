use crate::entity::MutableEntity;
use crate::error::{EngineError, Result};
use crate::handler::{Event, EventHandler};
use crate::machine::{EventMachine, MachineContext};
use crate::schema::{CandidateGroups, EntitySchema};
use crate::value::Value;
use tracing::trace;

/// Ordered candidate groups for an attribute in a substep.
///
/// Pure over the schema: the no-handler bitmap short-circuits, the state
/// qualifier only participates when the schema uses states at all, and the
/// cache guarantees the unqualified group precedes the qualified one.
pub fn candidate_groups(
    schema: &EntitySchema,
    attribute: &str,
    event: Event,
    state: Option<&str>,
) -> CandidateGroups {
    if let Some(index) = schema.attribute_index(attribute) {
        if schema.has_no_handlers(event, index) {
            return CandidateGroups::new();
        }
    }
    let state = if schema.uses_state() { state } else { None };
    schema
        .candidate_groups(attribute, event, state)
        .iter()
        .cloned()
        .collect()
}

/// Evaluates a handler's selector. Unconditional handlers always pass.
pub fn selector_passes(handler: &EventHandler, ctx: &mut dyn MachineContext) -> Result<bool> {
    match &handler.selector {
        None => Ok(true),
        Some(selector) => {
            let mut machine = EventMachine::new(ctx);
            selector(&mut machine)
        }
    }
}

/// Runs a handler action and returns its terminal stack value.
pub fn run_action(handler: &EventHandler, ctx: &mut dyn MachineContext) -> Result<Value> {
    let mut machine = EventMachine::new(ctx);
    (handler.action)(&mut machine)?;
    machine.result()
}

/// The `state` attribute of an entity, when declared and currently a
/// string. Resolution keys are formed with this.
pub fn current_state(entity: &MutableEntity) -> Option<String> {
    let index = entity.schema().state_attribute()?;
    match entity.get_attribute_by_index(index) {
        Ok(Some(Value::Str(state))) => Some(state.to_string()),
        _ => None,
    }
}

/// Resolves and runs the handlers for one attribute of the bound entity.
///
/// Within each candidate group the first handler whose selector passes
/// fires and closes the group; when nothing fires the attribute keeps its
/// prior value. Returns whether any handler wrote the attribute.
pub fn execute_attribute(
    schema: &EntitySchema,
    index: u32,
    event: Event,
    state: Option<&str>,
    ctx: &mut dyn MachineContext,
) -> Result<bool> {
    let attribute = schema
        .attribute_name(index)
        .ok_or_else(|| {
            EngineError::schema(
                schema.name(),
                format!("attribute index {} out of range", index),
            )
        })?
        .clone();

    if schema.has_no_handlers(event, index) {
        return Ok(false);
    }
    let state = if schema.uses_state() { state } else { None };
    let groups: CandidateGroups = schema
        .candidate_groups(&attribute, event, state)
        .iter()
        .cloned()
        .collect();
    if groups.is_empty() {
        return Ok(false);
    }

    let entity = ctx.entity().clone();
    let mut fired = false;
    for group in groups.iter() {
        for handler in group.handlers() {
            if !selector_passes(handler, ctx)? {
                continue;
            }
            let value = run_action(handler, ctx)?;
            entity.set_attribute_by_index(index, value)?;
            trace!(
                entity = %schema.name(),
                attribute = %attribute,
                substep = %event,
                "handler fired"
            );
            fired = true;
            break;
        }
    }
    Ok(fired)
}
