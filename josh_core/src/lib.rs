//! Core data model and substep engine for the josh simulation engine.
//!
//! Simulation state is a grid of spatial patches hosting agents and other
//! member entities. Every entity instance shares an immutable
//! [`EntitySchema`](crate::schema::EntitySchema) with the rest of its type
//! and keeps its own current/prior attribute arrays behind a re-entrant
//! substep lock. Attribute values are produced by compiled event handlers
//! running on the [`EventMachine`](crate::machine::EventMachine) stack
//! machine, and committed at `freeze` boundaries into immutable snapshots.
//!
//! This crate holds the data model only; patch grids, spatial indexing,
//! and the substep orchestrator live in `josh-sim`.

pub mod distribution;
pub mod entity;
pub mod error;
pub mod geometry;
pub mod handler;
pub mod machine;
pub mod resolve;
pub mod schema;
pub mod units;
pub mod value;

pub use crate::distribution::Distribution;
pub use crate::entity::{FrozenEntity, GeometryRef, MutableEntity, SubstepLock};
pub use crate::error::{EngineError, Result};
pub use crate::geometry::{
    EarthTransform, Envelope, GeoKey, Geometry, GeometryFactory, IdentityKey, Shape, Space,
};
pub use crate::handler::{
    CompiledAction, CompiledSelector, Event, EventHandler, EventHandlerGroup, EventKey,
};
pub use crate::machine::{resolvers, EventMachine, MachineContext, ValueResolver};
pub use crate::schema::{CandidateGroups, EntitySchema, EntitySchemaBuilder};
pub use crate::units::{Conversion, UnitConverter, Units};
pub use crate::value::{EntityRef, Value};
