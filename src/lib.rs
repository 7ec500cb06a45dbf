//! Josh is a geospatial agent-based simulation engine.
//!
//! Simulation state is a grid of spatial patches, each hosting agents,
//! disturbances, and other member entities. Entity attributes are
//! recomputed in discrete substeps of a time step by compiled event
//! handlers running on a small stack machine, with prior-substep values
//! preserved behind an explicit freeze boundary.
//!
//! The engine is split in two:
//!
//! * `josh-core` — values and units, geometry, entity schemas, the
//!   mutable entity cell with its re-entrant substep lock, handler
//!   resolution, and the expression machine.
//! * `josh-sim` — the replicate (patch grid, spatial index, resource
//!   cache) and the substep orchestrator driving it across a thread pool.
//!
//! ```
//! use josh::prelude::*;
//! use std::sync::Arc;
//!
//! let schema = EntitySchemaBuilder::new("Tree")
//!     .initial_attribute("age", Value::int(0, Units::count()))
//!     .handler(EventHandler::new(
//!         EventKey::new("age", Event::Step),
//!         Arc::new(|machine: &mut EventMachine| {
//!             machine.push_prior("age")?;
//!             machine.push(Value::int(1, Units::count()));
//!             machine.add()
//!         }),
//!     ))
//!     .build();
//!
//! let replicate = Replicate::new();
//! replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
//! replicate.register_schema(schema);
//!
//! let geometry = Arc::new(
//!     GeometryFactory::grid()
//!         .square(0.0, 0.0, 1.0, Space::Grid)
//!         .unwrap(),
//! );
//! let patch = replicate.add_patch("Patch", geometry).unwrap();
//! let tree = replicate.add_member(&patch, "Tree").unwrap();
//!
//! let sim = Simulation::new(replicate, SimConfig::default()).unwrap();
//! sim.initialize().unwrap();
//! sim.step().unwrap();
//! assert_eq!(
//!     tree.get_attribute("age").unwrap(),
//!     Some(Value::int(1, Units::count()))
//! );
//! ```

pub use josh_core::*;
pub use josh_sim::*;

pub mod prelude {
    pub use josh_core::distribution::Distribution;
    pub use josh_core::entity::{FrozenEntity, MutableEntity};
    pub use josh_core::error::{EngineError, Result};
    pub use josh_core::geometry::{GeoKey, Geometry, GeometryFactory, IdentityKey, Space};
    pub use josh_core::handler::{Event, EventHandler, EventHandlerGroup, EventKey};
    pub use josh_core::machine::{resolvers, EventMachine, MachineContext};
    pub use josh_core::schema::{EntitySchema, EntitySchemaBuilder};
    pub use josh_core::units::{UnitConverter, Units};
    pub use josh_core::value::Value;
    pub use josh_sim::cache::{ResourceCache, ResourceReader};
    pub use josh_sim::orchestrator::{SimConfig, Simulation, StepReport};
    pub use josh_sim::patch::Patch;
    pub use josh_sim::replicate::Replicate;
}
