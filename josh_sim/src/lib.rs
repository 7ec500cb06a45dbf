//! Replicate state and substep orchestration for the josh simulation
//! engine.
//!
//! A [`Replicate`](crate::replicate::Replicate) owns the patch grid, the
//! spatial index, and the external-resource cache; a
//! [`Simulation`](crate::orchestrator::Simulation) drives the substep
//! cycle over it, batching patches across a rayon pool and committing
//! every entity at substep boundaries. Handlers reach the replicate
//! through [`ReplicateScope`](crate::scope::ReplicateScope), the machine
//! context that backs spatial queries, entity creation, and external
//! reads.

pub mod cache;
pub mod index;
pub mod orchestrator;
pub mod patch;
pub mod replicate;
pub mod scope;

pub use crate::cache::{ResourceCache, ResourceReader};
pub use crate::index::SpatialIndex;
pub use crate::orchestrator::{SimConfig, Simulation, StepError, StepReport};
pub use crate::patch::Patch;
pub use crate::replicate::{Replicate, ReplicateBuilder};
pub use crate::scope::ReplicateScope;
