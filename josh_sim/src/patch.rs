use josh_core::entity::MutableEntity;
use josh_core::geometry::{Geometry, IdentityKey};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// One grid cell: a root spatial entity plus the member entities (agents,
/// disturbances) living on it.
///
/// The patch entity owns the geometry; members borrow it through their
/// parent back-reference. `position` is the patch's index in replicate
/// order and doubles as the major key of the global lock order.
pub struct Patch {
    position: usize,
    entity: Arc<MutableEntity>,
    members: RwLock<Vec<Arc<MutableEntity>>>,
}

impl Patch {
    pub fn new(position: usize, entity: Arc<MutableEntity>) -> Arc<Patch> {
        Arc::new(Patch {
            position,
            entity,
            members: RwLock::new(Vec::new()),
        })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn entity(&self) -> &Arc<MutableEntity> {
        &self.entity
    }

    pub fn geometry(&self) -> Option<Arc<Geometry>> {
        self.entity.geometry()
    }

    pub fn add_member(&self, member: Arc<MutableEntity>) {
        self.members.write().push(member);
    }

    /// Detaches a member by identity; returns it when found.
    pub fn remove_member(&self, identity: &IdentityKey) -> Option<Arc<MutableEntity>> {
        let mut members = self.members.write();
        let at = members
            .iter()
            .position(|member| member.identity_key() == *identity)?;
        Some(members.swap_remove(at))
    }

    pub fn members(&self) -> Vec<Arc<MutableEntity>> {
        self.members.read().clone()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    /// The patch entity followed by its members, the order a substep task
    /// walks them.
    pub fn entities(&self) -> Vec<Arc<MutableEntity>> {
        let members = self.members.read();
        let mut all = Vec::with_capacity(1 + members.len());
        all.push(self.entity.clone());
        all.extend(members.iter().cloned());
        all
    }
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Patch")
            .field("position", &self.position)
            .field("entity", &self.entity.display_name())
            .field("members", &self.member_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use josh_core::geometry::{GeometryFactory, Space};
    use josh_core::schema::EntitySchemaBuilder;

    fn patch() -> Arc<Patch> {
        let schema = EntitySchemaBuilder::new("Patch").build();
        let geometry = Arc::new(
            GeometryFactory::grid()
                .square(0.0, 0.0, 1.0, Space::Grid)
                .unwrap(),
        );
        Patch::new(0, MutableEntity::with_geometry(schema, geometry))
    }

    #[test]
    fn members_borrow_the_patch_geometry() {
        let patch = patch();
        let agent_schema = EntitySchemaBuilder::new("Agent").build();
        let agent = MutableEntity::member_of(agent_schema, patch.entity());
        patch.add_member(agent.clone());

        assert_eq!(patch.member_count(), 1);
        assert_eq!(agent.geometry(), patch.geometry());
        assert_eq!(patch.entities().len(), 2);
    }

    #[test]
    fn remove_member_by_identity() {
        let patch = patch();
        let agent_schema = EntitySchemaBuilder::new("Agent").build();
        let agent = MutableEntity::member_of(agent_schema, patch.entity());
        patch.add_member(agent.clone());

        let detached = patch.remove_member(&agent.identity_key());
        assert!(detached.is_some());
        assert_eq!(patch.member_count(), 0);
        assert!(patch.remove_member(&agent.identity_key()).is_none());
    }
}
