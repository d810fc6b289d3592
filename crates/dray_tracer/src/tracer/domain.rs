//! Domain-affinity schedule.
//!
//! Every instance is pinned to one rank, dealt round-robin over its
//! payload's replica locations. A rank traces only the instances it owns
//! and ships every other ray to the owner, so adapters stay resident.

use std::collections::HashMap;
use std::ops::Range;

use dray_core::{InstanceId, SceneDb};

use super::Schedule;
use crate::error::TraceResult;

#[derive(Debug, Clone, Default)]
pub struct DomainSchedule {
    rank: usize,
    owners: HashMap<InstanceId, usize>,
}

impl DomainSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rank that owns `instance` this frame.
    pub fn owner(&self, instance: InstanceId) -> Option<usize> {
        self.owners.get(&instance).copied()
    }

    /// Instances owned by this rank, sorted.
    pub fn owned(&self) -> Vec<InstanceId> {
        let mut owned: Vec<InstanceId> = self
            .owners
            .iter()
            .filter(|&(_, &rank)| rank == self.rank)
            .map(|(&id, _)| id)
            .collect();
        owned.sort_unstable();
        owned
    }
}

impl Schedule for DomainSchedule {
    fn name(&self) -> &'static str {
        "domain"
    }

    fn reset(&mut self, scene: &SceneDb, rank: usize, world_size: usize) -> TraceResult<()> {
        self.rank = rank;
        self.owners = scene.assign_owners(world_size)?;

        let owned = self.owned();
        if owned.is_empty() && !self.owners.is_empty() {
            log::warn!("[rank {}] domain: owns no instance and will idle this frame", rank);
        } else {
            log::debug!("[rank {}] domain: owns instances {:?}", rank, owned);
        }
        Ok(())
    }

    fn accepts(&self, instance: InstanceId) -> bool {
        self.owner(instance) == Some(self.rank)
    }

    fn remote_owner(&self, instance: InstanceId) -> Option<usize> {
        self.owner(instance).filter(|&owner| owner != self.rank)
    }

    fn uses_transport(&self) -> bool {
        true
    }

    /// Every rank routes every camera ray and keeps the ones it owns.
    fn camera_slice(&self, len: usize) -> Range<usize> {
        0..len
    }

    fn keeps_camera_ray(&self, instance: InstanceId) -> bool {
        self.accepts(instance)
    }

    /// Misses are seen by every rank; rank 0 accounts for them.
    fn counts_camera_misses(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dray_core::{PayloadKind, SceneError, Transform};
    use dray_math::{Aabb, Vec3};

    fn scene(instances: usize, locations: Vec<usize>) -> SceneDb {
        let mut scene = SceneDb::new("domains");
        let payload = scene.add_payload(
            "box",
            PayloadKind::Mesh,
            Aabb::from_points(Vec3::ZERO, Vec3::ONE),
        );
        scene.set_locations(payload, locations).unwrap();
        for i in 0..instances {
            scene
                .add_instance(payload, Transform::from_translation(Vec3::new(2.0 * i as f32, 0.0, 0.0)))
                .unwrap();
        }
        scene
    }

    #[test]
    fn test_round_robin_ownership() {
        let scene = scene(4, vec![0, 1]);

        let mut rank0 = DomainSchedule::new();
        rank0.reset(&scene, 0, 2).unwrap();
        let mut rank1 = DomainSchedule::new();
        rank1.reset(&scene, 1, 2).unwrap();

        assert_eq!(rank0.owned(), vec![0, 2]);
        assert_eq!(rank1.owned(), vec![1, 3]);

        assert!(rank0.accepts(2) && !rank0.accepts(3));
        assert_eq!(rank0.remote_owner(3), Some(1));
        assert_eq!(rank0.remote_owner(2), None);
        assert!(rank0.counts_camera_misses() && !rank1.counts_camera_misses());
    }

    #[test]
    fn test_more_ranks_than_instances() {
        let scene = scene(2, vec![0, 1, 2]);
        let mut idle = DomainSchedule::new();
        idle.reset(&scene, 2, 3).unwrap();
        assert!(idle.owned().is_empty());
    }

    #[test]
    fn test_location_outside_world() {
        let scene = scene(1, vec![3]);
        let mut schedule = DomainSchedule::new();
        let err = schedule.reset(&scene, 0, 2).unwrap_err();
        assert!(matches!(
            err,
            crate::error::TraceError::Scene(SceneError::LocationOutOfRange { rank: 3, .. })
        ));
    }
}
