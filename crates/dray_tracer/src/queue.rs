//! Per-instance ray queues.
//!
//! One lock per instance, held in an arena indexed by a dense slot number.
//! The arena is built at frame reset, together with the router, and is
//! never resized while rays are being routed.

use std::collections::HashMap;

use dray_core::InstanceId;
use parking_lot::Mutex;

use crate::error::{TraceError, TraceResult};
use crate::ray::RayVector;

/// Per-thread scratch queues, flushed into the shared queues at the end
/// of a parallel chunk.
pub type LocalQueues = HashMap<InstanceId, RayVector>;

/// Mapping from instance to its pending rays.
pub struct QueueManager {
    /// Instance id -> dense slot
    index: HashMap<InstanceId, usize>,
    /// Dense slot -> instance id, in declaration order
    ids: Vec<InstanceId>,
    slots: Vec<Mutex<RayVector>>,
    /// Capacity left behind by `drain`
    reserve: usize,
}

impl QueueManager {
    /// Create one empty queue per instance.
    pub fn new(ids: impl IntoIterator<Item = InstanceId>, reserve: usize) -> Self {
        let mut queues = Self {
            index: HashMap::new(),
            ids: Vec::new(),
            slots: Vec::new(),
            reserve,
        };
        queues.reset(ids);
        queues
    }

    /// Rebuild the arena for a new instance set. Taking `&mut self`
    /// guarantees no router thread holds a queue.
    pub fn reset(&mut self, ids: impl IntoIterator<Item = InstanceId>) {
        self.ids = ids.into_iter().collect();
        self.index = self
            .ids
            .iter()
            .enumerate()
            .map(|(slot, id)| (*id, slot))
            .collect();
        self.slots = self
            .ids
            .iter()
            .map(|_| Mutex::new(RayVector::with_capacity(self.reserve)))
            .collect();
    }

    /// Empty every queue, keeping the arena.
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.lock().clear();
        }
    }

    fn slot(&self, id: InstanceId) -> TraceResult<&Mutex<RayVector>> {
        self.index
            .get(&id)
            .map(|&slot| &self.slots[slot])
            .ok_or(TraceError::UnknownInstance(id))
    }

    /// Instance ids in declaration order.
    pub fn ids(&self) -> &[InstanceId] {
        &self.ids
    }

    /// Append rays to one instance's queue.
    pub fn enqueue(&self, id: InstanceId, mut rays: RayVector) -> TraceResult<()> {
        let slot = self.slot(id)?;
        slot.lock().append(&mut rays);
        Ok(())
    }

    /// Move every scratch queue into the shared queues, taking each
    /// instance's lock once.
    pub fn flush(&self, local: &mut LocalQueues) -> TraceResult<()> {
        for (id, rays) in local.iter_mut() {
            if rays.is_empty() {
                continue;
            }
            self.slot(*id)?.lock().append(rays);
        }
        Ok(())
    }

    /// Take the whole queue, leaving an empty buffer with reserved capacity.
    pub fn drain(&self, id: InstanceId) -> TraceResult<RayVector> {
        let slot = self.slot(id)?;
        let mut fresh = RayVector::with_capacity(self.reserve);
        std::mem::swap(&mut *slot.lock(), &mut fresh);
        Ok(fresh)
    }

    /// Number of rays queued for one instance.
    pub fn len(&self, id: InstanceId) -> usize {
        self.slot(id).map(|s| s.lock().len()).unwrap_or(0)
    }

    /// Total rays queued across all instances.
    pub fn pending(&self) -> usize {
        self.slots.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.lock().is_empty())
    }

    /// The accepted instance with the most queued rays.
    ///
    /// Ties go to the first instance in declaration order. Returns `None`
    /// when every accepted queue is empty.
    pub fn largest(&self, accept: impl Fn(InstanceId) -> bool) -> Option<(InstanceId, usize)> {
        let mut target = None;
        let mut amount = 0;
        for (id, slot) in self.ids.iter().zip(&self.slots) {
            if !accept(*id) {
                continue;
            }
            let len = slot.lock().len();
            if len > amount {
                amount = len;
                target = Some(*id);
            }
        }
        target.map(|id| (id, amount))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ray;
    use dray_math::Vec3;
    use rayon::prelude::*;

    fn rays(ids: std::ops::Range<i32>) -> RayVector {
        ids.map(|i| Ray::new(Vec3::ZERO, Vec3::X).with_id(i)).collect()
    }

    #[test]
    fn test_enqueue_and_drain() {
        let queues = QueueManager::new([3, 10, 42], 16);
        queues.enqueue(10, rays(0..5)).unwrap();
        queues.enqueue(10, rays(5..8)).unwrap();

        assert_eq!(queues.len(10), 8);
        assert_eq!(queues.pending(), 8);

        let drained = queues.drain(10).unwrap();
        assert_eq!(drained.len(), 8);
        assert_eq!(drained[7].id, 7);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_unknown_instance() {
        let queues = QueueManager::new([0, 1], 16);
        let err = queues.enqueue(5, rays(0..1)).unwrap_err();
        assert!(matches!(err, TraceError::UnknownInstance(5)));
        assert!(queues.drain(5).is_err());
        assert_eq!(queues.len(5), 0);
    }

    #[test]
    fn test_largest_ties_go_to_declaration_order() {
        let queues = QueueManager::new([7, 2, 9], 16);
        queues.enqueue(2, rays(0..4)).unwrap();
        queues.enqueue(9, rays(0..4)).unwrap();
        queues.enqueue(7, rays(0..1)).unwrap();

        assert_eq!(queues.largest(|_| true), Some((2, 4)));
        assert_eq!(queues.largest(|id| id != 2), Some((9, 4)));
        assert_eq!(queues.largest(|id| id == 7), Some((7, 1)));
    }

    #[test]
    fn test_largest_empty() {
        let queues = QueueManager::new([0, 1], 16);
        assert_eq!(queues.largest(|_| true), None);
    }

    #[test]
    fn test_flush_local_queues() {
        let queues = QueueManager::new([0, 1], 16);
        let mut local = LocalQueues::new();
        local.entry(0).or_default().extend(rays(0..3));
        local.entry(1).or_default().extend(rays(3..4));

        queues.flush(&mut local).unwrap();
        assert_eq!(queues.len(0), 3);
        assert_eq!(queues.len(1), 1);
        assert!(local.values().all(|q| q.is_empty()));
    }

    #[test]
    fn test_reset_rebuilds_arena() {
        let mut queues = QueueManager::new([0, 1], 16);
        queues.enqueue(0, rays(0..3)).unwrap();

        queues.reset([5, 6, 7]);
        assert!(queues.is_empty());
        assert_eq!(queues.ids(), &[5, 6, 7]);
        assert!(queues.enqueue(0, rays(0..1)).is_err());
        queues.enqueue(7, rays(0..1)).unwrap();

        queues.clear();
        assert_eq!(queues.pending(), 0);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let queues = QueueManager::new(0..8, 16);

        (0..64i32).into_par_iter().for_each(|chunk| {
            let mut local = LocalQueues::new();
            for i in 0..100 {
                let id = chunk * 100 + i;
                local
                    .entry((id % 8) as InstanceId)
                    .or_default()
                    .push(Ray::new(Vec3::ZERO, Vec3::X).with_id(id));
            }
            queues.flush(&mut local).unwrap();
        });

        assert_eq!(queues.pending(), 6400);

        let mut seen: Vec<i32> = (0..8)
            .flat_map(|q| queues.drain(q).unwrap())
            .map(|r| r.id)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..6400).collect::<Vec<_>>());
    }
}
