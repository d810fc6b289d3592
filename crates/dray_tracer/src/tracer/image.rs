//! Image-affinity schedule.
//!
//! Every rank routes a contiguous slice of the camera rays and traces
//! whichever instance has the most queued rays, with its own adapters.
//! Rays never leave the rank that generated them.

use std::ops::Range;

use dray_core::{InstanceId, SceneDb};

use super::Schedule;
use crate::chunk::rank_slice;
use crate::error::TraceResult;

#[derive(Debug, Clone, Default)]
pub struct ImageSchedule {
    rank: usize,
    world_size: usize,
}

impl ImageSchedule {
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl Schedule for ImageSchedule {
    fn name(&self) -> &'static str {
        "image"
    }

    fn reset(&mut self, _scene: &SceneDb, rank: usize, world_size: usize) -> TraceResult<()> {
        self.rank = rank;
        self.world_size = world_size;
        Ok(())
    }

    fn accepts(&self, _instance: InstanceId) -> bool {
        true
    }

    fn remote_owner(&self, _instance: InstanceId) -> Option<usize> {
        None
    }

    fn uses_transport(&self) -> bool {
        false
    }

    fn camera_slice(&self, len: usize) -> Range<usize> {
        rank_slice(len, self.rank, self.world_size)
    }

    fn keeps_camera_ray(&self, _instance: InstanceId) -> bool {
        true
    }

    fn counts_camera_misses(&self) -> bool {
        true
    }
}
