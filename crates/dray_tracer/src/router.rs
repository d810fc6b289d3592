//! Spatial router: a bounding volume hierarchy over instance bounds.
//!
//! Maps a ray to the next instance it enters. The tree is rebuilt from the
//! scene database when instances are reset and is immutable while a frame
//! runs, so routing is a pure function of the ray.

use dray_core::{Instance, InstanceId};
use dray_math::{Aabb, Interval};
use rayon::prelude::*;

use crate::chunk::chunk_size;
use crate::Ray;

/// Maximum instances per leaf node before splitting.
const LEAF_MAX_SIZE: usize = 4;

/// Hits closer than this past the ray's current `t` are ignored.
pub const ROUTE_EPSILON: f32 = 1e-4;

/// Result of routing one ray.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Next instance to visit, `None` when the ray leaves the scene.
    pub next: Option<InstanceId>,
    /// Distance to the instance boundary.
    pub t: f32,
}

impl Hit {
    pub const NONE: Hit = Hit {
        next: None,
        t: f32::INFINITY,
    };
}

/// BVH node - either a branch with two children or a leaf with instance bounds.
enum BvhNode {
    Branch {
        left: Box<BvhNode>,
        right: Box<BvhNode>,
        bbox: Aabb,
    },
    Leaf {
        instances: Vec<(InstanceId, Aabb)>,
        bbox: Aabb,
    },
    Empty,
}

impl BvhNode {
    /// Simple median-split approach: sort by centroid on the longest
    /// centroid axis, split in half, recurse.
    fn build(mut instances: Vec<(InstanceId, Aabb)>) -> Self {
        if instances.is_empty() {
            return BvhNode::Empty;
        }

        let bounds = instances
            .iter()
            .fold(Aabb::EMPTY, |acc, (_, b)| Aabb::surrounding(&acc, b));

        if instances.len() <= LEAF_MAX_SIZE {
            return BvhNode::Leaf {
                instances,
                bbox: bounds,
            };
        }

        let centroid_bounds = instances.iter().fold(Aabb::EMPTY, |acc, (_, b)| {
            let c = b.centroid();
            Aabb::surrounding(&acc, &Aabb::from_points(c, c))
        });
        let axis = centroid_bounds.longest_axis();

        // Stable sort keeps declaration order among equal centroids, so
        // the tree (and every routing result) is reproducible.
        instances.sort_by(|(_, a), (_, b)| {
            a.centroid()[axis]
                .partial_cmp(&b.centroid()[axis])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let right = instances.split_off(instances.len() / 2);
        BvhNode::Branch {
            left: Box::new(Self::build(instances)),
            right: Box::new(Self::build(right)),
            bbox: bounds,
        }
    }

    fn nearest(&self, ray: &Ray, ray_t: Interval, exclude: Option<InstanceId>, best: &mut Hit) {
        match self {
            BvhNode::Empty => {}

            BvhNode::Leaf { instances, bbox } => {
                if !bbox.hit(ray.origin, ray.direction, ray_t.clip_max(best.t)) {
                    return;
                }
                for (id, bounds) in instances {
                    if Some(*id) == exclude {
                        continue;
                    }
                    let window = ray_t.clip_max(best.t);
                    if let Some(t) = bounds.entry(ray.origin, ray.direction, window) {
                        if t < best.t {
                            *best = Hit { next: Some(*id), t };
                        }
                    }
                }
            }

            BvhNode::Branch { left, right, bbox } => {
                if !bbox.hit(ray.origin, ray.direction, ray_t.clip_max(best.t)) {
                    return;
                }
                left.nearest(ray, ray_t, exclude, best);
                right.nearest(ray, ray_t, exclude, best);
            }
        }
    }
}

/// Instance router for one frame.
pub struct Router {
    root: BvhNode,
    instance_count: usize,
}

impl Router {
    /// Build the router over the world bounds of every instance.
    pub fn new(instances: &[Instance]) -> Self {
        Self::from_bounds(instances.iter().map(|i| (i.id, i.world_bounds)).collect())
    }

    pub fn from_bounds(instances: Vec<(InstanceId, Aabb)>) -> Self {
        let instance_count = instances.len();
        log::debug!("Router: building BVH over {} instances", instance_count);
        Self {
            root: BvhNode::build(instances),
            instance_count,
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instance_count
    }

    /// Nearest instance the ray enters strictly past `t + ROUTE_EPSILON`,
    /// ignoring `exclude`.
    pub fn intersect(&self, ray: &Ray, exclude: Option<InstanceId>) -> Hit {
        let ray_t = Interval::new(ray.t + ROUTE_EPSILON, ray.t_max);
        let mut best = Hit::NONE;
        if !ray_t.is_empty() {
            self.root.nearest(ray, ray_t, exclude, &mut best);
        }
        best
    }

    /// Route a chunk of rays on the calling thread.
    pub fn route_chunk(&self, rays: &[Ray], exclude: Option<InstanceId>) -> Vec<Hit> {
        rays.iter().map(|r| self.intersect(r, exclude)).collect()
    }

    /// Route a batch in parallel over fixed-size chunks. One hit per ray,
    /// in input order.
    pub fn route(&self, rays: &[Ray], exclude: Option<InstanceId>) -> Vec<Hit> {
        let chunk = chunk_size(rays.len(), rayon::current_num_threads());
        rays.par_chunks(chunk)
            .flat_map_iter(|c| self.route_chunk(c, exclude))
            .collect()
    }
}
