//! Scene database for the ray scheduler.
//!
//! The database is read-only while a frame runs. The scheduler reads
//! instances, payloads and lights from it and only writes frame
//! statistics back.

use std::collections::HashMap;
use std::sync::Arc;

use dray_math::{Aabb, InstanceTransform, Mat4, Mat4Ext, Quat, Vec3};
use parking_lot::Mutex;
use thiserror::Error;

use crate::stats::FrameStats;

/// Identity of a geometry payload.
pub type PayloadId = usize;

/// Identity of an instance. Stable for the lifetime of the database,
/// not necessarily dense.
pub type InstanceId = u32;

/// Errors raised by missing or inconsistent scene entries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("payload {0} does not exist")]
    MissingPayload(PayloadId),

    #[error("instance {0} does not exist")]
    MissingInstance(InstanceId),

    #[error("instance {0} already exists")]
    DuplicateInstance(InstanceId),

    #[error("payload {payload} is located on rank {rank} but the world has {world_size} ranks")]
    LocationOutOfRange {
        payload: PayloadId,
        rank: usize,
        world_size: usize,
    },
}

/// Result type for scene operations.
pub type SceneResult<T> = Result<T, SceneError>;

/// What kind of geometry a payload holds. Adapters use this to decide
/// how to lay out the rays they return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Mesh,
    Volume,
}

/// A geometry payload shared by any number of instances.
///
/// The geometry itself belongs to the adapter that loads it; the
/// scheduler only needs the identity, bounds and replica locations.
#[derive(Clone, Debug)]
pub struct Payload {
    /// Unique identifier within the scene
    pub id: PayloadId,

    /// Payload name (usually the source file)
    pub name: String,

    pub kind: PayloadKind,

    /// Object-space bounding box
    pub bounds: Aabb,

    /// Ranks holding a replica. Empty means every rank.
    pub locations: Vec<usize>,
}

/// Transform components that can be composed into a matrix.
#[derive(Clone, Debug)]
pub struct Transform {
    pub translation: Vec3,

    /// Rotation (as quaternion)
    pub rotation: Quat,

    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Create a new transform with only translation.
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Default::default()
        }
    }

    /// Convert to a 4x4 transformation matrix.
    ///
    /// Order: Scale -> Rotate -> Translate (SRT)
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }
}

/// A payload placed in the world.
#[derive(Clone, Debug)]
pub struct Instance {
    pub id: InstanceId,

    pub payload_id: PayloadId,

    /// Object/world matrices handed to the adapter
    pub transform: InstanceTransform,

    /// World-space bounding box used by the router
    pub world_bounds: Aabb,
}

/// Scene lights, handed to adapters unchanged.
#[derive(Clone, Debug, PartialEq)]
pub enum Light {
    Point {
        position: Vec3,
        color: Vec3,
    },
    Ambient {
        color: Vec3,
    },
    Area {
        position: Vec3,
        normal: Vec3,
        color: Vec3,
        width: f32,
        height: f32,
    },
}

impl Light {
    pub fn color(&self) -> Vec3 {
        match self {
            Light::Point { color, .. } | Light::Ambient { color } | Light::Area { color, .. } => {
                *color
            }
        }
    }

    /// Point a shadow ray would aim at, if the light has a position.
    pub fn position(&self) -> Option<Vec3> {
        match self {
            Light::Point { position, .. } | Light::Area { position, .. } => Some(*position),
            Light::Ambient { .. } => None,
        }
    }
}

/// The scene database.
#[derive(Debug, Default)]
pub struct SceneDb {
    /// Scene name (usually from filename)
    pub name: String,

    payloads: Vec<Arc<Payload>>,

    /// Instances in declaration order
    instances: Vec<Instance>,

    lights: Vec<Light>,

    /// One record per rendered frame
    history: Mutex<Vec<FrameStats>>,
}

impl SceneDb {
    /// Create an empty scene.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a payload to the scene and return its ID.
    pub fn add_payload(&mut self, name: impl Into<String>, kind: PayloadKind, bounds: Aabb) -> PayloadId {
        let id = self.payloads.len();
        self.payloads.push(Arc::new(Payload {
            id,
            name: name.into(),
            kind,
            bounds,
            locations: Vec::new(),
        }));
        id
    }

    /// Declare which ranks hold a replica of a payload.
    pub fn set_locations(&mut self, payload: PayloadId, locations: Vec<usize>) -> SceneResult<()> {
        let slot = self
            .payloads
            .get_mut(payload)
            .ok_or(SceneError::MissingPayload(payload))?;
        Arc::make_mut(slot).locations = locations;
        Ok(())
    }

    /// Add an instance of a payload under the next free id.
    pub fn add_instance(&mut self, payload: PayloadId, transform: Transform) -> SceneResult<InstanceId> {
        let id = self.instances.iter().map(|i| i.id + 1).max().unwrap_or(0);
        self.insert_instance(id, payload, transform)?;
        Ok(id)
    }

    /// Add an instance of a payload under an explicit id.
    pub fn insert_instance(
        &mut self,
        id: InstanceId,
        payload: PayloadId,
        transform: Transform,
    ) -> SceneResult<()> {
        if self.instances.iter().any(|i| i.id == id) {
            return Err(SceneError::DuplicateInstance(id));
        }
        let bounds = self.payload(payload)?.bounds;
        let matrix = transform.to_matrix();

        self.instances.push(Instance {
            id,
            payload_id: payload,
            transform: InstanceTransform::new(matrix),
            world_bounds: matrix.transform_aabb(&bounds),
        });
        Ok(())
    }

    pub fn add_light(&mut self, light: Light) {
        self.lights.push(light);
    }

    pub fn payload(&self, id: PayloadId) -> SceneResult<&Arc<Payload>> {
        self.payloads.get(id).ok_or(SceneError::MissingPayload(id))
    }

    pub fn instance(&self, id: InstanceId) -> SceneResult<&Instance> {
        self.instances
            .iter()
            .find(|i| i.id == id)
            .ok_or(SceneError::MissingInstance(id))
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn payloads(&self) -> &[Arc<Payload>] {
        &self.payloads
    }

    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Compute the world-space bounding box of all instances.
    pub fn world_bounds(&self) -> Aabb {
        self.instances
            .iter()
            .fold(Aabb::EMPTY, |acc, i| Aabb::surrounding(&acc, &i.world_bounds))
    }

    /// Assign every instance to a rank.
    ///
    /// Instances of the same payload are dealt round-robin over the
    /// payload's replica locations, in declaration order.
    pub fn assign_owners(&self, world_size: usize) -> SceneResult<HashMap<InstanceId, usize>> {
        let mut last_assigned: HashMap<PayloadId, usize> = HashMap::new();
        let mut owners = HashMap::with_capacity(self.instances.len());

        for instance in &self.instances {
            let payload = self.payload(instance.payload_id)?;
            let count = last_assigned.entry(payload.id).or_insert(0);

            let rank = if payload.locations.is_empty() {
                *count % world_size.max(1)
            } else {
                payload.locations[*count % payload.locations.len()]
            };
            if rank >= world_size {
                return Err(SceneError::LocationOutOfRange {
                    payload: payload.id,
                    rank,
                    world_size,
                });
            }

            owners.insert(instance.id, rank);
            *count += 1;
        }

        Ok(owners)
    }

    /// Append one frame's statistics.
    pub fn record_frame(&self, stats: FrameStats) {
        self.history.lock().push(stats);
    }

    /// Statistics of every frame rendered so far.
    pub fn frame_history(&self) -> Vec<FrameStats> {
        self.history.lock().clone()
    }
}
