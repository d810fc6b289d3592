//! Dray Core - scene database and configuration for the distributed ray scheduler.
//!
//! This crate provides:
//!
//! - **Scene database**: `SceneDb` with geometry `Payload`s, placed `Instance`s,
//!   `Light`s and the replica locations that decide which rank owns an instance
//! - **Configuration**: `RenderConfig`, loaded from JSON
//! - **Statistics**: `FrameStats`, recorded into the scene database once per frame
//!
//! # Example
//!
//! ```ignore
//! use dray_core::{PayloadKind, RenderConfig, SceneDb, Transform};
//!
//! let config = RenderConfig::load("render.json")?;
//! let mut scene = SceneDb::new("bunnies");
//! let bunny = scene.add_payload("bunny", PayloadKind::Mesh, bounds);
//! scene.set_locations(bunny, vec![0, 1])?;
//! scene.add_instance(bunny, Transform::from_translation(Vec3::X))?;
//! ```

pub mod config;
pub mod scene;
pub mod stats;

// Re-export commonly used types
pub use config::{ConfigError, ConfigResult, RenderConfig, ScheduleKind};
pub use scene::{
    Instance, InstanceId, Light, Payload, PayloadId, PayloadKind, SceneDb, SceneError,
    SceneResult, Transform,
};
pub use stats::{FrameStats, PhaseTimings};
