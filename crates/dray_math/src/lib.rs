// Re-export glam for convenience
pub use glam::*;

// Routing math types
mod aabb;
mod interval;
mod transform;

pub use aabb::Aabb;
pub use interval::Interval;
pub use transform::{InstanceTransform, Mat4Ext};
