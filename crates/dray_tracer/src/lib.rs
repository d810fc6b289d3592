//! Dray Tracer - distributed ray scheduling.
//!
//! Decides, round by round, which instance's rays get intersected next,
//! hands batches to a pluggable geometry adapter, routes the rays that
//! come back to their next instance (possibly on another rank) and
//! detects when every rank has run out of work.
//!
//! Two schedules drive the same frame loop:
//!
//! - **Image**: every rank takes a slice of the camera rays and may
//!   trace any instance.
//! - **Domain**: every instance is pinned to one rank; rays travel to
//!   the owner of the instance they enter.
//!
//! # Example
//!
//! ```ignore
//! use dray_tracer::{render_frame, ImageComposite, RenderContext};
//!
//! let ctx = RenderContext::single(scene, config)?;
//! let compositor = Arc::new(ImageComposite::new(config.width, config.height));
//! let frame = render_frame(&ctx, &camera_rays, compositor)?;
//! let rgba = frame.to_rgba();
//! ```

mod adapter;
mod chunk;
mod comm;
mod compositor;
mod context;
mod error;
mod queue;
mod ray;
mod router;
mod tracer;
mod transport;
mod voter;

pub use adapter::{Adapter, AdapterCache, AdapterFactory, AdapterRegistry, BoundsAdapter, SharedAdapter};
pub use chunk::{chunk_size, rank_slice, SIMD_WIDTH};
pub use comm::{ChannelComm, CommError, CommResult, Communicator, ReduceOp, SingleProcess, Tag};
pub use compositor::{color_to_rgba, linear_to_gamma, Compositor, Framebuffer, ImageComposite};
pub use context::RenderContext;
pub use error::{TraceError, TraceResult};
pub use queue::{LocalQueues, QueueManager};
pub use ray::{
    flags, PackError, PackResult, Ray, RayType, RayVector, VolumeState, SURFACE_PACKED_SIZE,
    VOLUME_PACKED_SIZE,
};
pub use router::{Hit, Router, ROUTE_EPSILON};
pub use tracer::{render_frame, DomainSchedule, ImageSchedule, Schedule, Tracer};
pub use transport::{exchange, Exchanged, TransportError, BATCH_HEADER_SIZE};
pub use voter::{VoteState, Voter};

/// Re-export math and scene types used in this crate's API
pub use dray_core::{InstanceId, Light, PayloadId, RenderConfig, SceneDb};
pub use dray_math::{InstanceTransform, Vec3};
