//! Frame loop shared by both schedules.
//!
//! Per frame: rebuild the router and queues from the scene, route the
//! camera rays into the queues, then repeat
//!
//! 1. drain the accepted instance with the most queued rays through its
//!    adapter and re-route what comes back, until no accepted queue has work
//! 2. exchange rays queued for instances owned by other ranks
//! 3. vote on termination
//!
//! until the vote says done, then composite.

mod domain;
mod image;

pub use domain::DomainSchedule;
pub use image::ImageSchedule;

use std::ops::{Add, Range};
use std::sync::Arc;
use std::time::Instant;

use dray_core::{FrameStats, InstanceId, ScheduleKind, SceneDb};
use rayon::prelude::*;

use crate::adapter::AdapterCache;
use crate::chunk::chunk_size;
use crate::compositor::{Compositor, Framebuffer};
use crate::context::RenderContext;
use crate::error::TraceResult;
use crate::queue::{LocalQueues, QueueManager};
use crate::ray::{flags, Ray, RayType, RayVector};
use crate::router::Router;
use crate::transport;
use crate::voter::{VoteState, Voter};

/// Which instances this rank works on and where the rest go.
pub trait Schedule: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Recompute per-frame assignments. Called once per frame, before
    /// any ray is routed.
    fn reset(&mut self, scene: &SceneDb, rank: usize, world_size: usize) -> TraceResult<()>;

    /// Whether this rank may drain `instance`'s queue.
    fn accepts(&self, instance: InstanceId) -> bool;

    /// Rank that must trace `instance`, when it is not this one.
    fn remote_owner(&self, instance: InstanceId) -> Option<usize>;

    /// Whether rays ever leave this rank.
    fn uses_transport(&self) -> bool;

    /// Indices of the camera rays this rank routes.
    fn camera_slice(&self, len: usize) -> Range<usize>;

    /// Whether a routed camera ray whose first instance is `instance`
    /// stays on this rank.
    fn keeps_camera_ray(&self, instance: InstanceId) -> bool;

    /// Whether this rank accounts for camera rays that hit nothing.
    fn counts_camera_misses(&self) -> bool;
}

/// What happened to a batch of routed rays.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Disposition {
    queued: u64,
    absorbed: u64,
    dropped: u64,
}

impl Add for Disposition {
    type Output = Disposition;

    fn add(self, other: Disposition) -> Disposition {
        Disposition {
            queued: self.queued + other.queued,
            absorbed: self.absorbed + other.absorbed,
            dropped: self.dropped + other.dropped,
        }
    }
}

/// Re-route one chunk of adapter output returned from instance `src`.
fn dispose_chunk(
    router: &Router,
    queues: &QueueManager,
    compositor: &dyn Compositor,
    src: InstanceId,
    rays: &[Ray],
) -> TraceResult<Disposition> {
    let mut local = LocalQueues::new();
    let mut absorbed = RayVector::new();
    let mut counts = Disposition::default();

    for mut ray in rays.iter().copied() {
        if ray.has(flags::TIMEOUT) || ray.has(flags::OPAQUE) {
            absorbed.push(ray);
            continue;
        }
        if ray.ray_type == RayType::Empty {
            counts.dropped += 1;
            continue;
        }
        if !ray.has(flags::BOUNDARY) {
            // Not finished with its instance yet
            local.entry(src).or_default().push(ray);
            counts.queued += 1;
            continue;
        }

        ray.clear(flags::BOUNDARY);
        let hit = router.intersect(&ray, Some(src));
        match hit.next {
            Some(next) => {
                ray.advance(hit.t);
                ray.t_max -= hit.t;
                local.entry(next).or_default().push(ray);
                counts.queued += 1;
            }
            None => {
                ray.set(flags::EXTERNAL_BOUNDARY);
                let reaches_light = matches!(ray.ray_type, RayType::Shadow | RayType::Ao);
                if reaches_light || ray.volume.is_some() {
                    absorbed.push(ray);
                } else {
                    counts.dropped += 1;
                }
            }
        }
    }

    queues.flush(&mut local)?;
    counts.absorbed = absorbed.len() as u64;
    if !absorbed.is_empty() {
        compositor.add_batch(&absorbed);
    }
    Ok(counts)
}

/// Route one chunk of camera rays into this rank's queues.
fn filter_chunk<S: Schedule>(
    router: &Router,
    queues: &QueueManager,
    schedule: &S,
    rays: &[Ray],
) -> TraceResult<Disposition> {
    let mut local = LocalQueues::new();
    let mut counts = Disposition::default();

    for (&ray, hit) in rays.iter().zip(router.route_chunk(rays, None)) {
        match hit.next {
            Some(first) if schedule.keeps_camera_ray(first) => {
                let mut ray = ray;
                ray.advance(hit.t);
                ray.t_max -= hit.t;
                local.entry(first).or_default().push(ray);
                counts.queued += 1;
            }
            Some(_) => {}
            None if schedule.counts_camera_misses() => counts.dropped += 1,
            None => {}
        }
    }

    queues.flush(&mut local)?;
    Ok(counts)
}

/// Scheduler for one rank.
pub struct Tracer<'ctx, S: Schedule> {
    ctx: &'ctx RenderContext,
    schedule: S,
    router: Router,
    queues: QueueManager,
    adapters: AdapterCache,
    compositor: Arc<dyn Compositor>,
    voter: Voter,
    stats: FrameStats,
}

impl<'ctx, S: Schedule> Tracer<'ctx, S> {
    /// Create a tracer. Fails if the configured adapter kind is unknown
    /// or the scene does not fit the world.
    pub fn new(ctx: &'ctx RenderContext, schedule: S, compositor: Arc<dyn Compositor>) -> TraceResult<Self> {
        let adapters = ctx.adapter_cache()?;
        let mut tracer = Self {
            ctx,
            schedule,
            router: Router::from_bounds(Vec::new()),
            queues: QueueManager::new(std::iter::empty(), ctx.config.queue_reserve),
            adapters,
            compositor,
            voter: Voter::new(),
            stats: FrameStats::new(ctx.rank()),
        };
        tracer.reset_instances()?;
        Ok(tracer)
    }

    /// Rebuild the router, the queue arena and the schedule's assignments
    /// from the scene database.
    pub fn reset_instances(&mut self) -> TraceResult<()> {
        let ctx = self.ctx;
        let scene = &*ctx.scene;
        self.router = Router::new(scene.instances());
        self.queues.reset(scene.instances().iter().map(|i| i.id));
        self.schedule.reset(scene, ctx.rank(), ctx.world_size())?;
        Ok(())
    }

    pub fn schedule(&self) -> &S {
        &self.schedule
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    /// Counters of the current (or last) frame.
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    /// Route camera rays to their first instance, keeping the ones this
    /// rank is responsible for. Rays that hit nothing are dropped.
    pub fn filter_camera_rays(&mut self, camera_rays: &[Ray]) -> TraceResult<()> {
        let start = Instant::now();
        let slice = self.schedule.camera_slice(camera_rays.len());
        let rays = &camera_rays[slice];
        let chunk = chunk_size(rays.len(), self.ctx.threads());

        let (router, queues, schedule) = (&self.router, &self.queues, &self.schedule);
        let counts = self.ctx.install(|| {
            rays.par_chunks(chunk)
                .map(|c| filter_chunk(router, queues, schedule, c))
                .try_reduce(Disposition::default, |a, b| Ok(a + b))
        })?;

        self.stats.rays_filtered += counts.queued;
        self.stats.rays_dropped += counts.dropped;
        self.stats.timings.filter += start.elapsed();

        log::debug!(
            "[rank {}] {} filter: kept {} of {} camera rays, dropped {}",
            self.ctx.rank(),
            self.schedule.name(),
            counts.queued,
            rays.len(),
            counts.dropped
        );
        Ok(())
    }

    /// Dispose of rays an adapter returned from instance `src`: absorb
    /// terminated rays, re-route the ones that crossed the instance
    /// boundary and requeue the rest into `src`.
    pub fn process_rays(&mut self, src: InstanceId, rays: RayVector) -> TraceResult<()> {
        if rays.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        let chunk = chunk_size(rays.len(), self.ctx.threads());

        let (router, queues) = (&self.router, &self.queues);
        let compositor = self.compositor.as_ref();
        let counts = self.ctx.install(|| {
            rays.par_chunks(chunk)
                .map(|c| dispose_chunk(router, queues, compositor, src, c))
                .try_reduce(Disposition::default, |a, b| Ok(a + b))
        })?;

        self.stats.rays_shuffled += counts.queued;
        self.stats.rays_absorbed += counts.absorbed;
        self.stats.rays_dropped += counts.dropped;
        self.stats.timings.shuffle += start.elapsed();
        Ok(())
    }

    /// Drain one instance's queue through its adapter and re-route the result.
    fn trace_instance(&mut self, instance: InstanceId) -> TraceResult<()> {
        let ctx = self.ctx;
        let scene = &*ctx.scene;

        let mut rays = self.queues.drain(instance)?;
        let traced = rays.len();
        let placed = scene.instance(instance)?;

        let start = Instant::now();
        let adapter = self.adapters.get(scene.payload(placed.payload_id)?)?;
        self.stats.timings.adapter += start.elapsed();

        let start = Instant::now();
        let mut moved = RayVector::with_capacity(traced);
        ctx.install(|| {
            adapter
                .lock()
                .trace(&mut rays, &mut moved, &placed.transform, scene.lights())
        });
        self.stats.timings.trace += start.elapsed();

        self.stats.rays_traced += traced as u64;
        self.stats.rays_spawned += moved.len().saturating_sub(traced) as u64;
        self.process_rays(instance, moved)
    }

    /// Trace until no accepted queue has work.
    fn drain_local(&mut self) -> TraceResult<()> {
        loop {
            let start = Instant::now();
            let schedule = &self.schedule;
            let next = self.queues.largest(|id| schedule.accepts(id));
            self.stats.timings.select += start.elapsed();

            let Some((instance, pending)) = next else {
                return Ok(());
            };
            log::debug!(
                "[rank {}] {}: tracing instance {} ({} rays)",
                self.ctx.rank(),
                self.schedule.name(),
                instance,
                pending
            );
            self.trace_instance(instance)?;
        }
    }

    /// Render one frame and return the composited image.
    pub fn trace(&mut self, camera_rays: &[Ray]) -> TraceResult<Framebuffer> {
        let frame_start = Instant::now();
        let ctx = self.ctx;
        let comm = &*ctx.comm;

        self.stats = FrameStats::new(self.ctx.rank());
        self.reset_instances()?;
        self.queues.clear();
        self.voter.reset();
        self.compositor.reset();

        self.filter_camera_rays(camera_rays)?;

        loop {
            self.stats.rounds += 1;
            self.drain_local()?;

            if self.schedule.uses_transport() {
                let start = Instant::now();
                let schedule = &self.schedule;
                let exchanged = transport::exchange(comm, &self.queues, |id| schedule.remote_owner(id))?;
                self.stats.rays_sent += exchanged.rays_sent;
                self.stats.bytes_sent += exchanged.bytes_sent;
                self.stats.rays_received += exchanged.rays_received;
                self.stats.timings.send += start.elapsed();
            }

            let start = Instant::now();
            let state = self.voter.vote(comm, self.queues.pending())?;
            self.stats.timings.vote += start.elapsed();
            if state == VoteState::Done {
                break;
            }
        }

        let start = Instant::now();
        let frame = self.compositor.composite(comm)?;
        self.stats.timings.gather += start.elapsed();
        self.stats.timings.frame = frame_start.elapsed();

        self.stats.log_summary(self.schedule.name());
        ctx.scene.record_frame(self.stats.clone());
        Ok(frame)
    }
}

/// Render one frame with the configured schedule.
pub fn render_frame(
    ctx: &RenderContext,
    camera_rays: &[Ray],
    compositor: Arc<dyn Compositor>,
) -> TraceResult<Framebuffer> {
    match ctx.config.schedule {
        ScheduleKind::Image => Tracer::new(ctx, ImageSchedule::new(), compositor)?.trace(camera_rays),
        ScheduleKind::Domain => Tracer::new(ctx, DomainSchedule::new(), compositor)?.trace(camera_rays),
    }
}
