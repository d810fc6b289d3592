//! Everything a frame needs, passed explicitly into the scheduler.

use std::sync::Arc;

use dray_core::{RenderConfig, SceneDb};

use crate::adapter::{AdapterCache, AdapterRegistry};
use crate::comm::{Communicator, SingleProcess};
use crate::error::{TraceError, TraceResult};

/// Render context for one rank.
///
/// Lives as long as the process renders; frames borrow it.
pub struct RenderContext {
    pub scene: Arc<SceneDb>,
    pub config: RenderConfig,
    pub comm: Arc<dyn Communicator>,
    pub registry: Arc<AdapterRegistry>,
    pool: rayon::ThreadPool,
}

impl RenderContext {
    /// Build a context, with a worker pool sized from `config.threads`.
    pub fn new(scene: Arc<SceneDb>, config: RenderConfig, comm: Arc<dyn Communicator>) -> TraceResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(move |i| format!("dray-worker-{}", i))
            .build()?;

        log::info!(
            "RenderContext: scene '{}', rank {}/{}, {:?} schedule, adapter '{}', {} workers",
            scene.name,
            comm.rank(),
            comm.size(),
            config.schedule,
            config.adapter,
            pool.current_num_threads()
        );

        Ok(Self {
            scene,
            config,
            comm,
            registry: Arc::new(AdapterRegistry::with_defaults()),
            pool,
        })
    }

    /// Context for a single-process render.
    pub fn single(scene: Arc<SceneDb>, config: RenderConfig) -> TraceResult<Self> {
        Self::new(scene, config, Arc::new(SingleProcess))
    }

    /// Replace the adapter registry.
    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn world_size(&self) -> usize {
        self.comm.size()
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `op` on the worker pool.
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }

    /// Adapter cache for the configured adapter kind. Fails on an
    /// unregistered tag.
    pub fn adapter_cache(&self) -> TraceResult<AdapterCache> {
        AdapterCache::new(Arc::clone(&self.registry), self.config.adapter.clone()).map_err(|e| {
            if let TraceError::UnknownAdapter(tag) = &e {
                log::warn!(
                    "adapter '{}' is not registered (available: {:?})",
                    tag,
                    self.registry.tags()
                );
            }
            e
        })
    }
}
