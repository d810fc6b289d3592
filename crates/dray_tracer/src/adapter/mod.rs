//! Geometry back-ends.
//!
//! An [`Adapter`] intersects batches of rays with one payload. Back-ends
//! are registered by tag in an [`AdapterRegistry`]; the configured tag
//! selects one at frame start. An [`AdapterCache`] builds at most one
//! adapter per payload per rank and hands out the same one afterwards.

mod bounds;

pub use bounds::BoundsAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use dray_core::{Light, Payload, PayloadId};
use dray_math::InstanceTransform;
use parking_lot::Mutex;

use crate::error::{TraceError, TraceResult};
use crate::ray::RayVector;

/// Intersects rays with one geometry payload.
pub trait Adapter: Send {
    /// Trace a batch through one instance of the payload.
    ///
    /// Consumes `rays_in` (left empty on return) and appends to `rays_out`
    /// every ray that terminated or left the instance, plus any rays it
    /// spawned. Ray ids are never changed.
    fn trace(
        &mut self,
        rays_in: &mut RayVector,
        rays_out: &mut RayVector,
        xform: &InstanceTransform,
        lights: &[Light],
    );
}

/// Builds an adapter for a payload.
pub type AdapterFactory = Box<dyn Fn(&Arc<Payload>) -> TraceResult<Box<dyn Adapter>> + Send + Sync>;

/// Adapter kinds compiled into this binary, by configuration tag.
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry holding the in-tree adapters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BoundsAdapter::TAG, |payload| {
            Ok(Box::new(BoundsAdapter::new(payload)) as Box<dyn Adapter>)
        });
        registry
    }

    /// Register a factory, replacing any previous one under `tag`.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&Arc<Payload>) -> TraceResult<Box<dyn Adapter>> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Box::new(factory));
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Build an adapter of kind `tag` for `payload`.
    pub fn build(&self, tag: &str, payload: &Arc<Payload>) -> TraceResult<Box<dyn Adapter>> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| TraceError::UnknownAdapter(tag.to_string()))?;
        factory(payload)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A cached adapter. Locked for the duration of one `trace` call.
pub type SharedAdapter = Arc<Mutex<Box<dyn Adapter>>>;

/// One adapter per payload, built on first use.
pub struct AdapterCache {
    registry: Arc<AdapterRegistry>,
    tag: String,
    adapters: Mutex<HashMap<PayloadId, SharedAdapter>>,
}

impl AdapterCache {
    /// Create a cache for adapters of kind `tag`.
    ///
    /// Fails immediately if no such kind is registered.
    pub fn new(registry: Arc<AdapterRegistry>, tag: impl Into<String>) -> TraceResult<Self> {
        let tag = tag.into();
        if !registry.contains(&tag) {
            return Err(TraceError::UnknownAdapter(tag));
        }
        Ok(Self {
            registry,
            tag,
            adapters: Mutex::new(HashMap::new()),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Adapter for `payload`, building it if this is the first request.
    pub fn get(&self, payload: &Arc<Payload>) -> TraceResult<SharedAdapter> {
        let mut adapters = self.adapters.lock();
        if let Some(adapter) = adapters.get(&payload.id) {
            return Ok(Arc::clone(adapter));
        }

        log::debug!("building '{}' adapter for payload {} ({})", self.tag, payload.id, payload.name);
        let adapter = Arc::new(Mutex::new(self.registry.build(&self.tag, payload)?));
        adapters.insert(payload.id, Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Number of adapters built so far.
    pub fn len(&self) -> usize {
        self.adapters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every adapter.
    pub fn clear(&self) {
        self.adapters.lock().clear();
    }
}
