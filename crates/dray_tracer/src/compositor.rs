//! Per-pixel accumulation and the cross-rank image reduction.

use glam::{Vec3, Vec4};
use parking_lot::Mutex;

use crate::comm::{Communicator, ReduceOp};
use crate::error::TraceResult;
use crate::ray::Ray;

/// Receives the colour of every absorbed ray and produces the frame.
///
/// `local_add` may be called from many worker threads at once.
/// `composite` is called exactly once per frame, after termination, on
/// every rank.
pub trait Compositor: Send + Sync {
    /// Forget everything accumulated for the previous frame.
    fn reset(&self);

    /// Accumulate one contribution into pixel `pixel`.
    fn local_add(&self, pixel: i32, color: Vec3, weight: f32, depth: f32);

    /// Absorb a batch of terminated rays.
    fn add_batch(&self, rays: &[Ray]) {
        for ray in rays {
            self.local_add(ray.id, ray.color * ray.w, 1.0, ray.t);
        }
    }

    /// Reduce across ranks and return the final frame.
    fn composite(&self, comm: &dyn Communicator) -> TraceResult<Framebuffer>;
}

/// Apply gamma 2 correction.
#[inline]
pub fn linear_to_gamma(linear: f32) -> f32 {
    if linear > 0.0 {
        linear.sqrt()
    } else {
        0.0
    }
}

/// Convert a color to 8-bit RGBA.
pub fn color_to_rgba(color: Vec3) -> [u8; 4] {
    let r = (255.0 * linear_to_gamma(color.x).clamp(0.0, 1.0)) as u8;
    let g = (255.0 * linear_to_gamma(color.y).clamp(0.0, 1.0)) as u8;
    let b = (255.0 * linear_to_gamma(color.z).clamp(0.0, 1.0)) as u8;
    [r, g, b, 255]
}

/// Accumulated frame: colour sum in `xyz`, weight sum in `w`, plus the
/// nearest depth seen per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Framebuffer {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Vec4>,
    pub depth: Vec<f32>,
}

impl Framebuffer {
    /// Create an empty framebuffer.
    pub fn new(width: u32, height: u32) -> Self {
        let len = Self::pixel_count(width, height);
        Self {
            width,
            height,
            pixels: vec![Vec4::ZERO; len],
            depth: vec![f32::INFINITY; len],
        }
    }

    fn pixel_count(width: u32, height: u32) -> usize {
        width as usize * height as usize
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Slot for a ray id, if it names a pixel of this frame.
    pub fn slot(&self, pixel: i32) -> Option<usize> {
        usize::try_from(pixel).ok().filter(|&p| p < self.pixels.len())
    }

    /// Accumulate one contribution. Out-of-frame ids are ignored.
    pub fn add(&mut self, pixel: i32, color: Vec3, weight: f32, depth: f32) -> bool {
        let Some(slot) = self.slot(pixel) else {
            return false;
        };
        self.pixels[slot] += color.extend(weight);
        self.depth[slot] = self.depth[slot].min(depth);
        true
    }

    /// Accumulated colour at (x, y).
    pub fn get(&self, x: u32, y: u32) -> Vec3 {
        self.pixels[self.index(x, y)].truncate()
    }

    /// Accumulated weight at (x, y).
    pub fn weight(&self, x: u32, y: u32) -> f32 {
        self.pixels[self.index(x, y)].w
    }

    /// Nearest depth at (x, y); infinite where nothing landed.
    pub fn depth_at(&self, x: u32, y: u32) -> f32 {
        self.depth[self.index(x, y)]
    }

    /// Convert to RGBA bytes (for display or saving).
    pub fn to_rgba(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len() * 4);
        for y in 0..self.height {
            for x in 0..self.width {
                bytes.extend_from_slice(&color_to_rgba(self.get(x, y)));
            }
        }
        bytes
    }

    fn clear(&mut self) {
        self.pixels.fill(Vec4::ZERO);
        self.depth.fill(f32::INFINITY);
    }

    /// Sum colour and weight, keep the nearest depth, over every rank.
    fn reduce(&mut self, comm: &dyn Communicator) -> TraceResult<()> {
        if comm.size() < 2 {
            return Ok(());
        }

        let mut flat: Vec<f32> = self.pixels.iter().flat_map(|p| p.to_array()).collect();
        comm.all_reduce_f32(&mut flat, ReduceOp::Sum)?;
        for (pixel, v) in self.pixels.iter_mut().zip(flat.chunks_exact(4)) {
            *pixel = Vec4::from_slice(v);
        }

        comm.all_reduce_f32(&mut self.depth, ReduceOp::Min)?;
        Ok(())
    }
}

/// In-memory compositor over a fixed-size image.
pub struct ImageComposite {
    accum: Mutex<Framebuffer>,
}

impl ImageComposite {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            accum: Mutex::new(Framebuffer::new(width, height)),
        }
    }

    /// Copy of the local accumulation, before any reduction.
    pub fn snapshot(&self) -> Framebuffer {
        self.accum.lock().clone()
    }
}

impl Compositor for ImageComposite {
    fn reset(&self) {
        self.accum.lock().clear();
    }

    fn local_add(&self, pixel: i32, color: Vec3, weight: f32, depth: f32) {
        if !self.accum.lock().add(pixel, color, weight, depth) {
            log::warn!("dropping contribution for pixel {} outside the frame", pixel);
        }
    }

    fn add_batch(&self, rays: &[Ray]) {
        let mut accum = self.accum.lock();
        for ray in rays {
            if !accum.add(ray.id, ray.color * ray.w, 1.0, ray.t) {
                log::warn!("dropping contribution for pixel {} outside the frame", ray.id);
            }
        }
    }

    fn composite(&self, comm: &dyn Communicator) -> TraceResult<Framebuffer> {
        let mut frame = self.snapshot();
        frame.reduce(comm)?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ChannelComm, SingleProcess};
    use std::thread;

    #[test]
    fn test_linear_to_gamma() {
        assert_eq!(linear_to_gamma(0.0), 0.0);
        assert_eq!(linear_to_gamma(-1.0), 0.0);
        assert!((linear_to_gamma(0.25) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_color_to_rgba() {
        assert_eq!(color_to_rgba(Vec3::ZERO), [0, 0, 0, 255]);
        assert_eq!(color_to_rgba(Vec3::ONE), [255, 255, 255, 255]);
        assert_eq!(color_to_rgba(Vec3::splat(4.0)), [255, 255, 255, 255]);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_pixel_count_does_not_wrap() {
        assert_eq!(Framebuffer::pixel_count(70_000, 70_000), 4_900_000_000);
        assert_eq!(Framebuffer::pixel_count(3, 2), 6);
    }

    #[test]
    fn test_accumulates_contributions() {
        let compositor = ImageComposite::new(2, 2);
        compositor.local_add(3, Vec3::new(1.0, 0.0, 0.0), 1.0, 5.0);
        compositor.local_add(3, Vec3::new(0.0, 1.0, 0.0), 1.0, 2.0);

        let frame = compositor.composite(&SingleProcess).unwrap();
        assert_eq!(frame.get(1, 1), Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(frame.weight(1, 1), 2.0);
        assert_eq!(frame.depth_at(1, 1), 2.0);
        assert_eq!(frame.get(0, 0), Vec3::ZERO);
        assert_eq!(frame.depth_at(0, 0), f32::INFINITY);
    }

    #[test]
    fn test_out_of_frame_ids_are_ignored() {
        let compositor = ImageComposite::new(2, 1);
        compositor.local_add(-1, Vec3::ONE, 1.0, 1.0);
        compositor.local_add(2, Vec3::ONE, 1.0, 1.0);
        assert_eq!(compositor.snapshot(), Framebuffer::new(2, 1));
    }

    #[test]
    fn test_add_batch_uses_ray_weight() {
        let compositor = ImageComposite::new(1, 1);
        let mut ray = Ray::new(Vec3::ZERO, Vec3::Z).with_id(0);
        ray.color = Vec3::ONE;
        ray.w = 0.5;
        ray.t = 3.0;
        compositor.add_batch(&[ray]);

        let frame = compositor.snapshot();
        assert_eq!(frame.pixels[0], Vec4::new(0.5, 0.5, 0.5, 1.0));
        assert_eq!(frame.depth[0], 3.0);

        compositor.reset();
        assert_eq!(compositor.snapshot(), Framebuffer::new(1, 1));
    }

    #[test]
    fn test_composite_reduces_across_ranks() {
        let world = ChannelComm::world(2);

        let frames: Vec<Framebuffer> = thread::scope(|s| {
            let handles: Vec<_> = world
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let compositor = ImageComposite::new(2, 1);
                        // Each rank lights its own pixel, both touch pixel 0
                        compositor.local_add(comm.rank() as i32, Vec3::ONE, 1.0, 1.0 + comm.rank() as f32);
                        compositor.local_add(0, Vec3::X, 1.0, 10.0);
                        compositor.composite(comm).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(frames[0], frames[1]);
        let frame = &frames[0];
        // Pixel 0: ONE + X (rank 0) + X (rank 1), weight 3
        assert_eq!(frame.pixels[0], Vec4::new(3.0, 1.0, 1.0, 3.0));
        assert_eq!(frame.depth[0], 1.0);
        assert_eq!(frame.pixels[1], Vec4::new(1.0, 1.0, 1.0, 1.0));
        assert_eq!(frame.depth[1], 2.0);
    }
}
