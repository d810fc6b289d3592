use crate::{Interval, Vec3};

/// Axis-Aligned Bounding Box used by the instance router.
///
/// An AABB is defined by three intervals (one per axis) that bound a 3D volume.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Aabb {
    pub x: Interval,
    pub y: Interval,
    pub z: Interval,
}

impl Aabb {
    /// Create a new AABB from three intervals.
    pub fn new(x: Interval, y: Interval, z: Interval) -> Self {
        let mut aabb = Self { x, y, z };
        aabb.pad_to_minimums();
        aabb
    }

    /// Create an AABB from two corner points.
    pub fn from_points(a: Vec3, b: Vec3) -> Self {
        Self::new(
            Interval::new(a.x.min(b.x), a.x.max(b.x)),
            Interval::new(a.y.min(b.y), a.y.max(b.y)),
            Interval::new(a.z.min(b.z), a.z.max(b.z)),
        )
    }

    /// Create an AABB that surrounds two other AABBs.
    pub fn surrounding(box0: &Aabb, box1: &Aabb) -> Self {
        Self {
            x: Interval::surrounding(&box0.x, &box1.x),
            y: Interval::surrounding(&box0.y, &box1.y),
            z: Interval::surrounding(&box0.z, &box1.z),
        }
    }

    /// Get the interval for a specific axis (0=X, 1=Y, 2=Z).
    pub fn axis_interval(&self, n: usize) -> Interval {
        match n {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    pub fn min(&self) -> Vec3 {
        Vec3::new(self.x.min, self.y.min, self.z.min)
    }

    pub fn max(&self) -> Vec3 {
        Vec3::new(self.x.max, self.y.max, self.z.max)
    }

    /// Returns true if the box contains no points.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty() || self.y.is_empty() || self.z.is_empty()
    }

    /// Part of `ray_t` the ray spends inside this box.
    ///
    /// Slab method. Returns `None` when the ray misses the box inside `ray_t`.
    pub fn span(&self, origin: Vec3, direction: Vec3, ray_t: Interval) -> Option<Interval> {
        let mut t_near = ray_t.min;
        let mut t_far = ray_t.max;

        for axis in 0..3 {
            let slab = self.axis_interval(axis);
            let adinv = 1.0 / direction[axis];
            let mut t0 = (slab.min - origin[axis]) * adinv;
            let mut t1 = (slab.max - origin[axis]) * adinv;
            if adinv < 0.0 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_near = t0.max(t_near);
            t_far = t1.min(t_far);
            if t_far <= t_near {
                return None;
            }
        }

        Some(Interval::new(t_near, t_far))
    }

    /// Distance along the ray at which it enters this box, clipped to `ray_t`.
    /// A ray starting inside the box enters at `ray_t.min`.
    pub fn entry(&self, origin: Vec3, direction: Vec3, ray_t: Interval) -> Option<f32> {
        self.span(origin, direction, ray_t).map(|span| span.min)
    }

    /// Test if a ray intersects this AABB within the given interval.
    pub fn hit(&self, origin: Vec3, direction: Vec3, ray_t: Interval) -> bool {
        self.entry(origin, direction, ray_t).is_some()
    }

    /// Pad intervals to avoid zero-width AABBs (degenerate cases).
    fn pad_to_minimums(&mut self) {
        let delta = 0.0001;
        if self.x.size() < delta {
            self.x = self.x.expand(delta);
        }
        if self.y.size() < delta {
            self.y = self.y.expand(delta);
        }
        if self.z.size() < delta {
            self.z = self.z.expand(delta);
        }
    }

    /// Returns the index (0=X, 1=Y, 2=Z) of the axis with the longest extent.
    pub fn longest_axis(&self) -> usize {
        let x_size = self.x.size();
        let y_size = self.y.size();
        let z_size = self.z.size();

        if x_size > y_size && x_size > z_size {
            0
        } else if y_size > z_size {
            1
        } else {
            2
        }
    }

    /// Returns the center point of the bounding box.
    pub fn centroid(&self) -> Vec3 {
        (self.min() + self.max()) * 0.5
    }

    pub const EMPTY: Aabb = Aabb {
        x: Interval::EMPTY,
        y: Interval::EMPTY,
        z: Interval::EMPTY,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box() -> Aabb {
        Aabb::from_points(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0))
    }

    #[test]
    fn test_aabb_surrounding() {
        let box1 = Aabb::from_points(Vec3::ZERO, Vec3::splat(5.0));
        let box2 = Aabb::from_points(Vec3::splat(3.0), Vec3::splat(10.0));
        let surrounding = Aabb::surrounding(&box1, &box2);

        assert_eq!(surrounding.min(), Vec3::ZERO);
        assert_eq!(surrounding.max(), Vec3::splat(10.0));
    }

    #[test]
    fn test_aabb_entry_distance() {
        let aabb = unit_box();
        let t = aabb.entry(
            Vec3::new(0.0, 0.0, -5.0),
            Vec3::Z,
            Interval::new(0.0, f32::INFINITY),
        );
        assert_eq!(t, Some(4.0));
    }

    #[test]
    fn test_aabb_entry_from_inside() {
        let aabb = unit_box();
        let t = aabb.entry(Vec3::ZERO, Vec3::X, Interval::new(0.01, f32::INFINITY));
        assert_eq!(t, Some(0.01));
    }

    #[test]
    fn test_aabb_span_exit() {
        let aabb = unit_box();
        let span = aabb
            .span(Vec3::new(-5.0, 0.0, 0.0), Vec3::X, Interval::new(0.0, f32::INFINITY))
            .unwrap();
        assert_eq!((span.min, span.max), (4.0, 6.0));

        // Clipped by the ray's own extent
        let span = aabb
            .span(Vec3::new(-5.0, 0.0, 0.0), Vec3::X, Interval::new(0.0, 5.0))
            .unwrap();
        assert_eq!(span.max, 5.0);
    }

    #[test]
    fn test_aabb_miss() {
        let aabb = unit_box();

        // Pointing away
        assert!(!aabb.hit(
            Vec3::new(0.0, 0.0, -5.0),
            -Vec3::Z,
            Interval::new(0.0, 100.0)
        ));

        // Parallel and outside
        assert!(!aabb.hit(
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::Z,
            Interval::new(0.0, 100.0)
        ));

        // Box beyond t_max
        assert!(!aabb.hit(
            Vec3::new(0.0, 0.0, -5.0),
            Vec3::Z,
            Interval::new(0.0, 3.0)
        ));
    }

    #[test]
    fn test_aabb_degenerate_is_padded() {
        let flat = Aabb::from_points(Vec3::ZERO, Vec3::new(1.0, 1.0, 0.0));
        assert!(flat.z.size() > 0.0);
        assert!(flat.hit(
            Vec3::new(0.5, 0.5, -1.0),
            Vec3::Z,
            Interval::new(0.0, 10.0)
        ));
    }

    #[test]
    fn test_aabb_longest_axis() {
        assert_eq!(Aabb::from_points(Vec3::ZERO, Vec3::new(10.0, 1.0, 1.0)).longest_axis(), 0);
        assert_eq!(Aabb::from_points(Vec3::ZERO, Vec3::new(1.0, 10.0, 1.0)).longest_axis(), 1);
        assert_eq!(Aabb::from_points(Vec3::ZERO, Vec3::new(1.0, 1.0, 10.0)).longest_axis(), 2);
    }

    #[test]
    fn test_aabb_empty() {
        assert!(Aabb::EMPTY.is_empty());
        assert!(!unit_box().is_empty());
    }
}
