//! Reference adapter that treats a payload's bounding box as its geometry.
//!
//! Mesh payloads are opaque boxes shaded with a constant albedo, lit by
//! the ambient lights and by shadow rays toward every positional light.
//! Volume payloads are homogeneous media that volume rays march through.
//! A payload never shadows itself.

use dray_core::{Light, Payload, PayloadKind};
use dray_math::{Aabb, InstanceTransform, Interval, Vec3};

use super::Adapter;
use crate::ray::{flags, Ray, RayType, RayVector, VolumeState};

/// Surface colour of every box
const ALBEDO: Vec3 = Vec3::splat(0.7);

/// Extinction per unit length inside a volume
const DENSITY: f32 = 0.5;

/// Accumulated opacity at which a volume ray stops
const OPACITY_CUTOFF: f32 = 0.99;

/// Shadow rays are spawned only below this depth
const MAX_BOUNCES: u32 = 4;

pub struct BoundsAdapter {
    bounds: Aabb,
    kind: PayloadKind,
}

impl BoundsAdapter {
    /// Registry tag.
    pub const TAG: &'static str = "bounds";

    pub fn new(payload: &Payload) -> Self {
        Self {
            bounds: payload.bounds,
            kind: payload.kind,
        }
    }

    /// Terminate a primary ray on the box surface, adding the ambient
    /// term to whatever it carried in, and aim shadow rays at the lights.
    fn shade(&self, mut ray: Ray, t_hit: f32, lights: &[Light], rays_out: &mut RayVector) {
        let hit_point = ray.at(t_hit);
        let ambient = lights
            .iter()
            .filter(|light| matches!(light, Light::Ambient { .. }))
            .fold(Vec3::ZERO, |sum, light| sum + light.color());

        if ray.bounces() < MAX_BOUNCES {
            for light in lights {
                let Some(position) = light.position() else {
                    continue;
                };
                let to_light = position - hit_point;
                let distance = to_light.length();
                if distance <= 0.0 {
                    continue;
                }

                let mut shadow = Ray::new(hit_point, to_light / distance)
                    .with_id(ray.id)
                    .with_type(RayType::Shadow);
                shadow.color = ALBEDO * light.color();
                shadow.w = ray.w;
                shadow.t_max = distance;
                shadow.set_bounces(ray.bounces() + 1);
                shadow.set(flags::BOUNDARY);
                rays_out.push(shadow);
            }
        }

        ray.t = t_hit;
        ray.color += ALBEDO * ambient;
        ray.set(flags::OPAQUE);
        rays_out.push(ray);
    }

    /// March a volume ray through the medium. It either saturates inside
    /// or leaves through the far side.
    fn march(&self, mut ray: Ray, mut volume: VolumeState, span: Interval) -> Ray {
        let transparency = 1.0 - volume.opacity;
        let alpha = 1.0 - (-DENSITY * span.size()).exp();
        ray.color += ALBEDO * transparency * alpha;
        volume.opacity += transparency * alpha;
        ray.volume = Some(volume);

        if volume.opacity >= OPACITY_CUTOFF {
            ray.t = span.max;
            ray.set(flags::OPAQUE);
        } else {
            ray.origin = ray.at(span.max);
            ray.t_max -= span.max;
            ray.t = 0.0;
            ray.set(flags::BOUNDARY);
        }
        ray
    }
}

impl Adapter for BoundsAdapter {
    fn trace(
        &mut self,
        rays_in: &mut RayVector,
        rays_out: &mut RayVector,
        xform: &InstanceTransform,
        lights: &[Light],
    ) {
        rays_out.reserve(rays_in.len());

        for mut ray in rays_in.drain(..) {
            // Affine maps keep the ray parameter, so object-space distances
            // are world-space distances.
            let (origin, direction) = xform.to_object(ray.origin, ray.direction);
            let Some(span) = self.bounds.span(origin, direction, Interval::new(0.0, ray.t_max)) else {
                ray.set(flags::BOUNDARY);
                rays_out.push(ray);
                continue;
            };

            match (ray.ray_type, ray.volume) {
                (RayType::Empty, _) => {
                    ray.set(flags::BOUNDARY);
                    rays_out.push(ray);
                }
                (RayType::Shadow | RayType::Ao, _) => {
                    ray.t = span.min;
                    ray.color = Vec3::ZERO;
                    ray.set(flags::OPAQUE);
                    rays_out.push(ray);
                }
                (RayType::Primary, Some(volume)) if self.kind == PayloadKind::Volume => {
                    rays_out.push(self.march(ray, volume, span));
                }
                (RayType::Primary, _) => self.shade(ray, span.min, lights, rays_out),
            }
        }
    }
}
