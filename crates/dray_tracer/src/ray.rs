//! Ray records and their wire layout.
//!
//! A ray keeps its `id` for its whole life; it is the only key the
//! compositor uses to attribute colour.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dray_math::Vec3;
use thiserror::Error;

/// Status flags stored above the recursion depth in `Ray::depth`.
pub mod flags {
    /// The ray left the domain it was traced in and must be re-routed.
    pub const BOUNDARY: u32 = 1 << 28;
    /// The ray's colour is final.
    pub const OPAQUE: u32 = 1 << 29;
    /// The ray left the whole scene.
    pub const EXTERNAL_BOUNDARY: u32 = 1 << 30;
    /// The adapter gave up on the ray (e.g. AO sample budget exceeded).
    pub const TIMEOUT: u32 = 1 << 31;

    /// Bits holding the recursion depth.
    pub const DEPTH_MASK: u32 = BOUNDARY - 1;
}

/// Errors raised while decoding packed rays.
#[derive(Error, Debug)]
pub enum PackError {
    #[error("packed ray truncated: {0}")]
    Truncated(#[from] io::Error),

    #[error("unknown ray layout tag {0}")]
    UnknownLayout(u8),

    #[error("unknown ray type {0}")]
    UnknownRayType(u32),
}

/// Result type for ray decoding.
pub type PackResult<T> = Result<T, PackError>;

/// What a ray is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RayType {
    Primary = 0,
    Shadow = 1,
    Ao = 2,
    Empty = 3,
}

impl RayType {
    fn from_u32(value: u32) -> PackResult<Self> {
        match value {
            0 => Ok(RayType::Primary),
            1 => Ok(RayType::Shadow),
            2 => Ok(RayType::Ao),
            3 => Ok(RayType::Empty),
            other => Err(PackError::UnknownRayType(other)),
        }
    }
}

/// Extra state carried by rays marching through a volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeState {
    /// Accumulated opacity
    pub opacity: f32,
    /// Sample kind chosen by the volume adapter
    pub sample_type: u32,
}

const LAYOUT_SURFACE: u8 = 0;
const LAYOUT_VOLUME: u8 = 1;

/// Bytes written for a surface ray: layout tag, 12 floats, id, type, depth.
pub const SURFACE_PACKED_SIZE: usize = 1 + 12 * 4 + 4 + 4 + 4;

/// Bytes written for a volume ray: surface layout plus opacity and sample type.
pub const VOLUME_PACKED_SIZE: usize = SURFACE_PACKED_SIZE + 4 + 4;

/// A ray in flight through the scheduler.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    /// Accumulated colour
    pub color: Vec3,
    /// Weight / opacity of the colour contribution
    pub w: f32,
    /// Parametric position along the ray
    pub t: f32,
    pub t_max: f32,
    /// Pixel/sample identity
    pub id: i32,
    pub ray_type: RayType,
    /// Recursion depth in the low bits, `flags` in the high bits
    pub depth: u32,
    pub volume: Option<VolumeState>,
}

/// Rays are moved around in plain vectors.
pub type RayVector = Vec<Ray>;

impl Ray {
    /// Create a new primary ray.
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            color: Vec3::ZERO,
            w: 1.0,
            t: 0.0,
            t_max: f32::MAX,
            id: 0,
            ray_type: RayType::Primary,
            depth: 0,
            volume: None,
        }
    }

    pub fn with_id(mut self, id: i32) -> Self {
        self.id = id;
        self
    }

    pub fn with_type(mut self, ray_type: RayType) -> Self {
        self.ray_type = ray_type;
        self
    }

    pub fn with_volume(mut self, volume: VolumeState) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Get the point along the ray at parameter t.
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.depth & flag != 0
    }

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.depth |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u32) {
        self.depth &= !flag;
    }

    /// Recursion depth without the status flags.
    pub fn bounces(&self) -> u32 {
        self.depth & flags::DEPTH_MASK
    }

    pub fn set_bounces(&mut self, bounces: u32) {
        self.depth = (self.depth & !flags::DEPTH_MASK) | (bounces & flags::DEPTH_MASK);
    }

    /// Move the origin just past a boundary found `t` along the ray.
    pub fn advance(&mut self, t: f32) {
        self.origin += self.direction * (t * (1.0 + f32::EPSILON));
    }

    /// Number of bytes `pack` writes for this ray.
    pub fn packed_size(&self) -> usize {
        match self.volume {
            Some(_) => VOLUME_PACKED_SIZE,
            None => SURFACE_PACKED_SIZE,
        }
    }

    /// Write the ray in its wire layout. Returns the number of bytes written.
    pub fn pack<W: Write>(&self, out: &mut W) -> io::Result<usize> {
        out.write_u8(match self.volume {
            Some(_) => LAYOUT_VOLUME,
            None => LAYOUT_SURFACE,
        })?;
        for v in [self.origin, self.direction, self.color] {
            out.write_f32::<LittleEndian>(v.x)?;
            out.write_f32::<LittleEndian>(v.y)?;
            out.write_f32::<LittleEndian>(v.z)?;
        }
        out.write_f32::<LittleEndian>(self.w)?;
        out.write_f32::<LittleEndian>(self.t)?;
        out.write_f32::<LittleEndian>(self.t_max)?;
        out.write_i32::<LittleEndian>(self.id)?;
        out.write_u32::<LittleEndian>(self.ray_type as u32)?;
        out.write_u32::<LittleEndian>(self.depth)?;
        if let Some(volume) = self.volume {
            out.write_f32::<LittleEndian>(volume.opacity)?;
            out.write_u32::<LittleEndian>(volume.sample_type)?;
        }
        Ok(self.packed_size())
    }

    /// Read one ray, advancing the reader past it.
    pub fn unpack<R: Read>(input: &mut R) -> PackResult<Ray> {
        let layout = input.read_u8()?;
        if layout != LAYOUT_SURFACE && layout != LAYOUT_VOLUME {
            return Err(PackError::UnknownLayout(layout));
        }

        let vec3 = |input: &mut R| -> io::Result<Vec3> {
            Ok(Vec3::new(
                input.read_f32::<LittleEndian>()?,
                input.read_f32::<LittleEndian>()?,
                input.read_f32::<LittleEndian>()?,
            ))
        };
        let origin = vec3(input)?;
        let direction = vec3(input)?;
        let color = vec3(input)?;

        let w = input.read_f32::<LittleEndian>()?;
        let t = input.read_f32::<LittleEndian>()?;
        let t_max = input.read_f32::<LittleEndian>()?;
        let id = input.read_i32::<LittleEndian>()?;
        let ray_type = RayType::from_u32(input.read_u32::<LittleEndian>()?)?;
        let depth = input.read_u32::<LittleEndian>()?;

        let volume = if layout == LAYOUT_VOLUME {
            Some(VolumeState {
                opacity: input.read_f32::<LittleEndian>()?,
                sample_type: input.read_u32::<LittleEndian>()?,
            })
        } else {
            None
        };

        Ok(Ray {
            origin,
            direction,
            color,
            w,
            t,
            t_max,
            id,
            ray_type,
            depth,
            volume,
        })
    }
}
