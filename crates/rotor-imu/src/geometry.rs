//! Vector helpers on top of `glam::DVec3`.
//!
//! Frame convention: +Z points at the sky, +X towards the front of the
//! vehicle, +Y to the left (right-hand rule).

use glam::DVec3;

/// Magnitudes below this are treated as zero when a direction is needed.
pub const EPSILON: f64 = 1e-9;

/// Angle and direction accessors used by the estimator.
///
/// Every accessor is total: a zero-length input yields 0 (or a zero vector)
/// instead of NaN.
pub trait VectorExt {
    /// Euclidean length, always >= 0.
    fn magnitude(self) -> f64;

    /// Direction cosines `(cos a, cos b, cos g)` with respect to X, Y and Z.
    fn direction_cosines(self) -> DVec3;

    /// Angle to `other` in degrees, in `[0, 180]`.
    fn degrees_between(self, other: DVec3) -> f64;

    /// Angle of the XY projection measured counter-clockwise from +X, in
    /// degrees within `(-180, 180]`.
    fn angle_xy(self) -> f64;

    /// Angle of the XZ projection measured from +X about -Y, in degrees.
    fn angle_xz(self) -> f64;

    /// Elevation above the XY plane in degrees, in `[-90, 90]`.
    fn angle_from_horizontal(self) -> f64;

    /// Length of the XY projection.
    fn horizontal_magnitude(self) -> f64;
}

impl VectorExt for DVec3 {
    fn magnitude(self) -> f64 {
        self.length()
    }

    fn direction_cosines(self) -> DVec3 {
        let mag = self.length();
        if mag < EPSILON {
            DVec3::ZERO
        } else {
            self / mag
        }
    }

    fn degrees_between(self, other: DVec3) -> f64 {
        let a = self.length();
        let b = other.length();
        if a < EPSILON || b < EPSILON {
            return 0.0;
        }
        // Rounding can push the cosine just outside [-1, 1].
        let cos = (self.dot(other) / (a * b)).clamp(-1.0, 1.0);
        cos.acos().to_degrees()
    }

    fn angle_xy(self) -> f64 {
        if self.horizontal_magnitude() < EPSILON {
            return 0.0;
        }
        self.y.atan2(self.x).to_degrees()
    }

    fn angle_xz(self) -> f64 {
        if self.x.hypot(self.z) < EPSILON {
            return 0.0;
        }
        self.z.atan2(self.x).to_degrees()
    }

    fn angle_from_horizontal(self) -> f64 {
        if self.length() < EPSILON {
            return 0.0;
        }
        self.z.atan2(self.horizontal_magnitude()).to_degrees()
    }

    fn horizontal_magnitude(self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Builds a vector from its planar angle (XY, from +X), its elevation above
/// the XY plane and its length. Angles are in degrees.
pub fn from_angles_and_magnitude(angle_xy: f64, angle_vertical: f64, magnitude: f64) -> DVec3 {
    let (sin_xy, cos_xy) = angle_xy.to_radians().sin_cos();
    let (sin_v, cos_v) = angle_vertical.to_radians().sin_cos();
    DVec3::new(cos_xy * cos_v, sin_xy * cos_v, sin_v) * magnitude
}
