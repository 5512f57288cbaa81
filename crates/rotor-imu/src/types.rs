use glam::DVec3;
use std::fmt;

/// Fused orientation snapshot handed to listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Orientation {
    /// Acceleration with gravity removed (g).
    pub acceleration: DVec3,
    /// Current gravity estimate in the body frame (g). Doubles as the
    /// attitude reference.
    pub gravity: DVec3,
    /// Heading in degrees from magnetic north, in `[0, 360)`.
    pub heading: f64,
    /// Barometric altitude (m).
    pub altitude: f64,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.acceleration;
        let g = self.gravity;
        write!(
            f,
            "accel=({:.4}, {:.4}, {:.4}) gravity=({:.4}, {:.4}, {:.4}) \
             heading={:.2} altitude={:.2}",
            a.x, a.y, a.z, g.x, g.y, g.z, self.heading, self.altitude
        )
    }
}

/// The live record and the value it held before the last write, kept side
/// by side for exponential smoothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrientationState {
    pub current: Orientation,
    pub previous: Orientation,
}

/// Steady-state reference values captured while the vehicle is motionless.
///
/// Replaced wholesale on recalibration, never patched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProfile {
    /// Averaged accelerometer reading at rest (g).
    pub gravity: DVec3,
    /// `|gravity|`, the magnitude every attitude estimate is rescaled to.
    pub gravity_magnitude: f64,
    /// Averaged gyroscope reading at rest (deg/s).
    pub gyro_bias: DVec3,
    /// Magnetic inclination below the horizontal (deg).
    pub inclination: f64,
    /// Magnitude of the averaged magnetic field.
    pub field_magnitude: f64,
}

/// The four independently updated quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    Acceleration,
    Attitude,
    Heading,
    Altitude,
}

impl Quantity {
    pub const ALL: [Quantity; 4] = [
        Quantity::Acceleration,
        Quantity::Attitude,
        Quantity::Heading,
        Quantity::Altitude,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Quantity::Acceleration => "acceleration",
            Quantity::Attitude => "attitude",
            Quantity::Heading => "heading",
            Quantity::Altitude => "altitude",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
