use crate::fusion::heading_from_field;
use crate::geometry::VectorExt;
use crate::sensors::SensorError;
use crate::types::{CalibrationProfile, Orientation};
use crate::ImuContext;
use glam::DVec3;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Gravity,
    MagneticField,
    GyroBias,
}

impl fmt::Display for CalibrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CalibrationPhase::Gravity => "gravity",
            CalibrationPhase::MagneticField => "magnetic field",
            CalibrationPhase::GyroBias => "gyro bias",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("no successful sensor reads during the {phase} phase")]
    NoSamples { phase: CalibrationPhase },
}

/// One-shot capture of the stationary reference values.
///
/// Assumes the vehicle is motionless for the whole run. Motion during
/// calibration silently skews gravity and bias; it is not detected.
#[derive(Debug, Clone, Copy)]
pub struct Calibrator {
    samples: usize,
}

impl Calibrator {
    pub fn new(samples: usize) -> Self {
        Self {
            samples: samples.max(1),
        }
    }

    /// Runs the gravity, magnetic field and gyro phases in that order, stores
    /// the resulting profile in `ctx` and primes the orientation record.
    ///
    /// On error the previous profile and orientation are left untouched.
    pub fn calibrate(&self, ctx: &ImuContext) -> Result<CalibrationProfile, CalibrationError> {
        let sensors = ctx.sensors();
        info!(samples = self.samples, "Calibrating sensors, keep the vehicle still");

        let gravity = average_successful(CalibrationPhase::Gravity, self.samples, || {
            sensors.read_acceleration()
        })?;
        let gravity_magnitude = gravity.magnitude();

        let field = average_successful(CalibrationPhase::MagneticField, self.samples, || {
            sensors.read_magnetic_field()
        })?;
        let inclination = field.degrees_between(gravity) - 90.0;

        let gyro_bias = average_successful(CalibrationPhase::GyroBias, 2 * self.samples, || {
            sensors.read_rotation_rate()
        })?;

        let profile = CalibrationProfile {
            gravity,
            gravity_magnitude,
            gyro_bias,
            inclination,
            field_magnitude: field.magnitude(),
        };

        let altitude = match sensors.read_altitude() {
            Ok(altitude) => Some(altitude),
            Err(e) => {
                warn!(%e, "Baseline altitude unavailable");
                None
            }
        };

        ctx.update(|state| {
            let primed = Orientation {
                acceleration: DVec3::ZERO,
                gravity,
                heading: heading_from_field(field),
                altitude: altitude.unwrap_or(state.current.altitude),
            };
            state.current = primed;
            state.previous = primed;
        });
        ctx.set_profile(profile);

        info!(
            gravity_x = gravity.x,
            gravity_y = gravity.y,
            gravity_z = gravity.z,
            gravity_magnitude,
            bias_x = gyro_bias.x,
            bias_y = gyro_bias.y,
            bias_z = gyro_bias.z,
            inclination,
            "Sensor calibration complete"
        );

        Ok(profile)
    }
}

/// Mean of the reads that succeed out of `count` attempts.
fn average_successful<F>(
    phase: CalibrationPhase,
    count: usize,
    mut read: F,
) -> Result<DVec3, CalibrationError>
where
    F: FnMut() -> Result<DVec3, SensorError>,
{
    let mut sum = DVec3::ZERO;
    let mut ok = 0usize;
    let mut last_error = None;
    for _ in 0..count {
        match read() {
            Ok(v) => {
                sum += v;
                ok += 1;
            }
            Err(e) => last_error = Some(e),
        }
    }

    if let Some(e) = last_error {
        warn!(%phase, failed = count - ok, %e, "Skipped failed reads during calibration");
    }
    if ok == 0 {
        return Err(CalibrationError::NoSamples { phase });
    }
    Ok(sum / ok as f64)
}
