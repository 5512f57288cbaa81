use glam::DVec3;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor} read failed: {reason}")]
    ReadFailed {
        sensor: &'static str,
        reason: String,
    },
}

/// Blocking access to the inertial, magnetic and barometric sensors.
///
/// Units: acceleration in g, rotation rate in deg/s, magnetic field in any
/// consistent unit, altitude in metres.
pub trait SensorGateway: Send + Sync {
    fn read_acceleration(&self) -> Result<DVec3, SensorError>;
    fn read_rotation_rate(&self) -> Result<DVec3, SensorError>;
    fn read_magnetic_field(&self) -> Result<DVec3, SensorError>;
    fn read_altitude(&self) -> Result<f64, SensorError>;
}

/// Averages `count` consecutive reads. Any failed read fails the whole window.
pub fn average_vector<F>(count: usize, mut read: F) -> Result<DVec3, SensorError>
where
    F: FnMut() -> Result<DVec3, SensorError>,
{
    let count = count.max(1);
    let mut sum = DVec3::ZERO;
    for _ in 0..count {
        sum += read()?;
    }
    Ok(sum / count as f64)
}

/// Constant readings reported by [`SimulatedSensors`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Readings {
    pub acceleration: DVec3,
    pub rotation_rate: DVec3,
    pub magnetic_field: DVec3,
    pub altitude: f64,
}

impl Default for Readings {
    /// A level, motionless vehicle facing magnetic north in a field that
    /// dips 60 degrees below the horizontal.
    fn default() -> Self {
        Self {
            acceleration: DVec3::Z,
            rotation_rate: DVec3::ZERO,
            magnetic_field: DVec3::new(0.25, 0.0, -0.433),
            altitude: 0.0,
        }
    }
}

/// In-memory sensor gateway for development without hardware attached.
pub struct SimulatedSensors {
    readings: Mutex<Readings>,
    failing: AtomicBool,
    reads: AtomicU64,
}

impl SimulatedSensors {
    pub fn new(readings: Readings) -> Self {
        Self {
            readings: Mutex::new(readings),
            failing: AtomicBool::new(false),
            reads: AtomicU64::new(0),
        }
    }

    pub fn set_readings(&self, readings: Readings) {
        *self.readings.lock() = readings;
    }

    pub fn readings(&self) -> Readings {
        *self.readings.lock()
    }

    /// While set, every read fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Total number of read attempts, failed ones included.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn read<T>(
        &self,
        sensor: &'static str,
        pick: impl FnOnce(&Readings) -> T,
    ) -> Result<T, SensorError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SensorError::ReadFailed {
                sensor,
                reason: "simulated fault".into(),
            });
        }
        Ok(pick(&self.readings.lock()))
    }
}

impl Default for SimulatedSensors {
    fn default() -> Self {
        Self::new(Readings::default())
    }
}

impl SensorGateway for SimulatedSensors {
    fn read_acceleration(&self) -> Result<DVec3, SensorError> {
        self.read("accelerometer", |r| r.acceleration)
    }

    fn read_rotation_rate(&self) -> Result<DVec3, SensorError> {
        self.read("gyroscope", |r| r.rotation_rate)
    }

    fn read_magnetic_field(&self) -> Result<DVec3, SensorError> {
        self.read("magnetometer", |r| r.magnetic_field)
    }

    fn read_altitude(&self) -> Result<f64, SensorError> {
        self.read("barometer", |r| r.altitude)
    }
}
