//! Orientation estimation for a multirotor.
//!
//! Sensor readings flow through a one-shot [`Calibrator`], four independent
//! periodic fusion tasks ([`FusionEngine`]) and out to listeners registered
//! on the [`ObserverHub`]. The hub owns the lifecycle: fusion runs only while
//! at least one listener is subscribed.

pub mod calibration;
pub mod fusion;
pub mod geometry;
pub mod hub;
pub mod sensors;
pub mod types;

pub use calibration::{CalibrationError, CalibrationPhase, Calibrator};
pub use fusion::{FusionEngine, FusionSettings, Fuser, LifecycleError};
pub use geometry::VectorExt;
pub use hub::{ImuSettings, ListenerControl, ObserverHub, SubscriptionId};
pub use sensors::{Readings, SensorError, SensorGateway, SimulatedSensors};
pub use types::{CalibrationProfile, Orientation, OrientationState, Quantity};

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImuError {
    #[error("listener limit of {max} reached")]
    TooManyListeners { max: usize },
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
    #[error("update rate must be a positive number of Hz, got {0}")]
    InvalidRate(f64),
    #[error("cannot calibrate while {listeners} listener(s) are active")]
    CalibrationWhileRunning { listeners: usize },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// State shared by the calibrator, the fusion tasks and the hub.
///
/// One lock guards the whole orientation record. Readers always get a copy.
/// Only the calibrator and the fusion tasks write, through `update`, so the
/// guard is released when the closure returns, on every path.
pub struct ImuContext {
    sensors: Arc<dyn SensorGateway>,
    orientation: Mutex<OrientationState>,
    profile: RwLock<Option<CalibrationProfile>>,
}

impl ImuContext {
    pub fn new(sensors: Arc<dyn SensorGateway>) -> Self {
        Self {
            sensors,
            orientation: Mutex::new(OrientationState::default()),
            profile: RwLock::new(None),
        }
    }

    pub fn sensors(&self) -> &dyn SensorGateway {
        self.sensors.as_ref()
    }

    /// Consistent copy of the current orientation.
    pub fn snapshot(&self) -> Orientation {
        self.orientation.lock().current
    }

    /// Copy of both the current and the previous record.
    pub fn state(&self) -> OrientationState {
        *self.orientation.lock()
    }

    /// Read-modify-write under a single acquisition of the orientation lock.
    pub(crate) fn update<R>(&self, write: impl FnOnce(&mut OrientationState) -> R) -> R {
        let mut state = self.orientation.lock();
        write(&mut state)
    }

    /// The profile from the most recent successful calibration.
    pub fn profile(&self) -> Option<CalibrationProfile> {
        *self.profile.read()
    }

    fn set_profile(&self, profile: CalibrationProfile) {
        *self.profile.write() = Some(profile);
    }
}
