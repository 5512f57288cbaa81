use crate::allocator::{allocate, AllocationError, MotorThrust};
use crate::driver::{DriverError, MotorDriver};
use crate::topology::MotorTopology;
use glam::DVec3;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MotionError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("driver has {driver} motors but the topology expects {topology}")]
    MotorCountMismatch { driver: usize, topology: usize },
}

/// Holds the target motion and keeps the motors in line with it.
///
/// Only the Z component of the angular target is used; the frame has no
/// way to roll or pitch on purpose.
pub struct MotionController<D> {
    driver: D,
    topology: MotorTopology,
    linear: DVec3,
    angular: DVec3,
    output: MotorThrust,
}

impl<D: MotorDriver> MotionController<D> {
    pub fn new(driver: D, topology: MotorTopology) -> Result<Self, MotionError> {
        if driver.motor_count() != topology.motor_count() {
            return Err(MotionError::MotorCountMismatch {
                driver: driver.motor_count(),
                topology: topology.motor_count(),
            });
        }
        let output = MotorThrust::zeros(topology.motor_count());
        Ok(Self {
            driver,
            topology,
            linear: DVec3::ZERO,
            angular: DVec3::ZERO,
            output,
        })
    }

    /// Sets the linear motion target. A rejected target leaves the stored
    /// targets and the motors as they were.
    pub fn set_linear(&mut self, linear: DVec3) -> Result<&MotorThrust, MotionError> {
        self.apply(linear, self.angular)
    }

    pub fn set_angular(&mut self, angular: DVec3) -> Result<&MotorThrust, MotionError> {
        let magnitude = angular.length();
        if magnitude > 1.0 {
            return Err(AllocationError::AngularTooLarge { magnitude }.into());
        }
        self.apply(self.linear, angular)
    }

    /// Zeroes both targets, idling every motor at its arming signal.
    pub fn stop(&mut self) -> Result<(), MotionError> {
        self.apply(DVec3::ZERO, DVec3::ZERO)?;
        Ok(())
    }

    pub fn linear(&self) -> DVec3 {
        self.linear
    }

    pub fn angular(&self) -> DVec3 {
        self.angular
    }

    /// Thrust last sent to the motors.
    pub fn output(&self) -> &MotorThrust {
        &self.output
    }

    pub fn topology(&self) -> &MotorTopology {
        &self.topology
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn apply(&mut self, linear: DVec3, angular: DVec3) -> Result<&MotorThrust, MotionError> {
        let thrust = allocate(linear, angular.z, &self.topology).inspect_err(|e| {
            warn!(%e, "Rejected motion target");
        })?;

        for (motor, fraction) in thrust.iter().enumerate() {
            if let Err(e) = self.driver.set_thrust(motor, fraction) {
                warn!(motor, %e, "Motor write failed, restoring previous thrust");
                self.restore(motor);
                return Err(e.into());
            }
        }
        debug!(thrust = ?thrust.as_slice(), "Motor thrust updated");

        self.linear = linear;
        self.angular = angular;
        self.output = thrust;
        Ok(&self.output)
    }

    /// Puts motors `0..written` back to the last accepted output. Best
    /// effort: a motor that cannot be restored is logged and skipped.
    fn restore(&mut self, written: usize) {
        for motor in 0..written {
            let previous = self.output[motor];
            if let Err(e) = self.driver.set_thrust(motor, previous) {
                warn!(motor, %e, "Failed to restore motor thrust");
            }
        }
    }
}
