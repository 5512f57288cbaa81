//! Thrust allocation and motor output for a multirotor.

pub mod allocator;
pub mod controller;
pub mod driver;
pub mod topology;

pub use allocator::{allocate, AllocationError, MotorThrust};
pub use controller::{MotionController, MotionError};
pub use driver::{
    CalibrationPrompt, DriverError, EscMotorDriver, EscProfile, MotorDriver, PwmOutput,
    SimulatedPwm,
};
pub use topology::{Axis, AxisMotors, MotorTopology, TopologyError};
