use anyhow::{ensure, Result};
use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Orientation estimator.
    pub imu: ImuConfig,
    /// ESC output and frame layout.
    pub motors: MotorConfig,
    /// Flight-logic listener.
    pub flight: FlightConfig,
}

impl AppConfig {
    /// Checks the values a hand-edited file can get wrong before anything is
    /// built from them.
    pub fn validate(&self) -> Result<()> {
        self.imu.validate()?;
        self.motors.validate()?;
        self.flight.validate()
    }
}

fn ensure_rate(name: &str, hz: f64) -> Result<()> {
    let usable = hz.is_finite() && hz > 0.0 && Duration::try_from_secs_f64(1.0 / hz).is_ok();
    ensure!(usable, "{name} must be a positive number of Hz, got {hz}");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuConfig {
    /// Stationary samples per calibration phase (the gyro phase takes twice as many).
    pub calibration_samples: usize,
    /// Reads averaged on every fusion update.
    pub update_samples: usize,
    pub acceleration_hz: f64,
    pub attitude_hz: f64,
    pub heading_hz: f64,
    pub altitude_hz: f64,
    /// Exponential smoothing factor in (0, 1]. 1.0 disables smoothing.
    pub smoothing: f64,
    /// Trust in the integrated gyro estimate. Sums to 1 with `accel_weight`.
    pub gyro_weight: f64,
    pub accel_weight: f64,
    pub max_listeners: usize,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            calibration_samples: 1000,
            update_samples: 3,
            acceleration_hz: 200.0,
            attitude_hz: 400.0,
            heading_hz: 200.0,
            altitude_hz: 2.0,
            smoothing: 1.0,
            gyro_weight: 0.9,
            accel_weight: 0.1,
            max_listeners: 10,
        }
    }
}

impl ImuConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.calibration_samples > 0, "imu.calibration_samples must be at least 1");
        ensure!(self.update_samples > 0, "imu.update_samples must be at least 1");
        ensure!(self.max_listeners > 0, "imu.max_listeners must be at least 1");
        ensure_rate("imu.acceleration_hz", self.acceleration_hz)?;
        ensure_rate("imu.attitude_hz", self.attitude_hz)?;
        ensure_rate("imu.heading_hz", self.heading_hz)?;
        ensure_rate("imu.altitude_hz", self.altitude_hz)?;
        ensure!(
            self.smoothing > 0.0 && self.smoothing <= 1.0,
            "imu.smoothing must be in (0, 1], got {}",
            self.smoothing
        );
        ensure!(
            self.gyro_weight >= 0.0
                && self.accel_weight >= 0.0
                && (self.gyro_weight + self.accel_weight - 1.0).abs() <= 1e-6,
            "imu.gyro_weight and imu.accel_weight must be non-negative and sum to 1"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    /// PWM channel for each motor, indexed by motor number.
    pub channels: Vec<u8>,
    pub esc: EscConfig,
    pub topology: TopologyConfig,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            channels: vec![0, 1, 2, 3],
            esc: EscConfig::default(),
            topology: TopologyConfig::default(),
        }
    }
}

impl MotorConfig {
    fn validate(&self) -> Result<()> {
        let count = self.topology.motor_count;
        ensure!(
            self.channels.len() == count,
            "motors.channels lists {} channels for {count} motors",
            self.channels.len()
        );
        let unique: HashSet<u8> = self.channels.iter().copied().collect();
        ensure!(unique.len() == self.channels.len(), "motors.channels has a duplicate channel");
        self.esc.validate()?;
        self.topology.validate()
    }
}

/// Duty cycles are fractions of the PWM period. These depend on the ESC
/// model and will most likely need tuning for other hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscConfig {
    pub arming_duty: f64,
    pub min_duty: f64,
    pub max_duty: f64,
    pub arming_delay_ms: u64,
    pub calibration_high_duty: f64,
    pub calibration_low_duty: f64,
    pub calibration_high_hold_ms: u64,
    pub calibration_low_hold_ms: u64,
}

impl Default for EscConfig {
    fn default() -> Self {
        Self {
            arming_duty: 0.06,
            min_duty: 0.11,
            max_duty: 0.6337,
            arming_delay_ms: 50,
            calibration_high_duty: 0.66,
            calibration_low_duty: 0.10,
            calibration_high_hold_ms: 500,
            calibration_low_hold_ms: 1000,
        }
    }
}

impl EscConfig {
    fn validate(&self) -> Result<()> {
        ensure!(
            0.0 <= self.arming_duty
                && self.arming_duty < self.min_duty
                && self.min_duty < self.max_duty
                && self.max_duty <= 1.0,
            "motors.esc duties must satisfy 0 <= arming < min < max <= 1"
        );
        ensure!(
            0.0 <= self.calibration_low_duty
                && self.calibration_low_duty < self.calibration_high_duty
                && self.calibration_high_duty <= 1.0,
            "motors.esc calibration duties must satisfy 0 <= low < high <= 1"
        );
        Ok(())
    }
}

/// Motor subsets per axis direction. Defaults to the four-motor frame with
/// no reverse thrust.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub motor_count: usize,
    pub pos_x: Vec<usize>,
    pub neg_x: Vec<usize>,
    pub pos_y: Vec<usize>,
    pub neg_y: Vec<usize>,
    pub pos_z: Vec<usize>,
    pub neg_z: Vec<usize>,
    /// Motors that spin the frame towards +Z.
    pub spin_pos: Vec<usize>,
    pub spin_neg: Vec<usize>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            motor_count: 4,
            pos_x: vec![2],
            neg_x: vec![0],
            pos_y: vec![3],
            neg_y: vec![1],
            pos_z: vec![0, 1, 2, 3],
            neg_z: Vec::new(),
            spin_pos: vec![1, 3],
            spin_neg: vec![0, 2],
        }
    }
}

impl TopologyConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.motor_count > 0, "motors.topology.motor_count must be at least 1");
        ensure!(
            !self.spin_pos.is_empty() && !self.spin_neg.is_empty(),
            "motors.topology needs motors in both spin_pos and spin_neg"
        );
        let sets = [
            &self.pos_x,
            &self.neg_x,
            &self.pos_y,
            &self.neg_y,
            &self.pos_z,
            &self.neg_z,
            &self.spin_pos,
            &self.spin_neg,
        ];
        if let Some(index) = sets.into_iter().flatten().find(|&&i| i >= self.motor_count) {
            anyhow::bail!(
                "motors.topology refers to motor {index}, only {} configured",
                self.motor_count
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightConfig {
    /// Telemetry rate while on the ground.
    pub idle_rate_hz: f64,
    /// Telemetry rate once airborne.
    pub in_flight_rate_hz: f64,
    /// Linear motion target held while hovering.
    #[serde(with = "dvec3_serde")]
    pub hover: DVec3,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            idle_rate_hz: 1.0,
            in_flight_rate_hz: 500.0,
            hover: DVec3::new(0.0, 0.0, 0.5),
        }
    }
}

impl FlightConfig {
    fn validate(&self) -> Result<()> {
        ensure_rate("flight.idle_rate_hz", self.idle_rate_hz)?;
        ensure_rate("flight.in_flight_rate_hz", self.in_flight_rate_hz)?;
        ensure!(
            self.hover.is_finite() && self.hover.length() <= 1.0,
            "flight.hover must have a magnitude of at most 1, got {}",
            self.hover.length()
        );
        Ok(())
    }
}

// Stored as a plain `[x, y, z]` array.
mod dvec3_serde {
    use glam::DVec3;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &DVec3, s: S) -> Result<S::Ok, S::Error> {
        v.to_array().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DVec3, D::Error> {
        <[f64; 3]>::deserialize(d).map(DVec3::from_array)
    }
}
