use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DriverError {
    #[error("motor {motor} does not exist ({count} motors configured)")]
    UnknownMotor { motor: usize, count: usize },
    #[error("thrust must be a finite, non-negative fraction, got {0}")]
    InvalidThrust(f64),
    #[error("PWM channel {channel}: {reason}")]
    Pwm { channel: u8, reason: String },
    #[error("calibration of motor {motor} aborted by operator")]
    CalibrationAborted { motor: usize },
}

/// Operator steps during ESC calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPrompt {
    /// Disconnect the ESC from battery power, then confirm.
    DisconnectPower,
    /// Reconnect power and confirm within a second or two of the beeps.
    ReconnectPower,
}

/// Per-motor thrust output.
pub trait MotorDriver: Send {
    fn motor_count(&self) -> usize;

    /// Sends the arming signal if the motor is not armed yet.
    fn arm(&mut self, motor: usize) -> Result<(), DriverError>;

    /// Commands a thrust fraction. Values above 1 saturate at full thrust.
    fn set_thrust(&mut self, motor: usize, fraction: f64) -> Result<(), DriverError>;

    /// Thrust currently commanded, read back from the hardware.
    fn thrust(&self, motor: usize) -> Result<f64, DriverError>;

    /// Interactive endpoint calibration. `confirm` is asked at every
    /// operator step and aborts the sequence by returning `false`.
    fn calibrate(
        &mut self,
        motor: usize,
        confirm: &mut dyn FnMut(CalibrationPrompt) -> bool,
    ) -> Result<(), DriverError>;
}

/// Duty-cycle output of a PWM controller chip.
pub trait PwmOutput: Send {
    /// Sets the duty cycle of `channel` as a fraction of the period.
    fn set_duty(&mut self, channel: u8, duty: f64) -> Result<(), DriverError>;

    fn duty(&self, channel: u8) -> Result<f64, DriverError>;
}

/// Duty-cycle endpoints of an electronic speed controller.
#[derive(Debug, Clone, PartialEq)]
pub struct EscProfile {
    /// Signal that tells the ESC a PWM source is attached.
    pub arming_duty: f64,
    /// Duty at the smallest non-zero thrust. Slightly above the true
    /// minimum so the motor keeps turning under load.
    pub min_duty: f64,
    pub max_duty: f64,
    /// Hold time after the arming signal.
    pub arming_delay: Duration,
    /// Top endpoint taught during calibration, a little above `max_duty` so
    /// full speed is not reached before full thrust.
    pub calibration_high_duty: f64,
    pub calibration_low_duty: f64,
    pub calibration_high_hold: Duration,
    pub calibration_low_hold: Duration,
}

impl Default for EscProfile {
    fn default() -> Self {
        Self {
            arming_duty: 0.06,
            min_duty: 0.11,
            max_duty: 0.6337,
            arming_delay: Duration::from_millis(50),
            // 0.0263 above max_duty.
            calibration_high_duty: 0.66,
            calibration_low_duty: 0.10,
            calibration_high_hold: Duration::from_millis(500),
            calibration_low_hold: Duration::from_secs(1),
        }
    }
}

impl EscProfile {
    fn range(&self) -> f64 {
        self.max_duty - self.min_duty
    }

    /// Duty for a thrust fraction. Zero thrust idles at the arming signal.
    pub fn duty_for(&self, thrust: f64) -> f64 {
        if thrust <= 0.0 {
            self.arming_duty
        } else if thrust >= 1.0 {
            self.max_duty
        } else {
            thrust * self.range() + self.min_duty
        }
    }

    /// Inverse of [`EscProfile::duty_for`], never below 0.
    pub fn thrust_for(&self, duty: f64) -> f64 {
        ((duty - self.min_duty) / self.range()).max(0.0)
    }
}

/// Drives ESCs through a PWM chip, one channel per motor.
pub struct EscMotorDriver<P> {
    pwm: P,
    profile: EscProfile,
    /// Motor index to PWM channel.
    channels: Vec<u8>,
    armed: Vec<bool>,
}

impl<P: PwmOutput> EscMotorDriver<P> {
    pub fn new(pwm: P, profile: EscProfile, channels: Vec<u8>) -> Self {
        let armed = vec![false; channels.len()];
        Self {
            pwm,
            profile,
            channels,
            armed,
        }
    }

    pub fn pwm(&self) -> &P {
        &self.pwm
    }

    pub fn pwm_mut(&mut self) -> &mut P {
        &mut self.pwm
    }

    pub fn profile(&self) -> &EscProfile {
        &self.profile
    }

    pub fn is_armed(&self, motor: usize) -> bool {
        self.armed.get(motor).copied().unwrap_or(false)
    }

    fn channel(&self, motor: usize) -> Result<u8, DriverError> {
        self.channels.get(motor).copied().ok_or(DriverError::UnknownMotor {
            motor,
            count: self.channels.len(),
        })
    }
}

impl<P: PwmOutput> MotorDriver for EscMotorDriver<P> {
    fn motor_count(&self) -> usize {
        self.channels.len()
    }

    fn arm(&mut self, motor: usize) -> Result<(), DriverError> {
        let channel = self.channel(motor)?;
        if self.armed[motor] {
            return Ok(());
        }
        self.pwm.set_duty(channel, self.profile.arming_duty)?;
        thread::sleep(self.profile.arming_delay);
        self.armed[motor] = true;
        debug!(motor, channel, "ESC armed");
        Ok(())
    }

    fn set_thrust(&mut self, motor: usize, fraction: f64) -> Result<(), DriverError> {
        if !fraction.is_finite() || fraction < 0.0 {
            return Err(DriverError::InvalidThrust(fraction));
        }
        let channel = self.channel(motor)?;
        self.arm(motor)?;
        self.pwm.set_duty(channel, self.profile.duty_for(fraction))
    }

    fn thrust(&self, motor: usize) -> Result<f64, DriverError> {
        let channel = self.channel(motor)?;
        Ok(self.profile.thrust_for(self.pwm.duty(channel)?))
    }

    fn calibrate(
        &mut self,
        motor: usize,
        confirm: &mut dyn FnMut(CalibrationPrompt) -> bool,
    ) -> Result<(), DriverError> {
        let channel = self.channel(motor)?;

        if !confirm(CalibrationPrompt::DisconnectPower) {
            return Err(DriverError::CalibrationAborted { motor });
        }
        info!(motor, duty = self.profile.calibration_high_duty, "Teaching ESC maximum throttle");
        self.pwm.set_duty(channel, self.profile.calibration_high_duty)?;
        thread::sleep(self.profile.calibration_high_hold);

        if !confirm(CalibrationPrompt::ReconnectPower) {
            return Err(DriverError::CalibrationAborted { motor });
        }
        info!(motor, duty = self.profile.calibration_low_duty, "Teaching ESC minimum throttle");
        self.pwm.set_duty(channel, self.profile.calibration_low_duty)?;
        thread::sleep(self.profile.calibration_low_hold);

        Ok(())
    }
}

/// In-memory PWM chip for development without hardware attached.
#[derive(Debug, Clone)]
pub struct SimulatedPwm {
    duties: Vec<f64>,
    writes: usize,
}

impl SimulatedPwm {
    pub fn new(channels: usize) -> Self {
        Self {
            duties: vec![0.0; channels],
            writes: 0,
        }
    }

    /// Number of duty-cycle writes so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn duties(&self) -> &[f64] {
        &self.duties
    }

    fn slot(&self, channel: u8) -> Result<usize, DriverError> {
        let index = usize::from(channel);
        if index < self.duties.len() {
            Ok(index)
        } else {
            Err(DriverError::Pwm {
                channel,
                reason: format!("only {} channels available", self.duties.len()),
            })
        }
    }
}

impl PwmOutput for SimulatedPwm {
    fn set_duty(&mut self, channel: u8, duty: f64) -> Result<(), DriverError> {
        let index = self.slot(channel)?;
        if !(0.0..=1.0).contains(&duty) {
            return Err(DriverError::Pwm {
                channel,
                reason: format!("duty cycle {duty} outside [0, 1]"),
            });
        }
        self.duties[index] = duty;
        self.writes += 1;
        Ok(())
    }

    fn duty(&self, channel: u8) -> Result<f64, DriverError> {
        Ok(self.duties[self.slot(channel)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn instant_profile() -> EscProfile {
        EscProfile {
            arming_delay: Duration::ZERO,
            calibration_high_hold: Duration::ZERO,
            calibration_low_hold: Duration::ZERO,
            ..EscProfile::default()
        }
    }

    fn driver() -> EscMotorDriver<SimulatedPwm> {
        // Motors wired to channels in reverse order.
        EscMotorDriver::new(SimulatedPwm::new(4), instant_profile(), vec![3, 2, 1, 0])
    }

    #[test]
    fn duty_mapping_endpoints() {
        let profile = EscProfile::default();
        assert_eq!(profile.duty_for(0.0), 0.06);
        assert_eq!(profile.duty_for(1.0), 0.6337);
        assert_eq!(profile.duty_for(7.0), 0.6337);
        assert_relative_eq!(profile.duty_for(0.5), 0.11 + 0.5 * (0.6337 - 0.11), epsilon = 1e-12);
        let headroom = profile.calibration_high_duty - profile.max_duty;
        assert_relative_eq!(headroom, 0.0263, epsilon = 1e-12);
    }

    #[test]
    fn read_back_inverts_mapping() {
        let profile = EscProfile::default();
        for thrust in [0.1, 0.5, 0.9, 1.0] {
            let back = profile.thrust_for(profile.duty_for(thrust));
            assert_relative_eq!(back, thrust, epsilon = 1e-12);
        }
        // The arming signal sits below the minimum and reads as zero.
        assert_eq!(profile.thrust_for(profile.duty_for(0.0)), 0.0);
    }

    #[test]
    fn first_command_arms_the_motor() {
        let mut d = driver();
        assert!(!d.is_armed(1));

        d.set_thrust(1, 0.5).unwrap();
        assert!(d.is_armed(1));
        // Arming write plus the thrust write, both on channel 2.
        assert_eq!(d.pwm().writes(), 2);
        assert_relative_eq!(d.thrust(1).unwrap(), 0.5, epsilon = 1e-12);
        assert_eq!(d.pwm().duties()[0], 0.0);

        d.set_thrust(1, 0.25).unwrap();
        assert_eq!(d.pwm().writes(), 3);
    }

    #[test]
    fn rejects_bad_motor_and_thrust() {
        let mut d = driver();
        assert_eq!(d.set_thrust(4, 0.1), Err(DriverError::UnknownMotor { motor: 4, count: 4 }));
        assert_eq!(d.set_thrust(0, -0.1), Err(DriverError::InvalidThrust(-0.1)));
        assert!(matches!(d.set_thrust(0, f64::NAN), Err(DriverError::InvalidThrust(_))));
        assert_eq!(d.pwm().writes(), 0);
    }

    #[test]
    fn calibration_sequence() {
        let mut d = driver();
        let mut prompts = Vec::new();
        d.calibrate(0, &mut |p| {
            prompts.push(p);
            true
        })
        .unwrap();
        assert_eq!(
            prompts,
            [CalibrationPrompt::DisconnectPower, CalibrationPrompt::ReconnectPower]
        );
        assert_eq!(d.pwm().duties()[3], 0.10);
        assert_eq!(d.pwm().writes(), 2);
    }

    #[test]
    fn calibration_can_be_aborted() {
        let mut d = driver();
        let result = d.calibrate(2, &mut |p| p == CalibrationPrompt::DisconnectPower);
        assert_eq!(result, Err(DriverError::CalibrationAborted { motor: 2 }));
        // Only the high endpoint was written.
        assert_relative_eq!(d.pwm().duties()[1], 0.66, epsilon = 1e-12);
    }
}
