use crate::geometry::{VectorExt, EPSILON};
use crate::sensors::{average_vector, SensorError};
use crate::types::{CalibrationProfile, Quantity};
use crate::{ImuContext, ImuError};
use crossbeam_channel::{bounded, RecvTimeoutError, Receiver, Sender};
use glam::{DQuat, DVec3};
use std::ops::{Add, Mul};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to spawn the {quantity} fusion task")]
    Spawn {
        quantity: Quantity,
        #[source]
        source: std::io::Error,
    },
    #[error("{quantity} rate of {rate_hz} Hz has no usable period")]
    InvalidRate { quantity: Quantity, rate_hz: f64 },
    #[error("failed to spawn a listener delivery thread")]
    SpawnListener(#[source] std::io::Error),
    #[error("fusion tasks did not stop cleanly: {failed:?}")]
    Stop { failed: Vec<Quantity> },
}

/// Rates, window size and filter weights for the four fusion tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionSettings {
    /// Reads averaged per update.
    pub update_samples: usize,
    pub acceleration_hz: f64,
    pub attitude_hz: f64,
    pub heading_hz: f64,
    pub altitude_hz: f64,
    /// Exponential smoothing factor in `(0, 1]`. 1 disables smoothing.
    pub smoothing: f64,
    /// Weight of the integrated gyro estimate in the gravity fusion.
    pub gyro_weight: f64,
    /// Weight of the accelerometer estimate. The two weights sum to 1.
    pub accel_weight: f64,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            update_samples: 3,
            acceleration_hz: 200.0,
            attitude_hz: 400.0,
            heading_hz: 200.0,
            altitude_hz: 2.0,
            smoothing: 1.0,
            gyro_weight: 0.9,
            accel_weight: 0.1,
        }
    }
}

impl FusionSettings {
    pub fn rate(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::Acceleration => self.acceleration_hz,
            Quantity::Attitude => self.attitude_hz,
            Quantity::Heading => self.heading_hz,
            Quantity::Altitude => self.altitude_hz,
        }
    }

    /// Sleep between two updates of `quantity`. `None` for a rate that has
    /// no representable period.
    pub fn period(&self, quantity: Quantity) -> Option<Duration> {
        period_for(self.rate(quantity))
    }

    pub fn validate(&self) -> Result<(), ImuError> {
        let invalid = |msg: String| Err(ImuError::InvalidSettings(msg));

        if self.update_samples == 0 {
            return invalid("update_samples must be at least 1".into());
        }
        for quantity in Quantity::ALL {
            if self.period(quantity).is_none() {
                let hz = self.rate(quantity);
                return invalid(format!(
                    "{quantity} rate must be a positive number of Hz, got {hz}"
                ));
            }
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return invalid(format!("smoothing must be in (0, 1], got {}", self.smoothing));
        }
        if !(self.gyro_weight >= 0.0 && self.accel_weight >= 0.0) {
            return invalid("fusion weights must be non-negative".into());
        }
        if (self.gyro_weight + self.accel_weight - 1.0).abs() > 1e-6 {
            return invalid(format!(
                "fusion weights must sum to 1, got {} + {}",
                self.gyro_weight, self.accel_weight
            ));
        }
        Ok(())
    }
}

/// Period of a rate in Hz. `None` unless the rate is positive, finite and
/// slow enough to fit a [`Duration`].
pub(crate) fn period_for(rate_hz: f64) -> Option<Duration> {
    if rate_hz.is_finite() && rate_hz > 0.0 {
        Duration::try_from_secs_f64(1.0 / rate_hz).ok()
    } else {
        None
    }
}

/// `alpha * computed + (1 - alpha) * previous`. Returns `computed` untouched
/// when smoothing is disabled.
pub fn smooth<T>(computed: T, previous: T, alpha: f64) -> T
where
    T: Mul<f64, Output = T> + Add<Output = T>,
{
    if alpha >= 1.0 {
        return computed;
    }
    computed * alpha + previous * (1.0 - alpha)
}

/// Wraps an angle in degrees into `[0, 360)`.
pub fn normalize_degrees(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid rounds tiny negatives up to exactly 360.
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Smooths a heading along the shortest arc, so 350 and 10 meet at 0
/// instead of 180.
pub fn smooth_heading(computed: f64, previous: f64, alpha: f64) -> f64 {
    if alpha >= 1.0 {
        return normalize_degrees(computed);
    }
    let diff = (computed - previous + 180.0).rem_euclid(360.0) - 180.0;
    normalize_degrees(previous + alpha * diff)
}

/// Heading of the horizontal projection of a magnetic field reading.
/// 0 when the field has no horizontal component.
pub fn heading_from_field(field: DVec3) -> f64 {
    normalize_degrees(field.angle_xy())
}

/// Wall-clock time between successive attitude updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElapsedClock {
    last: Option<Instant>,
}

impl ElapsedClock {
    /// Time since the previous call. The first call only records a baseline
    /// and returns zero.
    pub fn elapsed(&mut self, now: Instant) -> Duration {
        let dt = match self.last {
            Some(last) => now.saturating_duration_since(last),
            None => Duration::ZERO,
        };
        self.last = Some(now);
        dt
    }

    pub fn tick(&mut self) -> Duration {
        self.elapsed(Instant::now())
    }
}

/// Carries `gravity` through the body rotation produced by `rate` (deg/s,
/// bias already removed) over `dt`, rescaled to `magnitude`.
pub fn gyro_gravity_estimate(gravity: DVec3, rate: DVec3, dt: Duration, magnitude: f64) -> DVec3 {
    let turned = rate * dt.as_secs_f64();
    let rotation = DQuat::from_scaled_axis(DVec3::new(
        turned.x.to_radians(),
        turned.y.to_radians(),
        turned.z.to_radians(),
    ));
    // The body turned by `rotation`, so a world-fixed vector turns the other
    // way when seen from the body.
    let carried = rotation.inverse() * gravity;
    rescale(carried, magnitude).unwrap_or(gravity)
}

/// Accelerometer reading rescaled to the calibrated gravity magnitude.
/// `None` for a zero reading.
pub fn accel_gravity_estimate(accel: DVec3, magnitude: f64) -> Option<DVec3> {
    rescale(accel, magnitude)
}

/// Weighted sum of the two gravity estimates rescaled to `magnitude`.
/// Falls back to the gyro estimate alone when there is no accelerometer
/// estimate. `None` if the sum cancels out.
pub fn fuse_gravity(
    gyro: DVec3,
    accel: Option<DVec3>,
    gyro_weight: f64,
    accel_weight: f64,
    magnitude: f64,
) -> Option<DVec3> {
    let combined = match accel {
        Some(accel) => gyro * gyro_weight + accel * accel_weight,
        None => gyro,
    };
    rescale(combined, magnitude)
}

fn rescale(v: DVec3, magnitude: f64) -> Option<DVec3> {
    let len = v.magnitude();
    if len < EPSILON {
        None
    } else {
        Some(v * (magnitude / len))
    }
}

/// One synchronous update per fused quantity.
///
/// Sensor reads happen outside the orientation lock; each step then reads
/// the previous value, computes and writes back under a single acquisition.
/// A failed read returns the error and leaves the record untouched.
#[derive(Clone)]
pub struct Fuser {
    ctx: Arc<ImuContext>,
    settings: FusionSettings,
    profile: CalibrationProfile,
}

impl Fuser {
    pub fn new(
        ctx: Arc<ImuContext>,
        settings: FusionSettings,
        profile: CalibrationProfile,
    ) -> Self {
        Self {
            ctx,
            settings,
            profile,
        }
    }

    pub fn settings(&self) -> &FusionSettings {
        &self.settings
    }

    pub fn update_acceleration(&self) -> Result<(), SensorError> {
        let sensors = self.ctx.sensors();
        let accel = average_vector(self.settings.update_samples, || sensors.read_acceleration())?;
        let alpha = self.settings.smoothing;

        self.ctx.update(|state| {
            let previous = state.current.acceleration;
            let computed = accel - state.current.gravity;
            state.previous.acceleration = previous;
            state.current.acceleration = smooth(computed, previous, alpha);
        });
        Ok(())
    }

    pub fn update_attitude(&self, clock: &mut ElapsedClock) -> Result<(), SensorError> {
        let sensors = self.ctx.sensors();
        let samples = self.settings.update_samples;
        let rate =
            average_vector(samples, || sensors.read_rotation_rate())? - self.profile.gyro_bias;
        let accel = average_vector(samples, || sensors.read_acceleration())?;
        let dt = clock.tick();

        let magnitude = self.profile.gravity_magnitude;
        let settings = &self.settings;
        self.ctx.update(|state| {
            let previous = state.current.gravity;
            let gyro = gyro_gravity_estimate(previous, rate, dt, magnitude);
            let Some(fused) = fuse_gravity(
                gyro,
                accel_gravity_estimate(accel, magnitude),
                settings.gyro_weight,
                settings.accel_weight,
                magnitude,
            ) else {
                return;
            };
            state.previous.gravity = previous;
            state.current.gravity = smooth(fused, previous, settings.smoothing);
        });
        Ok(())
    }

    pub fn update_heading(&self) -> Result<(), SensorError> {
        let sensors = self.ctx.sensors();
        let field = average_vector(self.settings.update_samples, || sensors.read_magnetic_field())?;
        let computed = heading_from_field(field);
        let alpha = self.settings.smoothing;

        self.ctx.update(|state| {
            let previous = state.current.heading;
            state.previous.heading = previous;
            state.current.heading = smooth_heading(computed, previous, alpha);
        });
        Ok(())
    }

    pub fn update_altitude(&self) -> Result<(), SensorError> {
        let computed = self.ctx.sensors().read_altitude()?;
        let alpha = self.settings.smoothing;

        self.ctx.update(|state| {
            let previous = state.current.altitude;
            state.previous.altitude = previous;
            state.current.altitude = smooth(computed, previous, alpha);
        });
        Ok(())
    }

    fn step(&self, quantity: Quantity, clock: &mut ElapsedClock) -> Result<(), SensorError> {
        match quantity {
            Quantity::Acceleration => self.update_acceleration(),
            Quantity::Attitude => self.update_attitude(clock),
            Quantity::Heading => self.update_heading(),
            Quantity::Altitude => self.update_altitude(),
        }
    }
}

struct FusionTask {
    quantity: Quantity,
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Supervisor for the four periodic fusion threads.
///
/// Either all four tasks run or none do.
#[derive(Default)]
pub struct FusionEngine {
    tasks: Vec<FusionTask>,
}

impl FusionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawns one thread per quantity. A no-op if already running. Nothing
    /// is spawned if any rate is unusable, and if any spawn fails the tasks
    /// started so far are stopped again.
    pub fn start(&mut self, fuser: Fuser) -> Result<(), LifecycleError> {
        if self.is_running() {
            return Ok(());
        }

        let mut periods = Vec::with_capacity(Quantity::ALL.len());
        for quantity in Quantity::ALL {
            let rate_hz = fuser.settings.rate(quantity);
            let period = fuser
                .settings
                .period(quantity)
                .ok_or(LifecycleError::InvalidRate { quantity, rate_hz })?;
            periods.push((quantity, period));
        }

        for (quantity, period) in periods {
            let (stop_tx, stop_rx) = bounded(1);
            let task_fuser = fuser.clone();
            let spawned = thread::Builder::new()
                .name(format!("fusion-{quantity}"))
                .spawn(move || run_task(quantity, period, task_fuser, stop_rx));

            match spawned {
                Ok(handle) => self.tasks.push(FusionTask {
                    quantity,
                    stop_tx,
                    handle,
                }),
                Err(source) => {
                    if let Err(e) = self.stop() {
                        warn!(%e, "Rollback after failed spawn was incomplete");
                    }
                    return Err(LifecycleError::Spawn { quantity, source });
                }
            }
        }

        info!("Fusion tasks started");
        Ok(())
    }

    /// Signals every task and waits for each to exit. A task that panicked
    /// is reported but does not keep the others running.
    pub fn stop(&mut self) -> Result<(), LifecycleError> {
        if self.tasks.is_empty() {
            return Ok(());
        }

        let tasks: Vec<_> = self.tasks.drain(..).collect();
        for task in &tasks {
            // A full or disconnected channel means the task is already on its way out.
            let _ = task.stop_tx.try_send(());
        }

        let mut failed = Vec::new();
        for task in tasks {
            if task.handle.join().is_err() {
                warn!(quantity = %task.quantity, "Fusion task panicked");
                failed.push(task.quantity);
            }
        }

        info!("Fusion tasks stopped");
        if failed.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Stop { failed })
        }
    }
}

impl Drop for FusionEngine {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(%e, "Fusion engine dropped with failed tasks");
        }
    }
}

fn run_task(quantity: Quantity, period: Duration, fuser: Fuser, stop_rx: Receiver<()>) {
    let mut clock = ElapsedClock::default();
    debug!(%quantity, ?period, "Fusion task running");

    loop {
        match stop_rx.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if let Err(e) = fuser.step(quantity, &mut clock) {
            warn!(%quantity, %e, "Sensor read failed, keeping previous estimate");
        }
    }

    debug!(%quantity, "Fusion task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibrator;
    use crate::sensors::{Readings, SimulatedSensors};
    use approx::assert_relative_eq;

    fn calibrated(
        readings: Readings,
        settings: FusionSettings,
    ) -> (Arc<SimulatedSensors>, Arc<ImuContext>, Fuser) {
        let sensors = Arc::new(SimulatedSensors::new(readings));
        let ctx = Arc::new(ImuContext::new(sensors.clone()));
        let profile = Calibrator::new(20).calibrate(&ctx).unwrap();
        let fuser = Fuser::new(ctx.clone(), settings, profile);
        (sensors, ctx, fuser)
    }

    #[test]
    fn smoothing_disabled_is_exact() {
        let computed = DVec3::new(0.1, -0.7, 3.3);
        assert_eq!(smooth(computed, DVec3::splat(42.0), 1.0), computed);
        assert_eq!(smooth(0.3, 1e9, 1.0), 0.3);
        assert_relative_eq!(smooth(10.0, 0.0, 0.25), 2.5);
    }

    #[test]
    fn heading_wraps_along_short_arc() {
        assert_relative_eq!(smooth_heading(10.0, 350.0, 0.5), 0.0, epsilon = 1e-9);
        assert_relative_eq!(smooth_heading(350.0, 10.0, 0.25), 5.0, epsilon = 1e-9);
        assert_eq!(normalize_degrees(-90.0), 270.0);
        assert_eq!(normalize_degrees(-1e-20), 0.0);
    }

    #[test]
    fn heading_of_vertical_field_is_zero() {
        let h = heading_from_field(DVec3::new(0.0, 0.0, -0.5));
        assert_eq!(h, 0.0);
        assert_relative_eq!(heading_from_field(DVec3::new(0.0, 0.2, -0.4)), 90.0, epsilon = 1e-9);
        assert_relative_eq!(heading_from_field(DVec3::new(0.0, -0.2, -0.4)), 270.0, epsilon = 1e-9);
    }

    #[test]
    fn first_elapsed_is_zero() {
        let mut clock = ElapsedClock::default();
        let t0 = Instant::now();
        assert_eq!(clock.elapsed(t0), Duration::ZERO);
        assert_eq!(clock.elapsed(t0 + Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[test]
    fn roll_carries_gravity_to_body_y() {
        // Rolling +90 degrees about X puts the body's +Y axis on the sky.
        let second = Duration::from_secs(1);
        let g = gyro_gravity_estimate(DVec3::Z, DVec3::new(90.0, 0.0, 0.0), second, 1.0);
        assert_relative_eq!(g.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(g.y, 1.0, epsilon = 1e-9);
        assert_relative_eq!(g.z, 0.0, epsilon = 1e-9);

        // Yaw leaves a vertical gravity vector alone.
        let g = gyro_gravity_estimate(DVec3::Z, DVec3::new(0.0, 0.0, 45.0), second, 1.0);
        assert_relative_eq!(g.z, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn zero_accelerometer_falls_back_to_gyro() {
        assert_eq!(accel_gravity_estimate(DVec3::ZERO, 1.0), None);
        let gyro = DVec3::new(0.0, 0.6, 0.8);
        let fused = fuse_gravity(gyro, None, 0.9, 0.1, 1.0).unwrap();
        assert_relative_eq!(fused.y, 0.6, epsilon = 1e-12);
        assert_eq!(fuse_gravity(DVec3::Z, Some(-DVec3::Z), 0.5, 0.5, 1.0), None);
    }

    #[test]
    fn fused_gravity_keeps_calibrated_magnitude() {
        let fused = fuse_gravity(DVec3::Z, Some(DVec3::X), 0.9, 0.1, 9.81).unwrap();
        assert_relative_eq!(fused.length(), 9.81, epsilon = 1e-9);
        assert!(fused.z > fused.x);
    }

    #[test]
    fn settings_validation() {
        assert!(FusionSettings::default().validate().is_ok());
        let bad_rate = FusionSettings {
            heading_hz: 0.0,
            ..Default::default()
        };
        assert!(bad_rate.validate().is_err());
        let bad_weights = FusionSettings {
            gyro_weight: 0.8,
            ..Default::default()
        };
        assert!(bad_weights.validate().is_err());
        let bad_smoothing = FusionSettings {
            smoothing: 0.0,
            ..Default::default()
        };
        assert!(bad_smoothing.validate().is_err());

        // Positive, but the period does not fit a Duration.
        let glacial = FusionSettings {
            altitude_hz: 1e-20,
            ..Default::default()
        };
        assert!(matches!(glacial.validate(), Err(ImuError::InvalidSettings(_))));
        assert_eq!(glacial.period(Quantity::Altitude), None);
        assert_eq!(
            FusionSettings::default().period(Quantity::Altitude),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn stationary_estimate_converges_in_100_cycles() {
        let (_sensors, ctx, fuser) = calibrated(Readings::default(), FusionSettings::default());

        // Start from a badly tilted estimate.
        ctx.update(|s| s.current.gravity = DVec3::new(0.6, 0.0, 0.8));

        let mut clock = ElapsedClock::default();
        for _ in 0..100 {
            fuser.update_attitude(&mut clock).unwrap();
            fuser.update_acceleration().unwrap();
        }

        let o = ctx.snapshot();
        assert_relative_eq!(o.gravity.x, 0.0, epsilon = 1e-3);
        assert_relative_eq!(o.gravity.y, 0.0, epsilon = 1e-3);
        assert_relative_eq!(o.gravity.z, 1.0, epsilon = 1e-3);
        assert_relative_eq!(o.acceleration.length(), 0.0, epsilon = 1e-3);
    }

    #[test]
    fn failed_read_keeps_previous_estimate() {
        let (sensors, ctx, fuser) = calibrated(Readings::default(), FusionSettings::default());
        let before = ctx.state();

        sensors.set_failing(true);
        assert!(fuser.update_acceleration().is_err());
        assert!(fuser.update_attitude(&mut ElapsedClock::default()).is_err());
        assert!(fuser.update_heading().is_err());
        assert!(fuser.update_altitude().is_err());

        let after = ctx.state();
        assert_eq!(after.current, before.current);
        assert_eq!(after.previous, before.previous);
    }

    #[test]
    fn altitude_is_smoothed() {
        let settings = FusionSettings {
            smoothing: 0.5,
            ..Default::default()
        };
        let (sensors, ctx, fuser) = calibrated(Readings::default(), settings);
        sensors.set_readings(Readings {
            altitude: 10.0,
            ..Readings::default()
        });

        fuser.update_altitude().unwrap();
        let state = ctx.state();
        assert_eq!(state.previous.altitude, 0.0);
        assert_relative_eq!(state.current.altitude, 5.0);
    }

    #[test]
    fn engine_refuses_unusable_rate_before_spawning() {
        let settings = FusionSettings {
            altitude_hz: 1e-20,
            ..Default::default()
        };
        let (_sensors, _ctx, fuser) = calibrated(Readings::default(), settings);

        let mut engine = FusionEngine::new();
        assert!(matches!(
            engine.start(fuser),
            Err(LifecycleError::InvalidRate { quantity: Quantity::Altitude, .. })
        ));
        assert!(!engine.is_running());
    }

    #[test]
    fn engine_starts_and_stops_all_tasks() {
        let settings = FusionSettings {
            acceleration_hz: 1000.0,
            attitude_hz: 1000.0,
            heading_hz: 1000.0,
            altitude_hz: 1000.0,
            ..Default::default()
        };
        let (sensors, _ctx, fuser) = calibrated(Readings::default(), settings);

        let mut engine = FusionEngine::new();
        engine.start(fuser.clone()).unwrap();
        assert!(engine.is_running());
        // Starting twice keeps the first four tasks.
        engine.start(fuser).unwrap();
        assert_eq!(engine.tasks.len(), 4);

        let before = sensors.read_count();
        thread::sleep(Duration::from_millis(50));
        assert!(sensors.read_count() > before);

        engine.stop().unwrap();
        assert!(!engine.is_running());
        let stopped_at = sensors.read_count();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sensors.read_count(), stopped_at);
    }
}
