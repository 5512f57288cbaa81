use anyhow::Result;
use parking_lot::Mutex;
use rotor_config::{AppConfig, EscConfig, FlightConfig, ImuConfig, TopologyConfig};
use rotor_imu::{
    FusionSettings, ImuContext, ImuSettings, ListenerControl, ObserverHub, Orientation,
    SimulatedSensors,
};
use rotor_motor::{
    AxisMotors, EscMotorDriver, EscProfile, MotionController, MotorTopology, SimulatedPwm,
    TopologyError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

type Controller = MotionController<EscMotorDriver<SimulatedPwm>>;

/// Channels on the simulated PWM chip.
const PWM_CHANNELS: usize = 16;

fn imu_settings(config: &ImuConfig) -> ImuSettings {
    ImuSettings {
        calibration_samples: config.calibration_samples,
        max_listeners: config.max_listeners,
        fusion: FusionSettings {
            update_samples: config.update_samples,
            acceleration_hz: config.acceleration_hz,
            attitude_hz: config.attitude_hz,
            heading_hz: config.heading_hz,
            altitude_hz: config.altitude_hz,
            smoothing: config.smoothing,
            gyro_weight: config.gyro_weight,
            accel_weight: config.accel_weight,
        },
    }
}

fn esc_profile(config: &EscConfig) -> EscProfile {
    EscProfile {
        arming_duty: config.arming_duty,
        min_duty: config.min_duty,
        max_duty: config.max_duty,
        arming_delay: Duration::from_millis(config.arming_delay_ms),
        calibration_high_duty: config.calibration_high_duty,
        calibration_low_duty: config.calibration_low_duty,
        calibration_high_hold: Duration::from_millis(config.calibration_high_hold_ms),
        calibration_low_hold: Duration::from_millis(config.calibration_low_hold_ms),
    }
}

fn topology(config: &TopologyConfig) -> Result<MotorTopology, TopologyError> {
    MotorTopology::new(
        config.motor_count,
        AxisMotors::new(&config.pos_x, &config.neg_x),
        AxisMotors::new(&config.pos_y, &config.neg_y),
        AxisMotors::new(&config.pos_z, &config.neg_z),
        AxisMotors::new(&config.spin_pos, &config.spin_neg),
    )
}

/// Flight logic fed by the observer hub.
///
/// Reports at the idle rate until the hover command is accepted, then
/// switches to the in-flight rate.
struct FlightListener {
    controller: Arc<Mutex<Controller>>,
    config: FlightConfig,
    in_flight: bool,
    deliveries: u64,
}

impl FlightListener {
    fn on_orientation(&mut self, orientation: &Orientation) -> ListenerControl {
        self.deliveries += 1;

        if self.in_flight {
            // Roughly once per second at the in-flight rate.
            let every = self.config.in_flight_rate_hz.max(1.0) as u64;
            if self.deliveries % every == 0 {
                info!(%orientation, "In flight");
            }
            return ListenerControl::Continue;
        }

        info!(%orientation, "On the ground");
        match self.controller.lock().set_linear(self.config.hover) {
            Ok(thrust) => {
                info!(thrust = ?thrust.as_slice(), "Hover engaged");
                self.in_flight = true;
                ListenerControl::Reschedule(self.config.in_flight_rate_hz)
            }
            Err(e) => {
                warn!(%e, "Hover command rejected, staying on the ground");
                ListenerControl::Continue
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rotor_app=info,rotor_imu=info,rotor_motor=info".into()),
        )
        .init();

    info!("Rotor flight core starting");

    // Load config.
    let config = rotor_config::load_config().unwrap_or_else(|e| {
        warn!(?e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // No hardware sensor gateway in this build.
    warn!("Sensor hardware not available, using simulated sensors");
    let sensors = Arc::new(SimulatedSensors::default());
    let ctx = Arc::new(ImuContext::new(sensors));
    let hub = ObserverHub::new(ctx, imu_settings(&config.imu))?;
    hub.calibrate_sensors()?;

    let driver = EscMotorDriver::new(
        SimulatedPwm::new(PWM_CHANNELS),
        esc_profile(&config.motors.esc),
        config.motors.channels.clone(),
    );
    let controller = Arc::new(Mutex::new(MotionController::new(
        driver,
        topology(&config.motors.topology)?,
    )?));

    let mut flight = FlightListener {
        controller: controller.clone(),
        config: config.flight.clone(),
        in_flight: false,
        deliveries: 0,
    };
    let id = hub.subscribe(config.flight.idle_rate_hz, move |o| flight.on_orientation(o))?;
    info!(%id, "Flight logic subscribed, press Ctrl-C to land");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Err(e) = hub.shutdown() {
        warn!(%e, "Observer hub did not shut down cleanly");
    }
    if let Err(e) = controller.lock().stop() {
        warn!(%e, "Failed to idle motors");
    }
    Ok(())
}
