use approx::assert_relative_eq;
use glam::DVec3;
use rotor_imu::{
    FusionSettings, ImuContext, ImuError, ImuSettings, ListenerControl, ObserverHub, Orientation,
    Readings, SimulatedSensors,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn settings(max_listeners: usize) -> ImuSettings {
    ImuSettings {
        calibration_samples: 20,
        max_listeners,
        fusion: FusionSettings {
            acceleration_hz: 400.0,
            attitude_hz: 400.0,
            heading_hz: 400.0,
            altitude_hz: 400.0,
            ..Default::default()
        },
    }
}

fn setup(max_listeners: usize) -> (Arc<SimulatedSensors>, ObserverHub) {
    let sensors = Arc::new(SimulatedSensors::default());
    let ctx = Arc::new(ImuContext::new(sensors.clone()));
    let hub = ObserverHub::new(ctx, settings(max_listeners)).unwrap();
    (sensors, hub)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn listeners_stopping_themselves_idle_the_engine() {
    let (sensors, hub) = setup(10);
    let delivered = Arc::new(AtomicUsize::new(0));

    let subscribers: Vec<_> = (0..6)
        .map(|i| {
            let delivered = delivered.clone();
            let mut seen = 0;
            hub.subscribe(100.0 + i as f64 * 50.0, move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
                seen += 1;
                if seen == 3 {
                    ListenerControl::Stop
                } else {
                    ListenerControl::Continue
                }
            })
            .unwrap()
        })
        .collect();
    assert_eq!(subscribers.len(), 6);

    assert!(wait_until(Duration::from_secs(5), || hub.listener_count() == 0));
    assert!(wait_until(Duration::from_secs(5), || !hub.is_running()));
    assert_eq!(delivered.load(Ordering::SeqCst), 18);

    // With no listener left, nothing samples the sensors or touches the record.
    let reads = sensors.read_count();
    let snapshot = hub.context().state();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sensors.read_count(), reads);
    assert_eq!(hub.context().state().current, snapshot.current);
}

#[test]
fn concurrent_subscribers_share_one_engine() {
    let (_sensors, hub) = setup(10);
    let hub = Arc::new(hub);

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let hub = hub.clone();
            thread::spawn(move || hub.subscribe(250.0, |_| ListenerControl::Continue).unwrap())
        })
        .collect();
    let ids: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(hub.listener_count(), 8);
    assert!(hub.is_running());

    for id in ids {
        hub.unsubscribe(id).unwrap();
    }
    assert_eq!(hub.listener_count(), 0);
    assert!(!hub.is_running());
}

#[test]
fn over_limit_subscription_leaves_existing_listeners_alone() {
    let (_sensors, hub) = setup(2);
    let counts: Vec<_> = (0..2).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    let ids: Vec<_> = counts
        .iter()
        .map(|count| {
            let count = count.clone();
            hub.subscribe(200.0, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                ListenerControl::Continue
            })
            .unwrap()
        })
        .collect();

    let rejected = hub.subscribe(200.0, |_| ListenerControl::Continue);
    assert!(matches!(rejected, Err(ImuError::TooManyListeners { max: 2 })));
    assert_eq!(hub.listener_count(), 2);
    assert!(hub.is_running());

    let before: Vec<_> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert!(wait_until(Duration::from_secs(5), || {
        counts
            .iter()
            .zip(&before)
            .all(|(c, b)| c.load(Ordering::SeqCst) > *b)
    }));

    for id in ids {
        hub.unsubscribe(id).unwrap();
    }
}

#[test]
fn reschedule_changes_delivery_rate() {
    let (_sensors, hub) = setup(10);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let id = hub
        .subscribe(500.0, move |_| {
            // First delivery slows the listener down to once every two seconds.
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ListenerControl::Reschedule(0.5)
            } else {
                ListenerControl::Continue
            }
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 1));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    hub.unsubscribe(id).unwrap();
}

#[test]
fn invalid_reschedule_is_ignored() {
    let (_sensors, hub) = setup(10);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let id = hub
        .subscribe(200.0, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ListenerControl::Reschedule(-1.0)
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 5));
    hub.unsubscribe(id).unwrap();
}

#[test]
fn stationary_vehicle_converges_through_the_hub() {
    let level = Readings {
        acceleration: DVec3::new(0.0, 0.0, 1.0),
        rotation_rate: DVec3::ZERO,
        magnetic_field: DVec3::new(0.2, 0.0, -0.35),
        altitude: 3.0,
    };
    // Calibrated while tilted, so the primed estimate starts tilted too.
    let sensors = Arc::new(SimulatedSensors::new(Readings {
        acceleration: DVec3::new(0.0, 0.6, 0.8),
        ..level
    }));
    let ctx = Arc::new(ImuContext::new(sensors.clone()));
    let hub = ObserverHub::new(ctx.clone(), settings(10)).unwrap();
    hub.calibrate_sensors().unwrap();
    assert_relative_eq!(ctx.snapshot().gravity.y, 0.6, epsilon = 1e-9);

    // Level the vehicle and let fusion pull the estimate back.
    sensors.set_readings(level);

    let latest = Arc::new(Mutex::new(None::<Orientation>));
    let sink = latest.clone();
    let id = hub
        .subscribe(100.0, move |o| {
            *sink.lock() = Some(*o);
            ListenerControl::Continue
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        let o = ctx.snapshot();
        (o.gravity - DVec3::Z).length() < 1e-3 && o.acceleration.length() < 1e-3
    }));
    hub.unsubscribe(id).unwrap();

    let o = ctx.snapshot();
    assert_relative_eq!(o.gravity.z, 1.0, epsilon = 1e-3);
    assert_relative_eq!(o.heading, 0.0, epsilon = 1e-9);
    assert_relative_eq!(o.altitude, 3.0, epsilon = 1e-9);
    assert!(latest.lock().is_some());
}
