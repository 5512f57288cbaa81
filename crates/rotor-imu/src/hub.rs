use crate::calibration::Calibrator;
use crate::fusion::{period_for, FusionEngine, FusionSettings, Fuser, LifecycleError};
use crate::types::{CalibrationProfile, Orientation};
use crate::{ImuContext, ImuError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a listener wants after receiving a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ListenerControl {
    /// Keep the current rate.
    Continue,
    /// Switch to a new delivery rate in Hz.
    Reschedule(f64),
    /// Unsubscribe and end the delivery loop.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImuSettings {
    /// Samples per calibration phase (the gyro phase takes twice as many).
    pub calibration_samples: usize,
    pub max_listeners: usize,
    pub fusion: FusionSettings,
}

impl Default for ImuSettings {
    fn default() -> Self {
        Self {
            calibration_samples: 1000,
            max_listeners: 10,
            fusion: FusionSettings::default(),
        }
    }
}

struct Listener {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Everything the listener count decides, behind one lock so that starting
/// or stopping fusion can never race a concurrent subscribe.
struct Lifecycle {
    listeners: HashMap<SubscriptionId, Listener>,
    engine: FusionEngine,
    next_id: u64,
}

struct HubInner {
    ctx: Arc<ImuContext>,
    settings: ImuSettings,
    lifecycle: Mutex<Lifecycle>,
}

/// Fans orientation snapshots out to listeners at their own rates.
///
/// The first subscription calibrates (once per session) and starts the
/// fusion tasks; the last unsubscription stops them again.
pub struct ObserverHub {
    inner: Arc<HubInner>,
}

impl ObserverHub {
    pub fn new(ctx: Arc<ImuContext>, settings: ImuSettings) -> Result<Self, ImuError> {
        settings.fusion.validate()?;
        if settings.max_listeners == 0 {
            return Err(ImuError::InvalidSettings("max_listeners must be at least 1".into()));
        }
        if settings.calibration_samples == 0 {
            return Err(ImuError::InvalidSettings("calibration_samples must be at least 1".into()));
        }

        Ok(Self {
            inner: Arc::new(HubInner {
                ctx,
                settings,
                lifecycle: Mutex::new(Lifecycle {
                    listeners: HashMap::new(),
                    engine: FusionEngine::new(),
                    next_id: 1,
                }),
            }),
        })
    }

    pub fn context(&self) -> &Arc<ImuContext> {
        &self.inner.ctx
    }

    /// Runs a fresh calibration. Only allowed while nobody is subscribed, so
    /// it can never overlap running fusion tasks.
    pub fn calibrate_sensors(&self) -> Result<CalibrationProfile, ImuError> {
        let lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.listeners.is_empty() {
            return Err(ImuError::CalibrationWhileRunning {
                listeners: lifecycle.listeners.len(),
            });
        }
        Ok(self.inner.calibrator().calibrate(&self.inner.ctx)?)
    }

    /// Registers `callback` to receive a snapshot every `1 / rate_hz` seconds.
    ///
    /// The callback runs on its own thread without holding any lock. Its
    /// return value decides whether delivery continues, changes rate or ends.
    pub fn subscribe<F>(&self, rate_hz: f64, callback: F) -> Result<SubscriptionId, ImuError>
    where
        F: FnMut(&Orientation) -> ListenerControl + Send + 'static,
    {
        let period = period_for(rate_hz).ok_or(ImuError::InvalidRate(rate_hz))?;
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock();

        let max = inner.settings.max_listeners;
        if lifecycle.listeners.len() >= max {
            return Err(ImuError::TooManyListeners { max });
        }

        let first = lifecycle.listeners.is_empty();
        if first {
            let profile = match inner.ctx.profile() {
                Some(profile) => profile,
                None => inner.calibrator().calibrate(&inner.ctx)?,
            };
            let fuser = Fuser::new(inner.ctx.clone(), inner.settings.fusion.clone(), profile);
            lifecycle.engine.start(fuser)?;
        }

        let id = SubscriptionId(lifecycle.next_id);
        let (stop_tx, stop_rx) = bounded(1);
        let hub = Arc::downgrade(inner);
        let ctx = inner.ctx.clone();
        let spawned = thread::Builder::new()
            .name(format!("imu-listener-{}", id.0))
            .spawn(move || deliver(hub, ctx, id, period, stop_rx, callback));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                if first {
                    if let Err(stop_err) = lifecycle.engine.stop() {
                        warn!(%stop_err, "Failed to roll back fusion start");
                    }
                }
                return Err(LifecycleError::SpawnListener(e).into());
            }
        };

        lifecycle.next_id += 1;
        lifecycle.listeners.insert(id, Listener { stop_tx, handle });
        info!(%id, rate_hz, listeners = lifecycle.listeners.len(), "Listener subscribed");
        Ok(id)
    }

    /// Ends delivery to `id` and waits for its thread. Safe to call from the
    /// listener's own callback.
    ///
    /// When this was the last listener the fusion tasks are stopped too, and
    /// a task that did not stop cleanly is reported here. The listener is
    /// removed either way.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ImuError> {
        let (listener, stopped) = self.inner.release(id)?;
        let _ = listener.stop_tx.try_send(());
        join_listener(id, listener.handle);
        Ok(stopped?)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lifecycle.lock().listeners.len()
    }

    /// Whether the fusion tasks are running.
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().engine.is_running()
    }

    /// Stops every listener and the fusion tasks.
    pub fn shutdown(&self) -> Result<(), ImuError> {
        let (listeners, stopped) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            let listeners: Vec<_> = lifecycle.listeners.drain().collect();
            for (_, listener) in &listeners {
                let _ = listener.stop_tx.try_send(());
            }
            (listeners, lifecycle.engine.stop())
        };

        // Joined outside the lock: a listener may be waiting on it to
        // release itself.
        let count = listeners.len();
        for (id, listener) in listeners {
            join_listener(id, listener.handle);
        }
        if count > 0 {
            info!(listeners = count, "Observer hub shut down");
        }
        Ok(stopped?)
    }
}

impl Drop for ObserverHub {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(%e, "Observer hub shutdown incomplete");
        }
    }
}

impl HubInner {
    fn calibrator(&self) -> Calibrator {
        Calibrator::new(self.settings.calibration_samples)
    }

    /// Removes `id` from the registry and stops fusion if it was the last
    /// listener. The caller owns the returned thread and the outcome of
    /// stopping fusion.
    fn release(
        &self,
        id: SubscriptionId,
    ) -> Result<(Listener, Result<(), LifecycleError>), ImuError> {
        let mut lifecycle = self.lifecycle.lock();
        let listener = lifecycle
            .listeners
            .remove(&id)
            .ok_or(ImuError::UnknownSubscription(id))?;
        let remaining = lifecycle.listeners.len();
        info!(%id, listeners = remaining, "Listener unsubscribed");

        let stopped = if remaining == 0 {
            // Every task is stopped even if one of them failed.
            lifecycle.engine.stop().inspect_err(|e| {
                warn!(%e, "Fusion engine did not stop cleanly");
            })
        } else {
            Ok(())
        };
        Ok((listener, stopped))
    }
}

fn join_listener(id: SubscriptionId, handle: JoinHandle<()>) {
    // A listener unsubscribing itself cannot wait for its own thread; it
    // exits on the stop signal once the callback returns.
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!(%id, "Listener thread panicked");
    }
}

fn deliver<F>(
    hub: Weak<HubInner>,
    ctx: Arc<ImuContext>,
    id: SubscriptionId,
    mut period: Duration,
    stop_rx: Receiver<()>,
    mut callback: F,
) where
    F: FnMut(&Orientation) -> ListenerControl,
{
    loop {
        match stop_rx.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }

        let snapshot = ctx.snapshot();
        let Ok(control) = panic::catch_unwind(AssertUnwindSafe(|| callback(&snapshot))) else {
            warn!(%id, "Listener callback panicked, unsubscribing");
            break;
        };
        match control {
            ListenerControl::Continue => {}
            ListenerControl::Reschedule(rate_hz) => match period_for(rate_hz) {
                Some(new_period) => {
                    debug!(%id, rate_hz, "Listener rescheduled");
                    period = new_period;
                }
                None => warn!(%id, rate_hz, "Ignoring invalid listener rate"),
            },
            ListenerControl::Stop => break,
        }
    }

    let Some(hub) = hub.upgrade() else {
        return;
    };
    match hub.release(id) {
        // Dropping our own handle detaches this thread, which is about to
        // exit. A failed fusion stop was already logged by `release`.
        Ok((_listener, _stopped)) => {}
        Err(ImuError::UnknownSubscription(_)) => {
            debug!(%id, "Listener already removed");
        }
        Err(e) => warn!(%id, %e, "Failed to release listener"),
    }
}
