//! Reconnecting wrapper around any actuator.
//!
//! The wrapper owns a connector that can build a fresh link. It probes the
//! link at construction, pings it when it has been idle too long, and on a
//! link fault reconnects exactly once and retries the failed command once.
//! A failed reconnect leaves the wrapper lost: every later call returns
//! [`ActuatorError::ReconnectFailed`] without touching the connector again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ActuatorInfo, Point};
use crate::io::actuator::{Actuator, ActuatorError};

pub type Connector = Box<dyn Fn() -> Result<Arc<dyn Actuator>, ActuatorError> + Send + Sync>;

struct Link {
    current: Option<Arc<dyn Actuator>>,
    last_ok: Instant,
    lost: Option<String>,
}

pub struct ReliableActuator {
    connect: Connector,
    link: Mutex<Link>,
    info: ActuatorInfo,
    health_interval: Duration,
    abort_generation: AtomicU64,
    reconnects: AtomicU32,
}

impl ReliableActuator {
    /// Connect and probe. Any failure here is `DeviceUnavailable`.
    #[instrument(skip_all, fields(health_interval_ms = health_interval.as_millis() as u64))]
    pub fn new(connect: Connector, health_interval: Duration) -> Result<Self, ActuatorError> {
        let actuator = connect().map_err(|err| ActuatorError::DeviceUnavailable(err.to_string()))?;
        actuator
            .ping()
            .map_err(|err| ActuatorError::DeviceUnavailable(format!("liveness probe: {err}")))?;
        let info = actuator.info();
        info!(kind = %info.kind, device = ?info.device, "actuator connected");
        Ok(Self {
            connect,
            link: Mutex::new(Link {
                current: Some(actuator),
                last_ok: Instant::now(),
                lost: None,
            }),
            info,
            health_interval,
            abort_generation: AtomicU64::new(0),
            reconnects: AtomicU32::new(0),
        })
    }

    /// Number of reconnect attempts made so far.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn current(&self) -> Result<Arc<dyn Actuator>, ActuatorError> {
        let link = self.link.lock();
        if let Some(reason) = &link.lost {
            return Err(ActuatorError::ReconnectFailed(reason.clone()));
        }
        link.current
            .clone()
            .ok_or_else(|| ActuatorError::ReconnectFailed("link is reconnecting".to_string()))
    }

    fn mark_ok(&self) {
        self.link.lock().last_ok = Instant::now();
    }

    fn ensure_healthy(&self, actuator: &dyn Actuator) -> Result<(), ActuatorError> {
        let idle = self.link.lock().last_ok.elapsed();
        if idle <= self.health_interval {
            return Ok(());
        }
        debug!(idle_ms = idle.as_millis() as u64, "health ping");
        actuator.ping()
    }

    fn reconnect(&self, cause: &ActuatorError) -> Result<Arc<dyn Actuator>, ActuatorError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        warn!(cause = %cause, "link fault, reconnecting");
        self.link.lock().current = None;

        let fresh = (self.connect)().and_then(|actuator| {
            actuator.ping()?;
            Ok(actuator)
        });
        let mut link = self.link.lock();
        match fresh {
            Ok(actuator) => {
                info!("actuator reconnected");
                link.current = Some(Arc::clone(&actuator));
                link.last_ok = Instant::now();
                Ok(actuator)
            }
            Err(err) => {
                let reason = format!("{err} (after {cause})");
                warn!(reason = %reason, "reconnect failed, actuator lost");
                link.lost = Some(reason.clone());
                Err(ActuatorError::ReconnectFailed(reason))
            }
        }
    }

    fn call<T>(
        &self,
        op: impl Fn(&dyn Actuator) -> Result<T, ActuatorError>,
    ) -> Result<T, ActuatorError> {
        let generation = self.abort_generation.load(Ordering::SeqCst);
        let actuator = self.current()?;
        let err = match self
            .ensure_healthy(actuator.as_ref())
            .and_then(|()| op(actuator.as_ref()))
        {
            Ok(value) => {
                self.mark_ok();
                return Ok(value);
            }
            Err(err) => err,
        };
        // A command cut short by abort is not a link fault.
        if self.abort_generation.load(Ordering::SeqCst) != generation {
            debug!(err = %err, "command ended after abort");
            return Err(ActuatorError::Aborted);
        }
        if !err.is_link_fault() {
            return Err(err);
        }
        let fresh = self.reconnect(&err)?;
        let value = op(fresh.as_ref())?;
        self.mark_ok();
        Ok(value)
    }
}

impl Actuator for ReliableActuator {
    fn info(&self) -> ActuatorInfo {
        self.info.clone()
    }

    fn ping(&self) -> Result<(), ActuatorError> {
        self.call(|a| a.ping())
    }

    fn home(&self) -> Result<(), ActuatorError> {
        self.call(|a| a.home())
    }

    fn move_to(&self, point: Point) -> Result<(), ActuatorError> {
        self.call(|a| a.move_to(point))
    }

    fn click(&self) -> Result<(), ActuatorError> {
        self.call(|a| a.click())
    }

    fn double_click(&self) -> Result<(), ActuatorError> {
        self.call(|a| a.double_click())
    }

    fn key_chord(&self, chord: &str) -> Result<(), ActuatorError> {
        self.call(|a| a.key_chord(chord))
    }

    fn type_text(&self, text: &str) -> Result<(), ActuatorError> {
        self.call(|a| a.type_text(text))
    }

    fn sleep_ms(&self, ms: u64) -> Result<(), ActuatorError> {
        self.call(|a| a.sleep_ms(ms))
    }

    /// Reaches the live link without waiting for the in-flight command.
    fn abort(&self) -> Result<(), ActuatorError> {
        self.abort_generation.fetch_add(1, Ordering::SeqCst);
        let current = self.link.lock().current.clone();
        match current {
            Some(actuator) => actuator.abort(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::test_support::{Call, RecordingActuator};

    fn counting_connector(
        links: Vec<Result<Arc<RecordingActuator>, ()>>,
    ) -> (Connector, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let links = Mutex::new(links.into_iter());
        let connector: Connector = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            match links.lock().next() {
                Some(Ok(actuator)) => Ok(actuator as Arc<dyn Actuator>),
                _ => Err(ActuatorError::DeviceUnavailable("no device".to_string())),
            }
        });
        (connector, calls)
    }

    #[test]
    fn construction_probe_failure_is_device_unavailable() {
        let dead = RecordingActuator::new();
        dead.fail_link(true);
        let (connector, _) = counting_connector(vec![Ok(dead)]);
        let err = ReliableActuator::new(connector, Duration::from_secs(2))
            .err()
            .expect("unavailable");
        assert!(matches!(err, ActuatorError::DeviceUnavailable(_)));
    }

    #[test]
    fn link_fault_reconnects_once_and_retries() {
        let first = RecordingActuator::new();
        let second = RecordingActuator::new();
        let (connector, connects) =
            counting_connector(vec![Ok(Arc::clone(&first)), Ok(Arc::clone(&second))]);
        let reliable = ReliableActuator::new(connector, Duration::from_secs(60)).expect("connect");

        first.fail_link(true);
        reliable.click().expect("click after reconnect");
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(reliable.reconnect_count(), 1);
        assert_eq!(second.calls(), vec![Call::Ping, Call::Click]);
    }

    /// One reconnect attempt only; afterwards the wrapper stays lost.
    #[test]
    fn failed_reconnect_is_fatal_and_sticky() {
        let first = RecordingActuator::new();
        let (connector, connects) = counting_connector(vec![Ok(Arc::clone(&first))]);
        let reliable = ReliableActuator::new(connector, Duration::from_secs(60)).expect("connect");

        first.fail_link(true);
        let err = reliable.type_text("kick").expect_err("lost");
        assert!(err.is_fatal(), "{err:?}");
        let err = reliable.click().expect_err("still lost");
        assert!(err.is_fatal(), "{err:?}");
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(reliable.reconnect_count(), 1);
    }

    #[test]
    fn device_reported_failures_do_not_reconnect() {
        let first = RecordingActuator::new();
        first.fail_verb("key_chord", "unknown chord");
        let (connector, connects) = counting_connector(vec![Ok(Arc::clone(&first))]);
        let reliable = ReliableActuator::new(connector, Duration::from_secs(60)).expect("connect");

        let err = reliable.key_chord("HYPER+Q").expect_err("fails");
        assert!(matches!(err, ActuatorError::CommandFailed { .. }));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_link_is_pinged_before_the_next_command() {
        let first = RecordingActuator::new();
        let (connector, _) = counting_connector(vec![Ok(Arc::clone(&first))]);
        let reliable = ReliableActuator::new(connector, Duration::ZERO).expect("connect");
        std::thread::sleep(Duration::from_millis(5));
        reliable.home().expect("home");
        assert_eq!(first.calls(), vec![Call::Ping, Call::Ping, Call::Home]);
    }

    #[test]
    fn abort_reaches_current_link() {
        let first = RecordingActuator::new();
        let (connector, _) = counting_connector(vec![Ok(Arc::clone(&first))]);
        let reliable = ReliableActuator::new(connector, Duration::from_secs(60)).expect("connect");
        reliable.abort().expect("abort");
        assert_eq!(first.calls(), vec![Call::Ping, Call::Abort]);
    }
}
