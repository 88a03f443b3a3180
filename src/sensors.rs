// sensors — contracts for the three external collaborators (sensor hub,
// motor controller, RC bus) and the simulated implementations used by tests
// and replay runs. The flight code only ever sees the traits.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::warn;
use thiserror::Error;

use crate::types::{RcFrame, SensorEvent};

// ─── Sensor client ───────────────────────────────────────────────────────────

pub trait SensorClient: Send {
    /// Blocking read of the next event. Returns `None` when the timeout
    /// elapses or the client has shut down; the caller treats both as "no
    /// event this cycle" so thread joins stay bounded.
    fn recv(&mut self, timeout: Duration) -> Option<SensorEvent>;
}

/// Channel-backed sensor client. The feed half is handed to whatever
/// produces events (a driver shim, or a test scenario).
pub struct ChannelSensors {
    rx: Receiver<SensorEvent>,
}

#[derive(Clone)]
pub struct SensorFeed {
    tx: Sender<SensorEvent>,
}

impl ChannelSensors {
    pub fn pair(capacity: usize) -> (SensorFeed, ChannelSensors) {
        let (tx, rx) = bounded(capacity);
        (SensorFeed { tx }, ChannelSensors { rx })
    }
}

impl SensorFeed {
    /// Push an event; a full channel drops the sample (the filter widens its
    /// own covariance over the larger timestep).
    pub fn push(&self, evt: SensorEvent) {
        if self.tx.try_send(evt).is_err() {
            warn!("sensors: event queue full, sample dropped");
        }
    }
}

impl SensorClient for ChannelSensors {
    fn recv(&mut self, timeout: Duration) -> Option<SensorEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(evt) => Some(evt),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Replays a recorded session: one JSON `SensorEvent` per line. Events are
/// handed out in file order on demand; inter-event pacing is the caller's
/// business.
pub struct ReplaySensors {
    lines: std::io::Lines<BufReader<File>>,
}

impl ReplaySensors {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self { lines: BufReader::new(file).lines() })
    }
}

impl SensorClient for ReplaySensors {
    fn recv(&mut self, _timeout: Duration) -> Option<SensorEvent> {
        for line in self.lines.by_ref() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("sensors: replay read error: {}", e);
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(evt) => return Some(evt),
                Err(e) => warn!("sensors: skipping malformed replay line: {}", e),
            }
        }
        None
    }
}

// ─── Motor controller ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArmMode {
    /// Silent arming used by the supervisor.
    Auto,
    /// Arming with ESC calibration beeps, for bench use.
    User,
}

/// Ramp rate of the underlying ESC driver. The control loop always uses
/// `Instant`; the slower tempos exist for ground tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleTempo {
    Instant,
    High,
    Low,
}

#[derive(Debug, Error)]
pub enum MotorError {
    #[error("motor controller is disarmed")]
    Disarmed,
    #[error("motor index {0} out of range")]
    BadIndex(usize),
    #[error("device error: {0}")]
    Device(String),
}

pub trait MotorController: Send {
    fn arm(&mut self, mode: ArmMode) -> Result<(), MotorError>;
    fn disarm(&mut self) -> Result<(), MotorError>;
    fn is_armed(&self) -> bool;

    /// Set one motor's duty fraction in [0, 1]. Must fail (not silently
    /// drop) when the controller is disarmed.
    fn set_throttle(
        &mut self,
        motor: usize,
        duty: f64,
        tempo: ThrottleTempo,
    ) -> Result<(), MotorError>;
}

/// Recording mock: remembers armed state and every duty write. Shared
/// handles let a test assert on outputs while the control thread owns the
/// controller.
#[derive(Clone, Default)]
pub struct MockMotors {
    inner: Arc<Mutex<MockMotorState>>,
}

#[derive(Default)]
struct MockMotorState {
    armed: bool,
    duty: [f64; 4],
    writes: u64,
    arm_count: u32,
    disarm_count: u32,
}

impl MockMotors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duty(&self) -> [f64; 4] {
        self.inner.lock().unwrap().duty
    }

    pub fn write_count(&self) -> u64 {
        self.inner.lock().unwrap().writes
    }

    pub fn disarm_count(&self) -> u32 {
        self.inner.lock().unwrap().disarm_count
    }
}

impl MotorController for MockMotors {
    fn arm(&mut self, _mode: ArmMode) -> Result<(), MotorError> {
        let mut st = self.inner.lock().unwrap();
        st.armed = true;
        st.arm_count += 1;
        Ok(())
    }

    fn disarm(&mut self) -> Result<(), MotorError> {
        let mut st = self.inner.lock().unwrap();
        st.armed = false;
        st.disarm_count += 1;
        st.duty = [0.0; 4];
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.inner.lock().unwrap().armed
    }

    fn set_throttle(
        &mut self,
        motor: usize,
        duty: f64,
        _tempo: ThrottleTempo,
    ) -> Result<(), MotorError> {
        let mut st = self.inner.lock().unwrap();
        if !st.armed {
            return Err(MotorError::Disarmed);
        }
        if motor >= st.duty.len() {
            return Err(MotorError::BadIndex(motor));
        }
        st.duty[motor] = duty;
        st.writes += 1;
        Ok(())
    }
}

// ─── RC bus ──────────────────────────────────────────────────────────────────

pub trait RcBus: Send {
    /// Blocking read of the next frame, `None` on timeout or shutdown.
    fn recv(&mut self, timeout: Duration) -> Option<RcFrame>;
}

pub struct ChannelRc {
    rx: Receiver<RcFrame>,
}

#[derive(Clone)]
pub struct RcFeed {
    tx: Sender<RcFrame>,
}

impl ChannelRc {
    pub fn pair(capacity: usize) -> (RcFeed, ChannelRc) {
        let (tx, rx) = bounded(capacity);
        (RcFeed { tx }, ChannelRc { rx })
    }
}

impl RcFeed {
    pub fn push(&self, frame: RcFrame) {
        let _ = self.tx.try_send(frame);
    }
}

impl RcBus for ChannelRc {
    fn recv(&mut self, timeout: Duration) -> Option<RcFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccelRaw, SensorPayload};

    #[test]
    fn channel_sensors_deliver_in_order() {
        let (feed, mut client) = ChannelSensors::pair(8);
        for t in 0..3u64 {
            feed.push(SensorEvent {
                timestamp: t,
                device_id: 0,
                payload: SensorPayload::Accel(AccelRaw::default()),
            });
        }
        for t in 0..3u64 {
            let evt = client.recv(Duration::from_millis(10)).unwrap();
            assert_eq!(evt.timestamp, t);
        }
        assert!(client.recv(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn mock_motors_reject_writes_when_disarmed() {
        let mut motors = MockMotors::new();
        assert!(matches!(
            motors.set_throttle(0, 0.5, ThrottleTempo::Instant),
            Err(MotorError::Disarmed)
        ));
        motors.arm(ArmMode::Auto).unwrap();
        motors.set_throttle(0, 0.5, ThrottleTempo::Instant).unwrap();
        assert_eq!(motors.duty()[0], 0.5);
        motors.disarm().unwrap();
        assert!(!motors.is_armed());
        assert_eq!(motors.duty()[0], 0.0);
    }

    #[test]
    fn mock_motors_reject_bad_index() {
        let mut motors = MockMotors::new();
        motors.arm(ArmMode::Auto).unwrap();
        assert!(matches!(
            motors.set_throttle(4, 0.1, ThrottleTempo::Instant),
            Err(MotorError::BadIndex(4))
        ));
    }
}
