// rc — radio-control input: channel mirror, switch thresholds, abort
// gesture counting and link-loss detection.
//
// The receiving thread feeds frames into a shared `RcState`; the supervisor
// reads channel snapshots and polls the decoded requests at its own rate.
// All sixteen channels of one frame are stored under the same lock, so a
// reader never sees a half-updated frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::clock;
use crate::sensors::RcBus;
use crate::types::{RcError, RcFrame, RC_CHANNELS, RC_CHANNEL_MAX, RC_CHANNEL_MIN};

// Channel assignment of the serial protocol.
pub const CH_ROLL: usize = 0; // right horizontal stick
pub const CH_PITCH: usize = 1; // right vertical stick
pub const CH_THROTTLE: usize = 2; // left vertical stick
pub const CH_YAW: usize = 3; // left horizontal stick
pub const CH_SWA: usize = 4;
pub const CH_SWB: usize = 5;
pub const CH_SWC: usize = 6;
pub const CH_SWD: usize = 7;

/// Switch trigger points at 5% / 95% of the channel range.
const SPAN: u32 = (RC_CHANNEL_MAX - RC_CHANNEL_MIN) as u32;
pub const CH_THR_LOW: u16 = RC_CHANNEL_MIN + (5 * SPAN / 100) as u16;
pub const CH_THR_HIGH: u16 = RC_CHANNEL_MIN + (95 * SPAN / 100) as u16;

/// Consecutive abort-gesture frames required before the abort fires.
pub const ABORT_FRAMES_THRESH: u32 = 5;

/// Link considered lost after this long without a valid frame.
pub const RC_TIMEOUT_US: u64 = 2_000_000;

pub fn ch_low(v: u16) -> bool {
    v <= CH_THR_LOW
}

pub fn ch_high(v: u16) -> bool {
    v >= CH_THR_HIGH
}

/// Stick deflection around the centre, in [-0.5, 0.5].
pub fn ch_centered(v: u16) -> f64 {
    let mid = (RC_CHANNEL_MIN as f64 + RC_CHANNEL_MAX as f64) / 2.0;
    (v as f64 - mid) / SPAN as f64
}

/// Stick position from the low end, in [0, 1].
pub fn ch_fraction(v: u16) -> f64 {
    ((v as f64 - RC_CHANNEL_MIN as f64) / SPAN as f64).clamp(0.0, 1.0)
}

/// Requests decoded from the frame stream; the supervisor maps them onto
/// mode transitions it considers legal in its current mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RcRequest {
    /// SWD high with throttle low, held for `ABORT_FRAMES_THRESH` frames.
    Abort,
    /// SWA dropped low.
    ManualSwitch,
}

#[derive(Debug)]
pub struct RcState {
    channels: [u16; RC_CHANNELS],
    last_frame_us: Option<u64>,
    error_since_us: Option<u64>,
    abort_frames: u32,
    pending: Option<RcRequest>,
}

impl Default for RcState {
    fn default() -> Self {
        Self {
            channels: [RC_CHANNEL_MIN; RC_CHANNELS],
            last_frame_us: None,
            error_since_us: None,
            abort_frames: 0,
            pending: None,
        }
    }
}

impl RcState {
    /// Process one frame. Corrupted frames never update the channel mirror;
    /// a continuous error span as long as the link timeout raises an abort.
    pub fn feed(&mut self, frame: &RcFrame, now_us: u64) {
        if frame.error != RcError::Ok {
            match self.error_since_us {
                None => self.error_since_us = Some(now_us),
                Some(since) if now_us.saturating_sub(since) > RC_TIMEOUT_US => {
                    warn!("rc: continuous link errors, raising abort");
                    self.pending = Some(RcRequest::Abort);
                }
                Some(_) => {}
            }
            return;
        }
        self.error_since_us = None;
        self.last_frame_us = Some(now_us);

        // Emergency abort gesture: SWD high, throttle low.
        if ch_high(frame.channels[CH_SWD]) && ch_low(frame.channels[CH_THROTTLE]) {
            self.abort_frames += 1;
            info!("rc: abort gesture frame {}", self.abort_frames);
            if self.abort_frames >= ABORT_FRAMES_THRESH {
                self.pending = Some(RcRequest::Abort);
            }
            self.channels = frame.channels;
            return;
        }
        self.abort_frames = 0;

        if ch_low(frame.channels[CH_SWA]) {
            // only meaningful in flight; the supervisor filters by mode
            if self.pending.is_none() {
                self.pending = Some(RcRequest::ManualSwitch);
            }
        }

        self.channels = frame.channels;
    }

    /// Take the pending request, if any.
    pub fn take_request(&mut self) -> Option<RcRequest> {
        self.pending.take()
    }

    /// True when no valid frame arrived within the link timeout. Before the
    /// first frame the link counts as silent, not lost.
    pub fn timed_out(&self, now_us: u64) -> bool {
        match self.last_frame_us {
            Some(last) => now_us.saturating_sub(last) > RC_TIMEOUT_US,
            None => false,
        }
    }

    pub fn has_link(&self) -> bool {
        self.last_frame_us.is_some()
    }

    pub fn channels(&self) -> [u16; RC_CHANNELS] {
        self.channels
    }
}

/// Channel mirror shared between the RC thread and the supervisor.
#[derive(Clone, Default)]
pub struct SharedRc {
    inner: Arc<Mutex<RcState>>,
}

impl SharedRc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, frame: &RcFrame, now_us: u64) {
        self.inner.lock().unwrap().feed(frame, now_us);
    }

    pub fn take_request(&self) -> Option<RcRequest> {
        self.inner.lock().unwrap().take_request()
    }

    pub fn timed_out(&self, now_us: u64) -> bool {
        self.inner.lock().unwrap().timed_out(now_us)
    }

    pub fn has_link(&self) -> bool {
        self.inner.lock().unwrap().has_link()
    }

    pub fn channels(&self) -> [u16; RC_CHANNELS] {
        self.inner.lock().unwrap().channels()
    }
}

pub struct RcHandle {
    pub shared: SharedRc,
    join: JoinHandle<()>,
}

impl RcHandle {
    pub fn join(self) {
        let _ = self.join.join();
    }
}

/// Spawn the RC receive thread: frames from the bus go into the shared
/// mirror until the run flag clears. Incoming frames are dropped once the
/// flag is down.
pub fn spawn(mut bus: Box<dyn RcBus>, run: Arc<AtomicBool>) -> RcHandle {
    let shared = SharedRc::new();
    let thread_shared = shared.clone();

    let join = thread::Builder::new()
        .name("rc".into())
        .spawn(move || {
            info!("rc: input thread up");
            while run.load(Ordering::Relaxed) {
                if let Some(frame) = bus.recv(Duration::from_millis(100)) {
                    thread_shared.feed(&frame, clock::now_us());
                }
            }
            info!("rc: input thread down");
        })
        .expect("spawning rc thread");

    RcHandle { shared, join }
}
