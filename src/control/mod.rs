// control — flight-mode supervisor.
//
// A tick-based state machine stepped at 1 kHz with explicit timestamps, so
// the same code runs against the wall clock in flight and against virtual
// time in tests. Each tick reads the filter snapshot, decides targets for
// the PID layer and hands thrust plus torque demands to the mixer. The
// supervisor owns the PID contexts and the mixer; nothing else writes
// motors.

pub mod mma;
pub mod pid;

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use nalgebra::Vector3;

use crate::clock;
use crate::ekf::EstimateBus;
use crate::meas::{Calibration, Geodetic, EARTH_G};
use crate::rc::{
    ch_centered, ch_fraction, ch_high, ch_low, RcRequest, SharedRc, CH_PITCH, CH_ROLL, CH_SWA,
    CH_SWB, CH_SWC, CH_SWD, CH_THROTTLE, CH_YAW,
};
use crate::types::StateEstimate;

use mma::Mma;
use pid::{PidCtx, PidFlags};

/// Tipping guard during takeoff and low-throttle manual flight.
pub const ANGLE_THRESHOLD_LOW: f64 = FRAC_PI_4;
/// Hard attitude limit during any flight mode.
pub const ANGLE_THRESHOLD_HIGH: f64 = FRAC_PI_2;

/// Takeoff holds once the measured altitude is within this of the target.
const ALTITUDE_TOLERANCE_MM: i64 = 500;
/// Altitude error beyond which the altitude integrator is frozen.
const ALT_INTEG_FREEZE_MM: i64 = 1000;
/// Negative starting altitude target during takeoff, keeps the throttle
/// bounded while the integrator is off.
const TAKEOFF_ALT_SAG_MM: i64 = -5000;

/// Yaw stick hold needed to arm.
const ARM_HOLD_US: u64 = 3_000_000;
/// Inactivity in ARM before dropping back to DISARM.
const ARM_TIMEOUT_US: u64 = 30_000_000;

/// Full yaw stick deflection commands this yaw rate, rad/s. The stick
/// contribution is scaled by the tick Δt so the setpoint rate does not
/// depend on the loop frequency.
const YAW_STICK_RATE: f64 = 2.0;

/// Position step completes after holding inside the capture radius this long.
const POSITION_SETTLE_MS: u64 = 3_000;
const POSITION_CAPTURE_M: f64 = 1.0;

// ─── Mission ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MissionStep {
    Takeoff { alt_mm: i64, idle_ms: u64, spool_ms: u64, lift_ms: u64 },
    Position { alt_mm: i64, lat_e7: i64, lon_e7: i64 },
    Hover { alt_mm: i64, time_ms: u64 },
    Landing { descent_mms: i64, diff_mm: i64, timeout_ms: u64 },
    Manual,
    ManualAbort,
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlightMode {
    Idle,
    Disarm,
    Arm,
    Takeoff,
    Hover,
    Position,
    Landing,
    Manual,
    ManualAbort,
    End,
}

impl FlightMode {
    /// Modes in which the vehicle is expected to be airborne.
    pub fn in_flight(self) -> bool {
        matches!(
            self,
            FlightMode::Takeoff
                | FlightMode::Hover
                | FlightMode::Position
                | FlightMode::Landing
                | FlightMode::Manual
        )
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub struct ThrottleRange {
    pub min: f64,
    pub max: f64,
}

pub struct QuadPids {
    pub roll: PidCtx<f64>,
    pub pitch: PidCtx<f64>,
    pub yaw: PidCtx<f64>,
    pub alt: PidCtx<f64>,
    pub pos: PidCtx<Vector3<f64>>,
}

impl QuadPids {
    /// Re-enable every term on all axes.
    fn restore(&mut self) {
        self.roll.flags = PidFlags::FULL;
        self.pitch.flags = PidFlags::FULL;
        self.yaw.flags = PidFlags::FULL;
        self.alt.flags = PidFlags::FULL;
        self.pos.flags = PidFlags::FULL;
    }
}

pub struct ControlConfig {
    pub pids: QuadPids,
    pub throttle: ThrottleRange,
    /// Cockpit line period, milliseconds.
    pub log_period_ms: u64,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default)]
struct Attitude {
    roll: f64,
    pitch: f64,
    yaw: f64,
}

#[derive(Clone, Copy, Debug)]
struct TakeoffCtx {
    target_alt_mm: i64,
    t_idle_ms: u64,
    t_start_ms: u64,
    t_end_ms: u64,
}

#[derive(Clone, Copy, Debug)]
struct LandingCtx {
    start_alt_mm: i64,
    start_ms: u64,
    suspect_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ManualSub {
    Stabilize,
    AltHold,
    PosHold,
}

pub struct Supervisor {
    mode: FlightMode,
    mission: Vec<MissionStep>,
    step_idx: usize,

    pids: QuadPids,
    mma: Mma,
    rc: SharedRc,
    estimate: EstimateBus,
    calib: Arc<Calibration>,

    throttle: ThrottleRange,
    log_period_ms: u64,

    armed: bool,
    att: Attitude,

    /// External shutdown request (signal handler); triggers a controlled
    /// disarm before the loop exits.
    shutdown: Option<Arc<AtomicBool>>,

    last_ctrl_ms: Option<u64>,
    last_log_ms: Option<u64>,

    // per-mode scratch
    arm_req_us: Option<u64>,
    arm_begin_us: u64,
    takeoff: Option<TakeoffCtx>,
    hover_end_ms: u64,
    hover_alt_mm: i64,
    landing: Option<LandingCtx>,
    position_target: Vector3<f64>,
    position_alt_mm: i64,
    position_inside_since_ms: Option<u64>,
    manual_alt_mm: i64,
    manual_pos: Vector3<f64>,
    manual_throttle: f64,
}

impl Supervisor {
    pub fn new(
        cfg: ControlConfig,
        mission: Vec<MissionStep>,
        mma: Mma,
        rc: SharedRc,
        estimate: EstimateBus,
        calib: Arc<Calibration>,
    ) -> Self {
        Self {
            mode: FlightMode::Idle,
            mission,
            step_idx: 0,
            pids: cfg.pids,
            mma,
            rc,
            estimate,
            calib,
            throttle: cfg.throttle,
            log_period_ms: cfg.log_period_ms,
            armed: false,
            att: Attitude::default(),
            shutdown: None,
            last_ctrl_ms: None,
            last_log_ms: None,
            arm_req_us: None,
            arm_begin_us: 0,
            takeoff: None,
            hover_end_ms: 0,
            hover_alt_mm: 0,
            landing: None,
            position_target: Vector3::zeros(),
            position_alt_mm: 0,
            position_inside_since_ms: None,
            manual_alt_mm: 0,
            manual_pos: Vector3::zeros(),
            manual_throttle: 0.0,
        }
    }

    /// Register the flag a signal handler sets; once raised, the next tick
    /// disarms and ends the mission.
    pub fn set_shutdown_flag(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown = Some(flag);
    }

    pub fn mode(&self) -> FlightMode {
        self.mode
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// One 1 kHz tick. Returns false once the mission is over (END or
    /// MANUAL_ABORT reached) and motors are off.
    pub fn step(&mut self, now_us: u64) -> bool {
        let now_ms = now_us / 1000;

        if let Some(flag) = &self.shutdown {
            if flag.load(Ordering::Relaxed)
                && self.mode != FlightMode::ManualAbort
                && self.mode != FlightMode::End
            {
                warn!("control: shutdown requested, disarming");
                self.enter_abort();
            }
        }

        // Requests decoded from the RC stream.
        if let Some(req) = self.rc.take_request() {
            match req {
                RcRequest::Abort if self.mode != FlightMode::ManualAbort => {
                    warn!("control: abort requested over RC");
                    self.enter_abort();
                }
                RcRequest::ManualSwitch
                    if self.mode.in_flight() && self.mode != FlightMode::Manual =>
                {
                    info!("control: SWA low, switching to manual");
                    self.enter_manual(now_us);
                }
                _ => {}
            }
        }

        // Link loss is an abort from any live state.
        if self.mode != FlightMode::ManualAbort
            && self.mode != FlightMode::End
            && self.rc.timed_out(now_us)
        {
            warn!("control: RC link lost, aborting");
            self.enter_abort();
        }

        match self.mode {
            FlightMode::Idle => self.tick_idle(),
            FlightMode::Disarm => self.tick_disarm(now_us),
            FlightMode::Arm => self.tick_arm(now_us),
            FlightMode::Takeoff => self.tick_takeoff(now_ms),
            FlightMode::Hover => self.tick_hover(now_ms),
            FlightMode::Position => self.tick_position(now_ms),
            FlightMode::Landing => self.tick_landing(now_ms),
            FlightMode::Manual => self.tick_manual(now_ms),
            FlightMode::ManualAbort | FlightMode::End => return false,
        }

        true
    }

    // ── Mode transitions ─────────────────────────────────────────────────

    fn disarm_motors(&mut self) {
        if self.armed {
            info!("control: disarming motors");
            self.mma.stop();
            self.armed = false;
        }
    }

    fn enter_abort(&mut self) {
        self.disarm_motors();
        self.mode = FlightMode::ManualAbort;
        info!("control: mission abort");
    }

    fn enter_end(&mut self) {
        self.disarm_motors();
        self.mode = FlightMode::End;
        info!("control: mission end");
    }

    /// Immediate motor stop on a geometry violation; ends the mission
    /// without a landing attempt.
    fn geometry_stop(&mut self, measure: &StateEstimate) {
        error!(
            "control: angles over threshold, roll: {:.3}, pitch: {:.3}; motors stop",
            measure.roll, measure.pitch
        );
        self.disarm_motors();
        self.mode = FlightMode::End;
    }

    fn enter_manual(&mut self, _now_us: u64) {
        let m = self.estimate.get();
        self.pids.restore();
        self.manual_alt_mm = (m.altitude() * 1000.0) as i64;
        self.manual_pos = Vector3::new(m.ned_x, m.ned_y, 0.0);
        self.manual_throttle = 0.0;
        self.att = Attitude { roll: 0.0, pitch: 0.0, yaw: m.yaw };
        self.mode = FlightMode::Manual;
    }

    /// Begin executing the mission step under `step_idx`.
    fn enter_mission_step(&mut self, now_us: u64) {
        let now_ms = now_us / 1000;
        let m = self.estimate.get();
        self.pids.restore();
        self.att = Attitude { roll: 0.0, pitch: 0.0, yaw: m.yaw };

        let step = match self.mission.get(self.step_idx) {
            Some(s) => *s,
            None => {
                self.enter_end();
                return;
            }
        };

        match step {
            MissionStep::Takeoff { alt_mm, idle_ms, spool_ms, lift_ms } => {
                info!("control: TAKEOFF, alt {} mm", alt_mm);
                let t_idle_ms = now_ms + idle_ms;
                let t_start_ms = t_idle_ms + spool_ms;
                self.takeoff = Some(TakeoffCtx {
                    target_alt_mm: alt_mm,
                    t_idle_ms,
                    t_start_ms,
                    t_end_ms: t_start_ms + lift_ms,
                });
                // keep the integrator from winding up before liftoff
                self.pids.alt.flags.insert(PidFlags::IGNORE_I);
                self.mode = FlightMode::Takeoff;
            }
            MissionStep::Hover { alt_mm, time_ms } => {
                info!("control: HOVER, alt {} mm for {} ms", alt_mm, time_ms);
                self.hover_alt_mm = alt_mm;
                self.hover_end_ms = now_ms + time_ms;
                self.mode = FlightMode::Hover;
            }
            MissionStep::Position { alt_mm, lat_e7, lon_e7 } => {
                let geo = Geodetic::new(lat_e7 as f64 / 1e7, lon_e7 as f64 / 1e7, self.calib.ref_geo.h);
                let ned = self.calib.ref_geo.ned_of(&geo, &self.calib.ref_ecef);
                info!(
                    "control: POSITION, target ({:.1}, {:.1}) m, alt {} mm",
                    ned.x, ned.y, alt_mm
                );
                self.position_target = Vector3::new(ned.x, ned.y, 0.0);
                self.position_alt_mm = alt_mm;
                self.position_inside_since_ms = None;
                self.mode = FlightMode::Position;
            }
            MissionStep::Landing { .. } => {
                info!("control: LANDING");
                let alt_mm = (m.altitude() * 1000.0) as i64;
                self.landing =
                    Some(LandingCtx { start_alt_mm: alt_mm, start_ms: now_ms, suspect_ms: now_ms });
                self.mode = FlightMode::Landing;
            }
            MissionStep::Manual => {
                info!("control: MANUAL (mission step)");
                self.enter_manual(now_us);
            }
            MissionStep::ManualAbort => self.enter_abort(),
            MissionStep::End => self.enter_end(),
        }
    }

    fn advance_mission(&mut self, now_us: u64) {
        self.step_idx += 1;
        self.enter_mission_step(now_us);
    }

    // ── Ground modes ─────────────────────────────────────────────────────

    fn tick_idle(&mut self) {
        self.disarm_motors();
        let ch = self.rc.channels();
        let sticks_low = ch_low(ch[CH_SWA])
            && ch_low(ch[CH_SWB])
            && ch_low(ch[CH_SWC])
            && ch_low(ch[CH_SWD])
            && ch_low(ch[CH_THROTTLE]);
        if self.rc.has_link() && sticks_low {
            info!("control: idle -> disarm");
            self.mode = FlightMode::Disarm;
        }
    }

    fn tick_disarm(&mut self, now_us: u64) {
        self.disarm_motors();
        let ch = self.rc.channels();

        // any raised switch or throttle sends us back to idle
        if !(ch_low(ch[CH_SWA])
            && ch_low(ch[CH_SWB])
            && ch_low(ch[CH_SWC])
            && ch_low(ch[CH_SWD])
            && ch_low(ch[CH_THROTTLE]))
        {
            info!("control: disarm -> idle");
            self.arm_req_us = None;
            self.mode = FlightMode::Idle;
            return;
        }

        // yaw stick held at the arm position long enough
        if ch_high(ch[CH_YAW]) {
            match self.arm_req_us {
                None => self.arm_req_us = Some(now_us),
                Some(since) if now_us.saturating_sub(since) >= ARM_HOLD_US => {
                    info!("control: disarm -> arm");
                    self.arm_req_us = None;
                    self.arm_begin_us = now_us;
                    self.mma.start();
                    self.armed = true;
                    self.mode = FlightMode::Arm;
                }
                Some(_) => {}
            }
        } else {
            self.arm_req_us = None;
        }
    }

    fn tick_arm(&mut self, now_us: u64) {
        let ch = self.rc.channels();

        if !ch_low(ch[CH_SWA]) {
            info!("control: arm -> mission");
            self.enter_mission_step(now_us);
            return;
        }
        if !ch_low(ch[CH_THROTTLE]) {
            info!("control: arm -> manual");
            self.enter_manual(now_us);
            return;
        }
        if now_us.saturating_sub(self.arm_begin_us) > ARM_TIMEOUT_US {
            info!("control: arm inactivity, disarming");
            self.disarm_motors();
            self.mode = FlightMode::Disarm;
        }
    }

    // ── Flight modes ─────────────────────────────────────────────────────

    fn tick_takeoff(&mut self, now_ms: u64) {
        let ctx = match self.takeoff {
            Some(c) => c,
            None => {
                self.enter_end();
                return;
            }
        };
        let m = self.estimate.get();
        let hover_throttle = self.throttle.max;
        let alt_mm = (m.altitude() * 1000.0) as i64;

        let mut throttle = hover_throttle;
        let alt_target: i64;

        if now_ms < ctx.t_idle_ms {
            // relaxation period after spinup
            alt_target = TAKEOFF_ALT_SAG_MM;
            throttle = 0.5 * hover_throttle;
            self.pids.yaw.flags = PidFlags::IGNORE_I | PidFlags::RESET_I;
            self.pids.alt.flags = PidFlags::IGNORE_I | PidFlags::RESET_I;
        } else if now_ms < ctx.t_start_ms {
            // spool up to hover throttle, altitude target still sagged
            alt_target = TAKEOFF_ALT_SAG_MM;
            self.pids.yaw.flags = PidFlags::IGNORE_I;
            self.pids.alt.flags = PidFlags::IGNORE_I;
            let spool = (ctx.t_start_ms - ctx.t_idle_ms).max(1) as f64;
            throttle = hover_throttle * (1.0 - 0.5 * (ctx.t_start_ms - now_ms) as f64 / spool);
        } else if now_ms < ctx.t_end_ms {
            // ramp the altitude target up to the commanded altitude
            self.pids.yaw.flags = PidFlags::IGNORE_I;
            self.pids.alt.flags = PidFlags::IGNORE_I;
            let lift = (ctx.t_end_ms - ctx.t_start_ms).max(1) as f64;
            let progress = 1.0 - (ctx.t_end_ms - now_ms) as f64 / lift;
            alt_target = TAKEOFF_ALT_SAG_MM
                + ((ctx.target_alt_mm - TAKEOFF_ALT_SAG_MM) as f64 * progress) as i64;
        } else {
            alt_target = ctx.target_alt_mm;
            if alt_mm > ctx.target_alt_mm - ALTITUDE_TOLERANCE_MM {
                info!("control: takeoff hold reached");
                self.advance_mission(now_ms * 1000);
                return;
            }
        }

        // integrator stays off while the altitude error is large
        if (alt_mm - ctx.target_alt_mm).abs() > ALT_INTEG_FREEZE_MM {
            self.pids.alt.flags.insert(PidFlags::IGNORE_I);
        } else {
            self.pids.alt.flags.remove(PidFlags::IGNORE_I);
        }
        // full control once we cross (target - 1 m)
        if alt_mm > ctx.target_alt_mm - ALT_INTEG_FREEZE_MM {
            self.pids.alt.flags = PidFlags::FULL;
        }

        // tipping guard while close to the ground
        if m.pitch.abs() > ANGLE_THRESHOLD_LOW || m.roll.abs() > ANGLE_THRESHOLD_LOW {
            self.geometry_stop(&m);
            return;
        }

        self.att.yaw = m.yaw;
        self.rc_override(now_ms, true, true, false);

        let _ = self.motors_ctrl(now_ms, throttle, alt_target, None, &m);
    }

    fn tick_hover(&mut self, now_ms: u64) {
        let m = self.estimate.get();
        let alt_mm = (m.altitude() * 1000.0) as i64;

        if now_ms >= self.hover_end_ms {
            info!("control: hover time elapsed");
            self.advance_mission(now_ms * 1000);
            return;
        }

        self.att.roll = 0.0;
        self.att.pitch = 0.0;
        self.att.yaw = m.yaw;

        if (alt_mm - self.hover_alt_mm).abs() > ALT_INTEG_FREEZE_MM {
            self.pids.alt.flags.insert(PidFlags::IGNORE_I);
        } else {
            self.pids.alt.flags.remove(PidFlags::IGNORE_I);
        }

        self.rc_override(now_ms, true, true, false);
        let alt = self.hover_alt_mm;
        let _ = self.motors_ctrl(now_ms, self.throttle.max, alt, None, &m);
    }

    fn tick_position(&mut self, now_ms: u64) {
        let m = self.estimate.get();
        let alt_mm = (m.altitude() * 1000.0) as i64;

        self.att.roll = 0.0;
        self.att.pitch = 0.0;
        self.att.yaw = m.yaw;

        if (alt_mm - self.position_alt_mm).abs() > ALT_INTEG_FREEZE_MM {
            self.pids.alt.flags.insert(PidFlags::IGNORE_I);
        } else {
            self.pids.alt.flags.remove(PidFlags::IGNORE_I);
        }

        // step completes after settling inside the capture radius
        let horiz =
            ((m.ned_x - self.position_target.x).powi(2) + (m.ned_y - self.position_target.y).powi(2)).sqrt();
        let alt_ok = (alt_mm - self.position_alt_mm).abs() < ALTITUDE_TOLERANCE_MM;
        if horiz < POSITION_CAPTURE_M && alt_ok {
            let since = *self.position_inside_since_ms.get_or_insert(now_ms);
            if now_ms.saturating_sub(since) >= POSITION_SETTLE_MS {
                info!("control: position captured");
                self.advance_mission(now_ms * 1000);
                return;
            }
        } else {
            self.position_inside_since_ms = None;
        }

        self.rc_override(now_ms, true, true, false);
        let target = self.position_target;
        let alt = self.position_alt_mm;
        let _ = self.motors_ctrl(now_ms, self.throttle.max, alt, Some(target), &m);
    }

    fn tick_landing(&mut self, now_ms: u64) {
        let (descent_mms, diff_mm, timeout_ms) = match self.mission.get(self.step_idx) {
            Some(MissionStep::Landing { descent_mms, diff_mm, timeout_ms }) => {
                (*descent_mms, *diff_mm, *timeout_ms)
            }
            _ => {
                self.enter_end();
                return;
            }
        };
        let ctx = match self.landing.as_mut() {
            Some(c) => c,
            None => {
                self.enter_end();
                return;
            }
        };
        let m = self.estimate.get();
        let alt_mm = (m.altitude() * 1000.0) as i64;

        let target_alt =
            ctx.start_alt_mm - (descent_mms * now_ms.saturating_sub(ctx.start_ms) as i64) / 1000;

        // while the measured altitude still tracks the descending target,
        // keep pushing the suspected-landing marker forward
        if (target_alt - alt_mm) > -diff_mm {
            ctx.suspect_ms = now_ms;
        }
        if now_ms.saturating_sub(ctx.suspect_ms) > timeout_ms {
            info!("control: landing complete");
            self.advance_mission(now_ms * 1000);
            return;
        }

        self.att.roll = 0.0;
        self.att.pitch = 0.0;
        self.att.yaw = m.yaw;
        self.rc_override(now_ms, true, true, false);
        let _ = self.motors_ctrl(now_ms, self.throttle.max, target_alt, None, &m);
    }

    fn tick_manual(&mut self, now_ms: u64) {
        let m = self.estimate.get();
        let ch = self.rc.channels();

        self.att.roll = 0.0;
        self.att.pitch = 0.0;

        self.pids.alt.flags = PidFlags::FULL;

        let sub = if ch_low(ch[CH_SWC]) {
            ManualSub::Stabilize
        } else if ch_high(ch[CH_SWC]) {
            ManualSub::PosHold
        } else {
            ManualSub::AltHold
        };

        let mut set_pos = None;
        let alt_target: i64;

        match sub {
            ManualSub::AltHold => {
                alt_target = self.manual_alt_mm;
                self.rc_override(now_ms, true, false, false);
            }
            ManualSub::PosHold => {
                alt_target = self.manual_alt_mm;
                self.pids.pos.flags = PidFlags::FULL;
                set_pos = Some(self.manual_pos);
                self.rc_override(now_ms, true, false, false);
            }
            ManualSub::Stabilize => {
                // track the current state so a later hold starts from here
                self.att.yaw = m.yaw;
                self.manual_alt_mm = (m.altitude() * 1000.0) as i64;
                self.manual_pos = Vector3::new(m.ned_x, m.ned_y, 0.0);
                alt_target = self.manual_alt_mm;

                // the altitude and position loops must not fight the pilot
                self.pids.alt.flags =
                    PidFlags::IGNORE_P | PidFlags::IGNORE_I | PidFlags::IGNORE_D;
                self.pids.pos.flags =
                    PidFlags::IGNORE_P | PidFlags::IGNORE_I | PidFlags::IGNORE_D;

                self.rc_override(now_ms, true, true, true);

                // tipping guard when the throttle is at the bottom of the
                // range (the vehicle is likely on or near the ground)
                if ch_fraction(ch[CH_THROTTLE]) < 0.05
                    && (m.pitch.abs() > ANGLE_THRESHOLD_LOW || m.roll.abs() > ANGLE_THRESHOLD_LOW)
                {
                    self.geometry_stop(&m);
                    return;
                }
            }
        }

        let throttle = self.manual_throttle;
        let _ = self.motors_ctrl(now_ms, throttle, alt_target, set_pos, &m);
    }

    // ── Shared helpers ───────────────────────────────────────────────────

    /// Override attitude targets (and optionally throttle) from the RC
    /// sticks. The yaw stick commands a rate; its contribution is scaled by
    /// the tick period.
    fn rc_override(&mut self, now_ms: u64, level: bool, yaw: bool, throttle: bool) {
        let ch = self.rc.channels();
        let dt = self.tick_dt(now_ms);

        if level {
            // ±0.5 rad of roll/pitch at full stick; pitch stick sign is
            // inverted by the transmitter convention
            self.att.roll = ch_centered(ch[CH_ROLL]);
            self.att.pitch = -ch_centered(ch[CH_PITCH]);
        }
        if yaw {
            let rate = ch_centered(ch[CH_YAW]) * 2.0 * YAW_STICK_RATE;
            self.att.yaw = wrap_angle(self.att.yaw + rate * dt);
        }
        if throttle {
            self.manual_throttle = self.throttle.min
                + (self.throttle.max - self.throttle.min) * ch_fraction(ch[CH_THROTTLE]);
        }
    }

    fn tick_dt(&self, now_ms: u64) -> f64 {
        match self.last_ctrl_ms {
            Some(last) if now_ms > last => (now_ms - last) as f64 / 1000.0,
            _ => 0.001,
        }
    }

    /// Attitude/altitude cascade and the mixer write. The hard geometry
    /// limit is enforced here so no flight mode can bypass it.
    fn motors_ctrl(
        &mut self,
        now_ms: u64,
        throttle: f64,
        alt_target_mm: i64,
        set_pos: Option<Vector3<f64>>,
        m: &StateEstimate,
    ) -> Result<(), ()> {
        if m.pitch.abs() > ANGLE_THRESHOLD_HIGH || m.roll.abs() > ANGLE_THRESHOLD_HIGH {
            self.geometry_stop(m);
            return Err(());
        }

        let dt = self.tick_dt(now_ms);
        self.last_ctrl_ms = Some(now_ms);

        self.cockpit(now_ms, m);

        let (mut d_roll, mut d_pitch) = (0.0, 0.0);
        if let Some(target) = set_pos {
            (d_roll, d_pitch) = self.position_attitude(&target, m, dt);
        }

        // altitude loop works in metres, positive up
        let palt = self.pids.alt.calc(
            alt_target_mm as f64 / 1000.0,
            m.altitude(),
            -m.vel_z,
            dt,
        );
        let proll = self.pids.roll.calc(self.att.roll + d_roll, m.roll, m.roll_rate, dt);
        let ppitch = self.pids.pitch.calc(self.att.pitch + d_pitch, m.pitch, m.pitch_rate, dt);
        let pyaw = self.pids.yaw.calc(self.att.yaw, m.yaw, m.yaw_rate, dt);

        match self.mma.control(throttle + palt, proll, ppitch, pyaw) {
            Ok(()) => Ok(()),
            Err(e) => {
                // a disarmed mixer mid-flight ends the mission; anything
                // else was already logged per motor and we carry on
                error!("control: motor output failed: {}", e);
                self.enter_end();
                Err(())
            }
        }
    }

    /// Horizontal position control: NED target acceleration from the 3-D
    /// PID, clipped, rotated by the current yaw and mapped onto additive
    /// roll/pitch targets.
    fn position_attitude(
        &mut self,
        target: &Vector3<f64>,
        m: &StateEstimate,
        dt: f64,
    ) -> (f64, f64) {
        let acc_max = ANGLE_THRESHOLD_LOW.tan() * EARTH_G;

        let curr_pos = Vector3::new(m.ned_x, m.ned_y, 0.0);
        let curr_vel = Vector3::new(m.vel_x, m.vel_y, 0.0);
        let mut acc_earth = self.pids.pos.calc3d(target, &curr_pos, &curr_vel, dt);

        let len = acc_earth.norm();
        if len > acc_max {
            acc_earth *= acc_max / len;
        }

        let yaw_cos = m.yaw.cos();
        let yaw_sin = m.yaw.sin();
        let acc_fwd = acc_earth.x * yaw_cos + acc_earth.y * yaw_sin;
        let acc_right = -acc_earth.x * yaw_sin + acc_earth.y * yaw_cos;

        // rightward acceleration maps to positive roll; forward acceleration
        // needs the nose down, so the pitch axis flips sign
        let d_roll = (acc_right / EARTH_G).atan().clamp(-ANGLE_THRESHOLD_LOW, ANGLE_THRESHOLD_LOW);
        let d_pitch =
            (-(acc_fwd / EARTH_G).atan()).clamp(-ANGLE_THRESHOLD_LOW, ANGLE_THRESHOLD_LOW);

        (d_roll, d_pitch)
    }

    /// One-line pilot-facing summary on stdout, once per log period.
    fn cockpit(&mut self, now_ms: u64, m: &StateEstimate) {
        let due = match self.last_log_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.log_period_ms,
            None => true,
        };
        if !due {
            return;
        }
        self.last_log_ms = Some(now_ms);

        let hdg = {
            let deg = m.yaw.to_degrees();
            if deg < 0.0 { deg + 360.0 } else { deg }
        };
        println!(
            "ALT {:4.1} DST {:4.1} HDG {:3.0} VEL {:4.1}",
            m.altitude(),
            m.horizontal_distance(),
            hdg,
            m.horizontal_speed()
        );
    }
}

fn wrap_angle(a: f64) -> f64 {
    let mut a = a;
    while a > PI {
        a -= 2.0 * PI;
    }
    while a <= -PI {
        a += 2.0 * PI;
    }
    a
}

// ─── Control thread ──────────────────────────────────────────────────────────

pub struct ControlHandle {
    join: JoinHandle<()>,
}

impl ControlHandle {
    pub fn join(self) {
        let _ = self.join.join();
    }
}

/// Spawn the 1 kHz control thread. Clearing the run flag stops the loop
/// (and with it all motor commanding) without disarming; mission end and
/// aborts disarm through the supervisor itself.
pub fn spawn(mut sup: Supervisor, run: Arc<AtomicBool>) -> ControlHandle {
    let join = thread::Builder::new()
        .name("control".into())
        .spawn(move || {
            info!("control: thread up");
            while run.load(Ordering::Relaxed) {
                if !sup.step(clock::now_us()) {
                    run.store(false, Ordering::Relaxed);
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            info!("control: thread down");
        })
        .expect("spawning control thread");

    ControlHandle { join }
}

#[cfg(test)]
mod tests {
    use super::mma::AttenCurve;
    use super::pid::PidCoef;
    use super::*;
    use crate::algebra::Quat;
    use crate::ekf::{Ekf, EkfTuning};
    use crate::meas::ExternalCalib;
    use crate::sensors::{MockMotors, MotorController};
    use crate::types::{
        AccelRaw, BaroRaw, GpsRaw, GyroRaw, MagRaw, RcFrame, SensorEvent, SensorPayload,
    };

    const REF_LAT_E9: i64 = 52_000_000_000;
    const REF_LON_E9: i64 = 21_000_000_000;

    fn test_calibration() -> Calibration {
        let ref_geo = Geodetic::new(52.0, 21.0, 100.0);
        Calibration {
            external: ExternalCalib::default(),
            init_quat: Quat::IDENTITY,
            init_accel: Vector3::new(0.0, 0.0, -EARTH_G),
            gravity: EARTH_G,
            // matches the magnetometer stream the scenario feeds
            init_mag: Vector3::new(220.0, 0.0, -410.0),
            gyro_bias: Vector3::zeros(),
            base_pressure: 101_325.0,
            base_temp: 293.15,
            ref_ecef: ref_geo.to_ecef(),
            ref_geo,
        }
    }

    fn scalar_pid(kr: f64, kp: f64, ki: f64, kd: f64, max: f64) -> PidCtx<f64> {
        PidCtx::new(
            PidCoef::new(kr, 10.0, 0.0),
            PidCoef::new(kp, max, 0.0),
            PidCoef::new(ki, max, 0.0),
            PidCoef::new(kd, max, 0.0),
        )
    }

    fn test_pids() -> QuadPids {
        let mut yaw = scalar_pid(5.0, 0.1, 0.05, 0.0, 0.5);
        yaw.err_bound = Some(PI);
        QuadPids {
            roll: scalar_pid(5.0, 0.1, 0.05, 0.0, 0.5),
            pitch: scalar_pid(5.0, 0.1, 0.05, 0.0, 0.5),
            yaw,
            alt: scalar_pid(2.0, 0.3, 0.1, 0.0, 0.5),
            pos: PidCtx::new(
                PidCoef::new(0.5, 5.0, 0.0),
                PidCoef::new(1.0, 5.0, 0.0),
                PidCoef::new(0.0, 1.0, 0.0),
                PidCoef::new(0.0, 1.0, 0.0),
            ),
        }
    }

    fn make_sup(
        mission: Vec<MissionStep>,
        bus: EstimateBus,
        calib: Arc<Calibration>,
    ) -> (Supervisor, MockMotors, SharedRc) {
        let motors = MockMotors::new();
        let mma = Mma::new(AttenCurve::unity(), Default::default(), Box::new(motors.clone()));
        let rc = SharedRc::new();
        let cfg = ControlConfig {
            pids: test_pids(),
            throttle: ThrottleRange { min: 0.0, max: 0.27 },
            log_period_ms: 60_000, // keep test output quiet
        };
        let sup = Supervisor::new(cfg, mission, mma, rc.clone(), bus, calib);
        (sup, motors, rc)
    }

    /// Frame with sticks centred, throttle down, all switches low.
    fn centered_frame() -> RcFrame {
        let mut f = RcFrame::all_low();
        f.channels[CH_ROLL] = 1500;
        f.channels[CH_PITCH] = 1500;
        f.channels[CH_YAW] = 1500;
        f
    }

    /// Walk the supervisor from IDLE through DISARM into ARM with the yaw
    /// stick held high. Returns the virtual time after arming.
    fn arm(sup: &mut Supervisor, rc: &SharedRc, mut now_us: u64) -> u64 {
        rc.feed(&centered_frame(), now_us);
        sup.step(now_us);
        now_us += 1_000;
        sup.step(now_us);
        assert_eq!(sup.mode(), FlightMode::Disarm);

        let mut f = centered_frame();
        f.channels[CH_YAW] = 2000;
        let start = now_us;
        while now_us - start < ARM_HOLD_US + 20_000 && sup.mode() != FlightMode::Arm {
            rc.feed(&f, now_us);
            sup.step(now_us);
            now_us += 1_000;
        }
        assert_eq!(sup.mode(), FlightMode::Arm);
        assert!(sup.is_armed());
        now_us
    }

    /// Walk from ARM into MANUAL by raising the throttle.
    fn enter_manual_mode(sup: &mut Supervisor, rc: &SharedRc, mut now_us: u64) -> u64 {
        let mut f = centered_frame();
        f.channels[CH_THROTTLE] = 1300;
        rc.feed(&f, now_us);
        sup.step(now_us);
        now_us += 1_000;
        assert_eq!(sup.mode(), FlightMode::Manual);
        now_us
    }

    fn imu_events(ts: u64) -> [SensorEvent; 3] {
        [
            SensorEvent {
                timestamp: ts,
                device_id: 0,
                payload: SensorPayload::Gyro(GyroRaw::default()),
            },
            SensorEvent {
                timestamp: ts,
                device_id: 0,
                payload: SensorPayload::Mag(MagRaw { mag_x: 220, mag_y: 0, mag_z: -410 }),
            },
            SensorEvent {
                timestamp: ts + 10,
                device_id: 0,
                payload: SensorPayload::Accel(AccelRaw { accel_x: 0, accel_y: 0, accel_z: -9807 }),
            },
        ]
    }

    // ── S1: takeoff to hover on a scripted world ─────────────────────────

    #[test]
    fn takeoff_to_hover_mission_completes_on_time() {
        let calib = Arc::new(test_calibration());
        let mut ekf = Ekf::new(calib.clone(), EkfTuning::default());
        let bus = ekf.estimate_bus();

        let mission = vec![
            MissionStep::Takeoff { alt_mm: 1000, idle_ms: 1000, spool_ms: 1000, lift_ms: 1000 },
            MissionStep::Hover { alt_mm: 1000, time_ms: 2000 },
            MissionStep::End,
        ];
        let (mut sup, motors, rc) = make_sup(mission, bus, calib);

        let mut now = 1_000_000u64;
        now = arm(&mut sup, &rc, now);

        // SWA high starts the scenario
        let mut flight_frame = centered_frame();
        flight_frame.channels[CH_SWA] = 2000;
        rc.feed(&flight_frame, now);
        sup.step(now);
        assert_eq!(sup.mode(), FlightMode::Takeoff);
        let t0_ms = now / 1000;

        // simple vertical plant: the airframe reaches 1.2 m during the
        // lift window and stays there
        let plant_alt = |ms: u64| -> f64 {
            let ramp_start = t0_ms + 2_200;
            if ms <= ramp_start {
                0.0
            } else {
                (((ms - ramp_start) as f64 / 1000.0) * 1.2).min(1.2)
            }
        };

        let mut hover_at_ms = None;
        let mut end_at_ms = None;
        let mut saw_landing = false;

        for tick in 0u64..10_000 {
            now += 1_000;
            let ms = now / 1000;

            for evt in imu_events(now) {
                ekf.handle_event(&evt);
            }
            if ms % 50 == 0 {
                let pressure = 101_325.0 * (-plant_alt(ms) / 8453.669).exp();
                ekf.handle_event(&SensorEvent {
                    timestamp: now + 100,
                    device_id: 0,
                    payload: SensorPayload::Baro(BaroRaw {
                        pressure: pressure as u32,
                        temp: 293_150,
                    }),
                });
            }
            if ms % 1000 == 0 {
                ekf.handle_event(&SensorEvent {
                    timestamp: now + 200,
                    device_id: 0,
                    payload: SensorPayload::Gps(GpsRaw {
                        lat: REF_LAT_E9,
                        lon: REF_LON_E9,
                        alt: 100_000,
                        hdop: 110,
                        fix: 3,
                        sats_nb: 10,
                        ..Default::default()
                    }),
                });
            }
            if tick % 14 == 0 {
                rc.feed(&flight_frame, now);
            }

            let alive = sup.step(now);

            if sup.mode() == FlightMode::Landing {
                saw_landing = true;
            }
            if sup.mode() == FlightMode::Hover && hover_at_ms.is_none() {
                hover_at_ms = Some(ms);
                // full altitude control once inside one metre of the target
                assert_eq!(sup.pids.alt.flags, PidFlags::FULL);
            }
            if !alive {
                end_at_ms = Some(ms);
                break;
            }
        }

        let hover_at = hover_at_ms.expect("hover never entered");
        let end_at = end_at_ms.expect("mission never completed");
        assert_eq!(sup.mode(), FlightMode::End);
        assert!(!saw_landing, "landing must not be commanded");
        assert!(motors.write_count() > 0);
        assert!(!motors.is_armed(), "motors disarmed after mission end");

        let hover_span = end_at - hover_at;
        assert!(
            (1_950..=2_050).contains(&hover_span),
            "hover lasted {} ms",
            hover_span
        );
    }

    // ── S2: tipping guard in low-throttle stabilise ──────────────────────

    #[test]
    fn manual_stabilise_tipping_at_low_throttle_stops_motors() {
        let bus = EstimateBus::new();
        bus.publish(StateEstimate::default());
        let (mut sup, motors, rc) = make_sup(vec![MissionStep::End], bus.clone(), Arc::new(test_calibration()));

        let mut now = 1_000_000u64;
        now = arm(&mut sup, &rc, now);
        now = enter_manual_mode(&mut sup, &rc, now);
        assert!(motors.is_armed());

        // throttle down to 2% of range, stick centred, SWC low (stabilise)
        let mut f = centered_frame();
        f.channels[CH_THROTTLE] = 1020;
        rc.feed(&f, now);
        sup.step(now);
        assert!(motors.is_armed(), "level attitude must not trip the guard");

        // simulated 50 degrees of roll
        let mut tilted = StateEstimate::default();
        tilted.roll = 50.0_f64.to_radians();
        bus.publish(tilted);

        now += 1_000;
        rc.feed(&f, now);
        sup.step(now);

        assert!(!motors.is_armed(), "motors must stop on the tipping guard");
    }

    // ── S4 / property 11: abort gesture latency ──────────────────────────

    #[test]
    fn abort_gesture_disarms_within_five_frames() {
        let bus = EstimateBus::new();
        bus.publish(StateEstimate::default());
        let (mut sup, motors, rc) = make_sup(vec![MissionStep::End], bus, Arc::new(test_calibration()));

        let mut now = 1_000_000u64;
        now = arm(&mut sup, &rc, now);
        now = enter_manual_mode(&mut sup, &rc, now);

        let mut gesture = centered_frame();
        gesture.channels[CH_SWD] = 2000;
        gesture.channels[CH_THROTTLE] = 1000;

        for _ in 0..5 {
            rc.feed(&gesture, now);
            sup.step(now);
            now += 14_000;
        }

        assert_eq!(sup.mode(), FlightMode::ManualAbort);
        assert!(!motors.is_armed());
        assert!(motors.disarm_count() > 0);
    }

    // ── Property 12: RC loss timeout ─────────────────────────────────────

    #[test]
    fn rc_loss_aborts_within_two_seconds() {
        let bus = EstimateBus::new();
        bus.publish(StateEstimate::default());
        let (mut sup, motors, rc) = make_sup(vec![MissionStep::End], bus, Arc::new(test_calibration()));

        let mut now = 1_000_000u64;
        now = arm(&mut sup, &rc, now);
        now = enter_manual_mode(&mut sup, &rc, now);

        // one last frame, then the link goes silent
        let f = centered_frame();
        rc.feed(&f, now);
        sup.step(now);
        let last_frame_us = now;

        let mut abort_at = None;
        for _ in 0..3_000 {
            now += 1_000;
            sup.step(now);
            if sup.mode() == FlightMode::ManualAbort {
                abort_at = Some(now);
                break;
            }
        }

        let abort_at = abort_at.expect("rc loss did not abort");
        let gap = abort_at - last_frame_us;
        assert!((1_950_000..=2_050_000).contains(&gap), "gap was {} µs", gap);
        assert!(!motors.is_armed());
    }

    // ── Takeoff tipping guard ────────────────────────────────────────────

    #[test]
    fn takeoff_tipping_guard_stops_motors() {
        let bus = EstimateBus::new();
        bus.publish(StateEstimate::default());
        let mission = vec![
            MissionStep::Takeoff { alt_mm: 1000, idle_ms: 500, spool_ms: 500, lift_ms: 500 },
            MissionStep::End,
        ];
        let (mut sup, motors, rc) = make_sup(mission, bus.clone(), Arc::new(test_calibration()));

        let mut now = 1_000_000u64;
        now = arm(&mut sup, &rc, now);

        let mut f = centered_frame();
        f.channels[CH_SWA] = 2000;
        rc.feed(&f, now);
        sup.step(now);
        assert_eq!(sup.mode(), FlightMode::Takeoff);

        let mut tilted = StateEstimate::default();
        tilted.pitch = 0.9; // above π/4
        bus.publish(tilted);

        now += 1_000;
        rc.feed(&f, now);
        sup.step(now);
        assert!(!motors.is_armed());
        assert_eq!(sup.mode(), FlightMode::End);
    }

    // ── Arm inactivity timeout ───────────────────────────────────────────

    #[test]
    fn arm_inactivity_returns_to_disarm() {
        let bus = EstimateBus::new();
        let (mut sup, motors, rc) = make_sup(vec![MissionStep::End], bus, Arc::new(test_calibration()));

        let mut now = 1_000_000u64;
        now = arm(&mut sup, &rc, now);

        let f = centered_frame();
        for _ in 0..31_000u64 {
            now += 1_000;
            rc.feed(&f, now);
            sup.step(now);
            if sup.mode() != FlightMode::Arm {
                break;
            }
        }
        assert_eq!(sup.mode(), FlightMode::Disarm);
        assert!(!motors.is_armed());
    }

    // ── Position-to-attitude mapping ─────────────────────────────────────

    #[test]
    fn position_error_maps_onto_roll_pitch_targets() {
        let bus = EstimateBus::new();
        let (mut sup, _motors, _rc) = make_sup(vec![MissionStep::End], bus, Arc::new(test_calibration()));

        let level = StateEstimate::default();

        // target straight north: nose must go down, no roll
        let (d_roll, d_pitch) =
            sup.position_attitude(&Vector3::new(5.0, 0.0, 0.0), &level, 0.001);
        assert!(d_pitch < 0.0, "d_pitch = {}", d_pitch);
        assert!(d_roll.abs() < 1e-9);

        // target straight east: roll right, no pitch
        sup.pids.pos.reset_state();
        let (d_roll, d_pitch) =
            sup.position_attitude(&Vector3::new(0.0, 5.0, 0.0), &level, 0.001);
        assert!(d_roll > 0.0, "d_roll = {}", d_roll);
        assert!(d_pitch.abs() < 1e-9);

        // both clipped to the low angle threshold
        sup.pids.pos.reset_state();
        let (d_roll, d_pitch) =
            sup.position_attitude(&Vector3::new(1000.0, 1000.0, 0.0), &level, 0.001);
        assert!(d_roll <= ANGLE_THRESHOLD_LOW + 1e-12);
        assert!(d_pitch >= -ANGLE_THRESHOLD_LOW - 1e-12);
    }
}
