// control/mma — motor-mixing algorithm for a quad-X frame.
//
// Motor order is fixed: 0 front-left, 1 rear-right, 2 rear-left,
// 3 front-right. The mixing signs below are tied to this ordering.

use log::error;
use thiserror::Error;

use crate::sensors::{ArmMode, MotorController, MotorError, ThrottleTempo};

pub const MOTOR_FRONT_LEFT: usize = 0;
pub const MOTOR_REAR_RIGHT: usize = 1;
pub const MOTOR_REAR_LEFT: usize = 2;
pub const MOTOR_FRONT_RIGHT: usize = 3;

pub const MOTOR_COUNT: usize = 4;

const ATTEN_FACTOR_MIN: f64 = 0.0;
const ATTEN_FACTOR_MAX: f64 = 2.0;
const ATTEN_MID_MIN: f64 = 0.1;
const ATTEN_MID_MAX: f64 = 0.9;

#[derive(Debug, Error, PartialEq)]
pub enum MmaConfigError {
    #[error("attenuation factor {0} outside [{ATTEN_FACTOR_MIN}, {ATTEN_FACTOR_MAX}]")]
    FactorOutOfRange(f64),
    #[error("attenuation middle point {0} outside [{ATTEN_MID_MIN}, {ATTEN_MID_MAX}]")]
    MidPointOutOfRange(f64),
}

/// Throttle-dependent attenuation of the lateral torque demands.
///
/// The factor curve passes through (0, start_val), (mid_arg, mid_val) and
/// (1, end_val); both segments are linear, with slopes precomputed at init.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttenCurve {
    start_val: f64,
    mid_arg: f64,
    mid_val: f64,
    slope: [f64; 2],
}

impl AttenCurve {
    pub fn new(start_val: f64, mid_arg: f64, mid_val: f64, end_val: f64) -> Result<Self, MmaConfigError> {
        for v in [start_val, mid_val, end_val] {
            if !(ATTEN_FACTOR_MIN..=ATTEN_FACTOR_MAX).contains(&v) {
                return Err(MmaConfigError::FactorOutOfRange(v));
            }
        }
        if !(ATTEN_MID_MIN..=ATTEN_MID_MAX).contains(&mid_arg) {
            return Err(MmaConfigError::MidPointOutOfRange(mid_arg));
        }

        Ok(Self {
            start_val,
            mid_arg,
            mid_val,
            slope: [
                (mid_val - start_val) / mid_arg,
                (end_val - mid_val) / (1.0 - mid_arg),
            ],
        })
    }

    /// Unity curve: no attenuation anywhere.
    pub fn unity() -> Self {
        AttenCurve::new(1.0, 0.5, 1.0, 1.0).unwrap()
    }

    pub fn factor(&self, throttle: f64) -> f64 {
        let t = throttle.clamp(0.0, 1.0);
        if t < self.mid_arg {
            self.start_val + t * self.slope[0]
        } else {
            self.mid_val + (t - self.mid_arg) * self.slope[1]
        }
    }
}

/// Per-motor linear output calibration: duty = a·mix + b.
#[derive(Clone, Copy, Debug)]
pub struct MotorLin {
    pub a: f64,
    pub b: f64,
}

impl Default for MotorLin {
    fn default() -> Self {
        Self { a: 1.0, b: 0.0 }
    }
}

/// Quad-X mix of (thrust, roll, pitch, yaw) demands into per-motor
/// fractions, before per-motor calibration and clamping.
pub fn mix(thrust: f64, roll: f64, pitch: f64, yaw: f64) -> [f64; MOTOR_COUNT] {
    [
        thrust + roll + pitch + yaw, // front left
        thrust - roll - pitch + yaw, // rear right
        thrust + roll - pitch - yaw, // rear left
        thrust - roll + pitch - yaw, // front right
    ]
}

pub struct Mma {
    atten: AttenCurve,
    calib: [MotorLin; MOTOR_COUNT],
    motors: Box<dyn MotorController>,
}

impl Mma {
    pub fn new(
        atten: AttenCurve,
        calib: [MotorLin; MOTOR_COUNT],
        motors: Box<dyn MotorController>,
    ) -> Self {
        Self { atten, calib, motors }
    }

    /// Apply one control frame. A disarmed controller is a hard error (the
    /// caller decides whether that ends the flight); a single failed PWM
    /// write is logged and the remaining motors are still served.
    pub fn control(&mut self, thrust: f64, roll: f64, pitch: f64, yaw: f64) -> Result<(), MotorError> {
        if !self.motors.is_armed() {
            error!("mma: cannot set PWMs, module is disarmed");
            return Err(MotorError::Disarmed);
        }

        let factor = self.atten.factor(thrust);
        let duties = mix(thrust, roll * factor, pitch * factor, yaw);

        for (idx, raw) in duties.iter().enumerate() {
            let duty = (self.calib[idx].a * raw + self.calib[idx].b).clamp(0.0, 1.0);
            if let Err(e) = self.motors.set_throttle(idx, duty, ThrottleTempo::Instant) {
                error!("mma: cannot set PWM for motor {}: {}", idx, e);
            }
        }
        Ok(())
    }

    /// Arm the motors (silently).
    pub fn start(&mut self) {
        if let Err(e) = self.motors.arm(ArmMode::Auto) {
            error!("mma: arming failed: {}", e);
        }
    }

    /// Stop and disarm the motors.
    pub fn stop(&mut self) {
        if let Err(e) = self.motors.disarm() {
            error!("mma: disarming failed: {}", e);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.motors.is_armed()
    }
}
