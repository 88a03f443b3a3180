use serde::{Deserialize, Serialize};

use crate::algebra::Quat;

// ─── Raw sensor events ───────────────────────────────────────────────────────
//
// Events arrive in the device's integer units and are converted to SI by the
// measurement adapter, never earlier. Timestamps are monotonic microseconds
// and must be non-decreasing per stream.

/// Accelerations in mm/s².
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct AccelRaw {
    pub accel_x: i32,
    pub accel_y: i32,
    pub accel_z: i32,
}

/// Angular rates in mrad/s plus integrated-angle accumulators in µrad.
/// The accumulators wrap around the full u32 range.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct GyroRaw {
    pub gyro_x: i32,
    pub gyro_y: i32,
    pub gyro_z: i32,
    pub d_angle_x: u32,
    pub d_angle_y: u32,
    pub d_angle_z: u32,
}

/// Magnetic field in device units; only the direction matters downstream.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MagRaw {
    pub mag_x: i32,
    pub mag_y: i32,
    pub mag_z: i32,
}

/// Pressure in Pa, temperature in mK.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BaroRaw {
    pub pressure: u32,
    pub temp: u32,
}

/// Satellite-navigation fix: lat/lon in 10⁻⁹ degrees, altitude in mm,
/// velocities in mm/s, dilution-of-precision ×10⁻², estimated errors in mm.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct GpsRaw {
    pub lat: i64,
    pub lon: i64,
    pub alt: i32,
    pub vel_north: i32,
    pub vel_east: i32,
    pub vel_down: i32,
    pub hdop: u16,
    pub vdop: u16,
    pub eph: u32,
    pub epv: u32,
    pub sats_nb: u8,
    pub fix: u8,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum SensorPayload {
    Accel(AccelRaw),
    Gyro(GyroRaw),
    Mag(MagRaw),
    Baro(BaroRaw),
    Gps(GpsRaw),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SensorEvent {
    /// Monotonic microseconds.
    pub timestamp: u64,
    pub device_id: u32,
    pub payload: SensorPayload,
}

// ─── RC frames ───────────────────────────────────────────────────────────────

pub const RC_CHANNELS: usize = 16;

/// Raw channel range of the serial RC protocol.
pub const RC_CHANNEL_MIN: u16 = 1000;
pub const RC_CHANNEL_MAX: u16 = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RcError {
    Ok,
    /// Frame failed checksum or framing; channel values are not usable.
    Corrupted,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RcFrame {
    pub channels: [u16; RC_CHANNELS],
    pub error: RcError,
}

impl RcFrame {
    /// Frame with every channel at the low end of the range.
    pub fn all_low() -> Self {
        Self { channels: [RC_CHANNEL_MIN; RC_CHANNELS], error: RcError::Ok }
    }
}

// ─── Published state estimate ────────────────────────────────────────────────

/// Read-mostly snapshot of the filter output, published after each update
/// step. Everything the control layer reads comes from here; it never touches
/// the filter matrices.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StateEstimate {
    /// Attitude quaternion, body to NED.
    pub q: Quat,

    /// Tait-Bryan angles derived from `q`.
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,

    /// Position in the local NED frame, metres.
    pub ned_x: f64,
    pub ned_y: f64,
    pub ned_z: f64,

    /// Velocity in NED, m/s.
    pub vel_x: f64,
    pub vel_y: f64,
    pub vel_z: f64,

    /// Angular rates in the body frame, rad/s.
    pub roll_rate: f64,
    pub pitch_rate: f64,
    pub yaw_rate: f64,

    /// Specific force in NED with gravity removed, m/s².
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,

    pub accel_bias_z: f64,
}

impl Default for StateEstimate {
    fn default() -> Self {
        Self {
            q: Quat::IDENTITY,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            ned_x: 0.0,
            ned_y: 0.0,
            ned_z: 0.0,
            vel_x: 0.0,
            vel_y: 0.0,
            vel_z: 0.0,
            roll_rate: 0.0,
            pitch_rate: 0.0,
            yaw_rate: 0.0,
            accel_x: 0.0,
            accel_y: 0.0,
            accel_z: 0.0,
            accel_bias_z: 0.0,
        }
    }
}

impl StateEstimate {
    /// Altitude above the reference point, metres (NED z points down).
    pub fn altitude(&self) -> f64 {
        -self.ned_z
    }

    pub fn horizontal_distance(&self) -> f64 {
        (self.ned_x * self.ned_x + self.ned_y * self.ned_y).sqrt()
    }

    pub fn horizontal_speed(&self) -> f64 {
        (self.vel_x * self.vel_x + self.vel_y * self.vel_y).sqrt()
    }
}
