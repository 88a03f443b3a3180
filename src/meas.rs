// meas — measurement adapter between raw sensor events and the filter.
//
// Everything here is frame- and unit-normalisation: device integer units to
// SI, ellipsoid / iron corrections, FIR smoothing, geodetic coordinates to
// the local NED frame, and absolute pressure to the Δ-altitude channel the
// filter actually consumes. The calibration record is assembled once at
// startup and never mutated afterwards; the filter and the control layer
// borrow it immutably.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

use crate::algebra::Quat;
use crate::fir::{LowPass, VecFir};
use crate::sensors::SensorClient;
use crate::types::{AccelRaw, BaroRaw, GpsRaw, GyroRaw, MagRaw, SensorEvent, SensorPayload};

pub const EARTH_G: f64 = 9.80665;

const EARTH_SEMI_MAJOR: f64 = 6378137.0;
const EARTH_ECCENTRICITY_SQUARED: f64 = 0.006694384;

/// International pressure-to-height approximation, metres per ln(p/p0).
const PRESS2ALT: f64 = -8453.669;

/// Half of the u32 span; a larger wrapped difference is read as negative.
const MAX_U32_DELTA_ANGLE: u32 = 0x7fff_ffff;

/// 50π rad/s, the largest angular speed considered physically plausible.
const GYRO_MAX_SENSIBLE_RATE: f64 = 157.0;

/// Earth acceleration versor in NED.
pub const NED_G: Vector3<f64> = Vector3::new(0.0, 0.0, -1.0);
/// Earth east versor in NED.
pub const NED_EAST: Vector3<f64> = Vector3::new(0.0, 1.0, 0.0);

#[derive(Debug, Error)]
pub enum CalibError {
    #[error("{matrix} calibration matrix has a non-positive diagonal entry")]
    NonPositiveDiagonal { matrix: &'static str },
    #[error("{0} calibration value is not finite")]
    NonFinite(&'static str),
    #[error("calibration interrupted before completion (stage: {0})")]
    Interrupted(&'static str),
}

// ─── Geodesy ─────────────────────────────────────────────────────────────────

/// Geodetic point with its trigonometry precomputed, since every ECEF/ENU
/// conversion against the reference reuses the same four values.
#[derive(Clone, Copy, Debug)]
pub struct Geodetic {
    pub lat: f64,
    pub lon: f64,
    pub h: f64,
    sin_lat: f64,
    cos_lat: f64,
    sin_lon: f64,
    cos_lon: f64,
}

impl Geodetic {
    pub fn new(lat_deg: f64, lon_deg: f64, h_m: f64) -> Self {
        let lat_rad = lat_deg.to_radians();
        let lon_rad = lon_deg.to_radians();
        Self {
            lat: lat_deg,
            lon: lon_deg,
            h: h_m,
            sin_lat: lat_rad.sin(),
            cos_lat: lat_rad.cos(),
            sin_lon: lon_rad.sin(),
            cos_lon: lon_rad.cos(),
        }
    }

    pub fn from_raw(gps: &GpsRaw) -> Self {
        Self::new(gps.lat as f64 / 1e9, gps.lon as f64 / 1e9, gps.alt as f64 / 1e3)
    }

    /// WGS-84 geodetic to earth-centred earth-fixed.
    pub fn to_ecef(&self) -> Vector3<f64> {
        let n = EARTH_SEMI_MAJOR / (1.0 - EARTH_ECCENTRICITY_SQUARED * self.sin_lat * self.sin_lat).sqrt();
        Vector3::new(
            (n + self.h) * self.cos_lat * self.cos_lon,
            (n + self.h) * self.cos_lat * self.sin_lon,
            ((1.0 - EARTH_ECCENTRICITY_SQUARED) * n + self.h) * self.sin_lat,
        )
    }

    /// Convert a point to NED coordinates relative to this reference.
    pub fn ned_of(&self, point: &Geodetic, ref_ecef: &Vector3<f64>) -> Vector3<f64> {
        let dif = point.to_ecef() - ref_ecef;

        // ECEF → ENU rotation built from the reference trigonometry.
        let east = -self.sin_lon * dif.x + self.cos_lon * dif.y;
        let north = -self.sin_lat * self.cos_lon * dif.x - self.sin_lat * self.sin_lon * dif.y
            + self.cos_lat * dif.z;
        let up = self.cos_lat * self.cos_lon * dif.x + self.cos_lat * self.sin_lon * dif.y
            + self.sin_lat * dif.z;

        // ENU → NED
        Vector3::new(north, east, -up)
    }
}

// ─── Calibration record ──────────────────────────────────────────────────────

/// Externally supplied calibration constants (from the calibration tool's
/// output), validated before anything is armed.
#[derive(Clone, Debug)]
pub struct ExternalCalib {
    /// Accelerometer ellipsoid non-orthogonality matrix S_a.
    pub accel_scale: Matrix3<f64>,
    /// Accelerometer ellipsoid offset h_a, m/s².
    pub accel_offset: Vector3<f64>,
    /// Magnetometer soft-iron matrix S_m.
    pub soft_iron: Matrix3<f64>,
    /// Magnetometer hard-iron offset h_m.
    pub hard_iron: Vector3<f64>,
    /// Per-motor quadratic PWM-to-field interference polynomial, one
    /// (a, b, c) triple per motor; field error = a·d² + b·d + c per axis
    /// scale of the polynomial's unit vector is folded into the
    /// coefficients.
    pub motor_field_poly: Option<[[Vector3<f64>; 3]; 4]>,
    /// Linear temperature model for the accelerometer, per-axis slope per K.
    pub accel_temp_slope: Vector3<f64>,
    /// Linear temperature model for the gyro, per-axis slope per K.
    pub gyro_temp_slope: Vector3<f64>,
    /// Reference temperature for the slopes, K.
    pub temp_ref: f64,
}

impl Default for ExternalCalib {
    fn default() -> Self {
        Self {
            accel_scale: Matrix3::identity(),
            accel_offset: Vector3::zeros(),
            soft_iron: Matrix3::identity(),
            hard_iron: Vector3::zeros(),
            motor_field_poly: None,
            accel_temp_slope: Vector3::zeros(),
            gyro_temp_slope: Vector3::zeros(),
            temp_ref: 293.15,
        }
    }
}

impl ExternalCalib {
    pub fn validate(&self) -> Result<(), CalibError> {
        for (name, m) in [("accelerometer", &self.accel_scale), ("soft-iron", &self.soft_iron)] {
            if m.iter().any(|v| !v.is_finite()) {
                return Err(CalibError::NonFinite(name));
            }
            for i in 0..3 {
                if m[(i, i)] <= 0.0 {
                    return Err(CalibError::NonPositiveDiagonal { matrix: name });
                }
            }
        }
        if self.accel_offset.iter().chain(self.hard_iron.iter()).any(|v| !v.is_finite()) {
            return Err(CalibError::NonFinite("offset"));
        }
        Ok(())
    }
}

/// Values measured on the ground during startup, with the external constants
/// folded in. Immutable after `Calibrator` hands it over.
#[derive(Clone, Debug)]
pub struct Calibration {
    pub external: ExternalCalib,

    /// Attitude at rest, body to NED.
    pub init_quat: Quat,
    /// Averaged stationary accelerometer reading, m/s².
    pub init_accel: Vector3<f64>,
    /// Local gravity magnitude, |init_accel|.
    pub gravity: f64,
    /// Averaged stationary magnetometer reading (corrected units).
    pub init_mag: Vector3<f64>,
    /// Averaged stationary gyro reading, rad/s.
    pub gyro_bias: Vector3<f64>,

    /// Reference atmospheric pressure, Pa.
    pub base_pressure: f64,
    /// Reference temperature, K.
    pub base_temp: f64,

    /// Geodetic reference point and its ECEF coordinates.
    pub ref_geo: Geodetic,
    pub ref_ecef: Vector3<f64>,
}

// ─── Unit conversion ─────────────────────────────────────────────────────────

pub fn accel_si(raw: &AccelRaw) -> Vector3<f64> {
    Vector3::new(raw.accel_x as f64, raw.accel_y as f64, raw.accel_z as f64) / 1e3
}

pub fn gyro_si(raw: &GyroRaw) -> Vector3<f64> {
    Vector3::new(raw.gyro_x as f64, raw.gyro_y as f64, raw.gyro_z as f64) / 1e3
}

pub fn mag_units(raw: &MagRaw) -> Vector3<f64> {
    Vector3::new(raw.mag_x as f64, raw.mag_y as f64, raw.mag_z as f64)
}

/// Angular rate from two integrated-angle samples. The µrad accumulators
/// wrap around u32; a wrapped difference above half the range is
/// reinterpreted as a negative step. Falls back to `None` when the timestep
/// is unusable or the quotient leaves the plausible band.
pub fn gyro_delta_angle_rate(
    new: &GyroRaw,
    new_ts: u64,
    old: &GyroRaw,
    old_ts: u64,
) -> Option<Vector3<f64>> {
    if new_ts == 0 || old_ts == 0 || new_ts <= old_ts {
        return None;
    }
    let delta_us = (new_ts - old_ts) as f64;

    let axis = |n: u32, o: u32| -> f64 {
        let dif = n.wrapping_sub(o);
        if dif < MAX_U32_DELTA_ANGLE {
            dif as f64
        } else {
            -(dif.wrapping_neg() as f64)
        }
    };

    // µrad over µs is rad/s directly.
    let rate = Vector3::new(
        axis(new.d_angle_x, old.d_angle_x) / delta_us,
        axis(new.d_angle_y, old.d_angle_y) / delta_us,
        axis(new.d_angle_z, old.d_angle_z) / delta_us,
    );

    if rate.iter().any(|v| v.abs() > GYRO_MAX_SENSIBLE_RATE) {
        return None;
    }
    Some(rate)
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

/// One prepared inertial sample: calibrated and filtered accelerometer
/// (plus the unfiltered copy), bias-corrected filtered gyro rate, corrected
/// magnetometer.
#[derive(Clone, Copy, Debug)]
pub struct ImuSample {
    pub timestamp: u64,
    pub accel: Vector3<f64>,
    pub accel_raw: Vector3<f64>,
    pub gyro: Vector3<f64>,
    pub mag: Vector3<f64>,
}

/// Change-of-altitude measurement derived from the barometer. `dz` is the
/// low-pass filtered change of NED z between consecutive samples; `vz` the
/// matching vertical speed estimate.
#[derive(Clone, Copy, Debug)]
pub struct BaroDelta {
    pub timestamp: u64,
    pub dz: f64,
    pub vz: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct GpsFix {
    pub timestamp: u64,
    /// Position in the local NED frame, m.
    pub pos: Vector3<f64>,
    /// Velocity in NED, m/s.
    pub vel: Vector3<f64>,
    pub lat: f64,
    pub lon: f64,
    pub hdop: f64,
    pub eph: f64,
    pub epv: f64,
    pub fix: u8,
    pub sats_nb: u8,
}

#[derive(Clone, Copy, Debug)]
pub enum Measurement {
    Imu(ImuSample),
    Baro(BaroDelta),
    Gps(GpsFix),
}

pub struct MeasAdapter {
    calib: Arc<Calibration>,

    accel_fir: VecFir,
    gyro_fir: VecFir,

    last_gyro: Option<(u64, GyroRaw)>,
    latest_gyro: Vector3<f64>,
    latest_mag: Vector3<f64>,
    have_gyro: bool,

    last_temp: f64,

    last_ned_z: Option<(u64, f64)>,
    baro_dz_lpf: LowPass,
    baro_vz_lpf: LowPass,
}

impl MeasAdapter {
    pub fn new(calib: Arc<Calibration>) -> Self {
        Self {
            accel_fir: VecFir::new(),
            gyro_fir: VecFir::new(),
            last_gyro: None,
            latest_gyro: Vector3::zeros(),
            latest_mag: calib.init_mag,
            have_gyro: false,
            last_temp: calib.base_temp,
            last_ned_z: None,
            baro_dz_lpf: LowPass::new(1.0, 20.0),
            baro_vz_lpf: LowPass::new(1.0, 20.0),
            calib,
        }
    }

    /// Clear all filter history, as around a mode restart.
    pub fn reset_filters(&mut self) {
        self.accel_fir.apply(None);
        self.gyro_fir.apply(None);
        self.baro_dz_lpf.reset();
        self.baro_vz_lpf.reset();
        self.last_ned_z = None;
        self.last_gyro = None;
    }

    /// Ellipsoid correction: S_a · (a − h_a), plus the linear temperature
    /// model against the latest known ambient temperature.
    pub fn correct_accel(&self, raw: Vector3<f64>) -> Vector3<f64> {
        let ext = &self.calib.external;
        let temp_err = ext.accel_temp_slope * (self.last_temp - ext.temp_ref);
        ext.accel_scale * (raw - ext.accel_offset) - temp_err
    }

    /// Soft/hard iron correction: S_m · (m − h_m); when the per-motor
    /// interference polynomial is present, the field predicted from the
    /// current motor duties is removed first.
    pub fn correct_mag(&self, raw: Vector3<f64>, motor_duty: Option<&[f64; 4]>) -> Vector3<f64> {
        let ext = &self.calib.external;
        let mut m = raw;
        if let (Some(poly), Some(duty)) = (&ext.motor_field_poly, motor_duty) {
            for (coeffs, d) in poly.iter().zip(duty.iter()) {
                m -= coeffs[0] * (d * d) + coeffs[1] * *d + coeffs[2];
            }
        }
        ext.soft_iron * (m - ext.hard_iron)
    }

    /// Feed one raw event; returns the prepared measurement when one is
    /// complete. Inertial samples are emitted on accelerometer events using
    /// the latest gyro and magnetometer readings.
    pub fn feed(&mut self, evt: &SensorEvent) -> Option<Measurement> {
        match &evt.payload {
            SensorPayload::Accel(raw) => {
                if !self.have_gyro {
                    return None;
                }
                let corrected = self.correct_accel(accel_si(raw));
                let filtered = self.accel_fir.apply(Some(corrected));
                Some(Measurement::Imu(ImuSample {
                    timestamp: evt.timestamp,
                    accel: filtered,
                    accel_raw: corrected,
                    gyro: self.latest_gyro,
                    mag: self.latest_mag,
                }))
            }

            SensorPayload::Gyro(raw) => {
                // Prefer the delta-angle quotient: better noise at the cost
                // of group delay. Bad timestep or implausible quotient falls
                // back to the instantaneous register.
                let rate = match self.last_gyro.as_ref().and_then(|(ts, old)| {
                    gyro_delta_angle_rate(raw, evt.timestamp, old, *ts)
                }) {
                    Some(r) => r,
                    None => gyro_si(raw),
                };
                self.last_gyro = Some((evt.timestamp, *raw));

                let ext = &self.calib.external;
                let temp_err = ext.gyro_temp_slope * (self.last_temp - ext.temp_ref);
                let nivelled = rate - self.calib.gyro_bias - temp_err;
                self.latest_gyro = self.gyro_fir.apply(Some(nivelled));
                self.have_gyro = true;
                None
            }

            SensorPayload::Mag(raw) => {
                self.latest_mag = self.correct_mag(mag_units(raw), None);
                None
            }

            SensorPayload::Baro(raw) => {
                self.last_temp = raw.temp as f64 / 1e3;
                let pressure = raw.pressure as f64;
                // altitude above reference; NED z is its negation
                let alt = PRESS2ALT * (pressure / self.calib.base_pressure).ln();
                let ned_z = -alt;

                let out = match self.last_ned_z {
                    Some((last_ts, last_z)) if evt.timestamp > last_ts => {
                        let dt = (evt.timestamp - last_ts) as f64 / 1e6;
                        let dz = self.baro_dz_lpf.apply(ned_z - last_z);
                        let vz = self.baro_vz_lpf.apply((ned_z - last_z) / dt);
                        Some(Measurement::Baro(BaroDelta { timestamp: evt.timestamp, dz, vz }))
                    }
                    Some(_) => None,
                    None => None,
                };
                self.last_ned_z = Some((evt.timestamp, ned_z));
                out
            }

            SensorPayload::Gps(raw) => {
                let geo = Geodetic::from_raw(raw);
                let pos = self.calib.ref_geo.ned_of(&geo, &self.calib.ref_ecef);
                let vel = Vector3::new(
                    raw.vel_north as f64 / 1e3,
                    raw.vel_east as f64 / 1e3,
                    raw.vel_down as f64 / 1e3,
                );
                Some(Measurement::Gps(GpsFix {
                    timestamp: evt.timestamp,
                    pos,
                    vel,
                    lat: geo.lat,
                    lon: geo.lon,
                    hdop: raw.hdop as f64 / 1e2,
                    eph: raw.eph as f64 / 1e3,
                    epv: raw.epv as f64 / 1e3,
                    fix: raw.fix,
                    sats_nb: raw.sats_nb,
                }))
            }
        }
    }
}

// ─── Calibration acquisition ─────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct CalibrationConfig {
    pub imu_samples: usize,
    pub baro_samples: usize,
    pub gps_samples: usize,
    /// Largest acceptable horizontal dilution of precision for the
    /// reference-point fixes.
    pub hdop_limit: f64,
    pub external: ExternalCalib,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            imu_samples: 1000,
            baro_samples: 100,
            gps_samples: 10,
            hdop_limit: 5.0,
            external: ExternalCalib::default(),
        }
    }
}

/// Startup averaging with the vehicle stationary: initial attitude from
/// accel+mag, gyro bias, barometric reference, then the geodetic reference
/// point once the receiver reports a good-quality fix.
pub struct Calibrator {
    cfg: CalibrationConfig,

    accel_sum: Vector3<f64>,
    accel_cnt: usize,
    gyro_sum: Vector3<f64>,
    gyro_cnt: usize,
    mag_sum: Vector3<f64>,
    mag_cnt: usize,

    press_sum: f64,
    temp_sum: f64,
    baro_cnt: usize,

    geo_sum: (f64, f64, f64),
    gps_cnt: usize,

    last_gyro: Option<(u64, GyroRaw)>,
}

impl Calibrator {
    pub fn new(cfg: CalibrationConfig) -> Result<Self, CalibError> {
        cfg.external.validate()?;
        Ok(Self {
            cfg,
            accel_sum: Vector3::zeros(),
            accel_cnt: 0,
            gyro_sum: Vector3::zeros(),
            gyro_cnt: 0,
            mag_sum: Vector3::zeros(),
            mag_cnt: 0,
            press_sum: 0.0,
            temp_sum: 0.0,
            baro_cnt: 0,
            geo_sum: (0.0, 0.0, 0.0),
            gps_cnt: 0,
            last_gyro: None,
        })
    }

    pub fn stage(&self) -> &'static str {
        if self.accel_cnt < self.cfg.imu_samples
            || self.gyro_cnt < self.cfg.imu_samples
            || self.mag_cnt < self.cfg.imu_samples.min(100)
        {
            "imu"
        } else if self.baro_cnt < self.cfg.baro_samples {
            "baro"
        } else if self.gps_cnt < self.cfg.gps_samples {
            "gps"
        } else {
            "done"
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage() == "done"
    }

    /// Consume one event; returns true once every stage has enough samples.
    pub fn feed(&mut self, evt: &SensorEvent) -> bool {
        match &evt.payload {
            SensorPayload::Accel(raw) => {
                if self.accel_cnt < self.cfg.imu_samples {
                    let ext = &self.cfg.external;
                    self.accel_sum += ext.accel_scale * (accel_si(raw) - ext.accel_offset);
                    self.accel_cnt += 1;
                }
            }
            SensorPayload::Gyro(raw) => {
                if self.gyro_cnt < self.cfg.imu_samples {
                    let rate = match self.last_gyro.as_ref().and_then(|(ts, old)| {
                        gyro_delta_angle_rate(raw, evt.timestamp, old, *ts)
                    }) {
                        Some(r) => r,
                        None => gyro_si(raw),
                    };
                    self.gyro_sum += rate;
                    self.gyro_cnt += 1;
                }
                self.last_gyro = Some((evt.timestamp, *raw));
            }
            SensorPayload::Mag(raw) => {
                if self.mag_cnt < self.cfg.imu_samples.min(100) {
                    let ext = &self.cfg.external;
                    self.mag_sum += ext.soft_iron * (mag_units(raw) - ext.hard_iron);
                    self.mag_cnt += 1;
                }
            }
            SensorPayload::Baro(raw) => {
                // barometer only counts once the inertial averages are in
                if self.stage() == "baro" {
                    self.press_sum += raw.pressure as f64;
                    self.temp_sum += raw.temp as f64 / 1e3;
                    self.baro_cnt += 1;
                }
            }
            SensorPayload::Gps(raw) => {
                if self.stage() == "gps" {
                    if raw.fix == 0 || (raw.hdop as f64 / 1e2) > self.cfg.hdop_limit {
                        return false;
                    }
                    self.geo_sum.0 += raw.lat as f64 / 1e9;
                    self.geo_sum.1 += raw.lon as f64 / 1e9;
                    self.geo_sum.2 += raw.alt as f64 / 1e3;
                    self.gps_cnt += 1;
                }
            }
        }
        self.is_complete()
    }

    pub fn finish(self) -> Result<Calibration, CalibError> {
        if !self.is_complete() {
            return Err(CalibError::Interrupted(self.stage()));
        }

        let init_accel = self.accel_sum / self.accel_cnt as f64;
        let gyro_bias = self.gyro_sum / self.gyro_cnt as f64;
        let init_mag = self.mag_sum / self.mag_cnt as f64;

        // Initial attitude: the measured gravity direction and the
        // mag × accel east axis pin the body frame to NED.
        let acc_unit = init_accel.normalize();
        let body_east = unit_or_zero(init_mag.cross(&init_accel));
        let init_quat = Quat::frame_rot(&acc_unit, &body_east, &NED_G, &NED_EAST, Some(&Quat::IDENTITY));

        let ref_geo = Geodetic::new(
            self.geo_sum.0 / self.gps_cnt as f64,
            self.geo_sum.1 / self.gps_cnt as f64,
            self.geo_sum.2 / self.gps_cnt as f64,
        );
        let ref_ecef = ref_geo.to_ecef();

        info!(
            "meas: calibration complete, |g| = {:.4} m/s², ref ({:.7}, {:.7})",
            init_accel.norm(),
            ref_geo.lat,
            ref_geo.lon
        );

        Ok(Calibration {
            external: self.cfg.external,
            init_quat,
            gravity: init_accel.norm(),
            init_accel,
            init_mag,
            gyro_bias,
            base_pressure: self.press_sum / self.baro_cnt as f64,
            base_temp: self.temp_sum / self.baro_cnt as f64,
            ref_geo,
            ref_ecef,
        })
    }
}

fn unit_or_zero(v: Vector3<f64>) -> Vector3<f64> {
    let n = v.norm();
    if n > 0.0 { v / n } else { v }
}

/// Blocking acquisition loop used at startup. Bails out with an error when
/// the run flag is cleared, so startup stays interruptible.
pub fn acquire(
    client: &mut dyn SensorClient,
    cfg: CalibrationConfig,
    run: &AtomicBool,
) -> Result<Calibration, CalibError> {
    let mut calibrator = Calibrator::new(cfg)?;
    let mut last_stage = "";

    while !calibrator.is_complete() {
        if !run.load(Ordering::Relaxed) {
            return Err(CalibError::Interrupted(calibrator.stage()));
        }
        let stage = calibrator.stage();
        if stage != last_stage {
            info!("meas: calibration stage '{}'", stage);
            last_stage = stage;
        }
        if let Some(evt) = client.recv(Duration::from_millis(200)) {
            calibrator.feed(&evt);
        }
    }

    calibrator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn test_calibration() -> Calibration {
        let ref_geo = Geodetic::new(52.2297, 21.0122, 110.0);
        Calibration {
            external: ExternalCalib::default(),
            init_quat: Quat::IDENTITY,
            init_accel: Vector3::new(0.0, 0.0, EARTH_G),
            gravity: EARTH_G,
            init_mag: Vector3::new(1.0, 0.0, 0.0),
            gyro_bias: Vector3::zeros(),
            base_pressure: 101325.0,
            base_temp: 293.15,
            ref_ecef: ref_geo.to_ecef(),
            ref_geo,
        }
    }

    #[test]
    fn reference_point_maps_to_ned_origin() {
        let calib = test_calibration();
        let ned = calib.ref_geo.ned_of(&calib.ref_geo, &calib.ref_ecef);
        assert_eq!(ned.x, 0.0);
        assert_eq!(ned.y, 0.0);
        assert_eq!(ned.z, 0.0);
    }

    #[test]
    fn northward_displacement_maps_to_positive_x() {
        let calib = test_calibration();
        let north = Geodetic::new(calib.ref_geo.lat + 1e-4, calib.ref_geo.lon, calib.ref_geo.h);
        let ned = calib.ref_geo.ned_of(&north, &calib.ref_ecef);
        // 1e-4 degrees of latitude is roughly 11 metres
        assert!(ned.x > 10.0 && ned.x < 12.5, "ned.x = {}", ned.x);
        assert!(ned.y.abs() < 0.1);
        assert!(ned.z.abs() < 0.5);
    }

    #[test]
    fn altitude_maps_to_negative_ned_z() {
        let calib = test_calibration();
        let above = Geodetic::new(calib.ref_geo.lat, calib.ref_geo.lon, calib.ref_geo.h + 20.0);
        let ned = calib.ref_geo.ned_of(&above, &calib.ref_ecef);
        assert_abs_diff_eq!(ned.z, -20.0, epsilon = 0.05);
    }

    #[test]
    fn ellipsoid_correction_applied() {
        let mut external = ExternalCalib::default();
        external.accel_scale = Matrix3::new(2.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        external.accel_offset = Vector3::new(0.5, 0.0, 0.0);
        let mut calib = test_calibration();
        calib.external = external;
        let adapter = MeasAdapter::new(Arc::new(calib));

        let out = adapter.correct_accel(Vector3::new(1.5, 1.0, 2.0));
        assert_abs_diff_eq!(out.x, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.y, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn soft_iron_rejects_negative_diagonal() {
        let mut external = ExternalCalib::default();
        external.soft_iron[(1, 1)] = -0.5;
        assert!(matches!(
            external.validate(),
            Err(CalibError::NonPositiveDiagonal { matrix: "soft-iron" })
        ));
    }

    #[test]
    fn delta_angle_quotient_plain() {
        let old = GyroRaw { d_angle_x: 1_000_000, ..Default::default() };
        let new = GyroRaw { d_angle_x: 1_100_000, ..Default::default() };
        // 0.1 rad over 0.1 s
        let rate = gyro_delta_angle_rate(&new, 200_000, &old, 100_000).unwrap();
        assert_abs_diff_eq!(rate.x, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn delta_angle_quotient_handles_u32_wrap() {
        let old = GyroRaw { d_angle_y: u32::MAX - 50_000, ..Default::default() };
        let new = GyroRaw { d_angle_y: 50_000, ..Default::default() };
        let rate = gyro_delta_angle_rate(&new, 1_100_000, &old, 1_000_000).unwrap();
        // forward wrap of 100_001 µrad over 0.1 s
        assert_abs_diff_eq!(rate.y, 1.00001, epsilon = 1e-9);

        // and a backward (negative) wrap
        let rate = gyro_delta_angle_rate(&old, 1_100_000, &new, 1_000_000).unwrap();
        assert_abs_diff_eq!(rate.y, -1.00001, epsilon = 1e-9);
    }

    #[test]
    fn delta_angle_quotient_rejects_insane_rate() {
        let old = GyroRaw::default();
        let new = GyroRaw { d_angle_z: 200_000_000, ..Default::default() };
        // 200 rad over 1 ms is far beyond 50π rad/s
        assert!(gyro_delta_angle_rate(&new, 2_000, &old, 1_000).is_none());
    }

    #[test]
    fn baro_emits_delta_not_absolute() {
        let calib = test_calibration();
        let mut adapter = MeasAdapter::new(Arc::new(calib));

        let evt = |ts: u64, p: u32| SensorEvent {
            timestamp: ts,
            device_id: 0,
            payload: SensorPayload::Baro(BaroRaw { pressure: p, temp: 293_150 }),
        };

        // first sample only primes the memory
        assert!(adapter.feed(&evt(1_000_000, 101_325)).is_none());

        // pressure drop of ~12 Pa is roughly +1 m of altitude, i.e. -1 m NED z
        let m = adapter.feed(&evt(2_000_000, 101_313)).unwrap();
        match m {
            Measurement::Baro(delta) => {
                assert!(delta.dz < -0.5 && delta.dz > -1.5, "dz = {}", delta.dz);
                assert!(delta.vz < 0.0);
            }
            _ => panic!("expected baro measurement"),
        }
    }

    #[test]
    fn imu_sample_waits_for_gyro() {
        let calib = test_calibration();
        let mut adapter = MeasAdapter::new(Arc::new(calib));

        let accel_evt = SensorEvent {
            timestamp: 1000,
            device_id: 0,
            payload: SensorPayload::Accel(AccelRaw { accel_x: 0, accel_y: 0, accel_z: 9807 }),
        };
        assert!(adapter.feed(&accel_evt).is_none());

        let gyro_evt = SensorEvent {
            timestamp: 1100,
            device_id: 0,
            payload: SensorPayload::Gyro(GyroRaw::default()),
        };
        assert!(adapter.feed(&gyro_evt).is_none());

        match adapter.feed(&accel_evt) {
            Some(Measurement::Imu(imu)) => {
                // single FIR tap of a constant input
                assert!(imu.accel.z > 0.0);
                assert_abs_diff_eq!(imu.accel_raw.z, 9.807, epsilon = 1e-9);
            }
            other => panic!("expected imu sample, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn calibrator_produces_level_attitude_from_level_data() {
        let mut cfg = CalibrationConfig::default();
        cfg.imu_samples = 10;
        cfg.baro_samples = 5;
        cfg.gps_samples = 3;
        let mut cal = Calibrator::new(cfg).unwrap();

        let mut ts = 1_000u64;
        let mut evt = |payload: SensorPayload| {
            ts += 1_000;
            SensorEvent { timestamp: ts, device_id: 0, payload }
        };

        // 0.01 rad/s about x: the integrated-angle register grows 30 µrad
        // per 3 ms gyro sample, matching the instantaneous field
        let mut d_angle_x = 0u32;
        for _ in 0..10 {
            cal.feed(&evt(SensorPayload::Accel(AccelRaw { accel_x: 0, accel_y: 0, accel_z: -9807 })));
            d_angle_x += 30;
            cal.feed(&evt(SensorPayload::Gyro(GyroRaw { gyro_x: 10, d_angle_x, ..Default::default() })));
            cal.feed(&evt(SensorPayload::Mag(MagRaw { mag_x: 300, mag_y: 0, mag_z: -200 })));
        }
        for _ in 0..5 {
            cal.feed(&evt(SensorPayload::Baro(BaroRaw { pressure: 101_325, temp: 293_150 })));
        }
        for _ in 0..3 {
            cal.feed(&evt(SensorPayload::Gps(GpsRaw {
                lat: 52_229_700_000,
                lon: 21_012_200_000,
                alt: 110_000,
                hdop: 120,
                fix: 3,
                sats_nb: 9,
                ..Default::default()
            })));
        }

        assert!(cal.is_complete());
        let calib = cal.finish().unwrap();

        // a vehicle at rest measuring specific force (0, 0, -g) in the body
        // frame is aligned with NED gravity: attitude close to identity
        let (roll, pitch, _) = calib.init_quat.to_euler();
        assert_abs_diff_eq!(roll, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(pitch, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(calib.gravity, 9.807, epsilon = 1e-9);
        assert_abs_diff_eq!(calib.gyro_bias.x, 0.01, epsilon = 1e-9);
        assert_abs_diff_eq!(calib.base_pressure, 101_325.0, epsilon = 1e-9);
        assert_abs_diff_eq!(calib.ref_geo.lat, 52.2297, epsilon = 1e-9);
    }

    #[test]
    fn gps_fix_converts_reference_to_origin() {
        let calib = test_calibration();
        let mut adapter = MeasAdapter::new(Arc::new(calib));
        let evt = SensorEvent {
            timestamp: 5_000_000,
            device_id: 0,
            payload: SensorPayload::Gps(GpsRaw {
                lat: 52_229_700_000,
                lon: 21_012_200_000,
                alt: 110_000,
                vel_north: 1_500,
                vel_east: -500,
                vel_down: 0,
                hdop: 150,
                fix: 3,
                sats_nb: 11,
                ..Default::default()
            }),
        };
        match adapter.feed(&evt) {
            Some(Measurement::Gps(fix)) => {
                assert_abs_diff_eq!(fix.pos.x, 0.0, epsilon = 1e-6);
                assert_abs_diff_eq!(fix.pos.y, 0.0, epsilon = 1e-6);
                assert_abs_diff_eq!(fix.vel.x, 1.5, epsilon = 1e-12);
                assert_abs_diff_eq!(fix.vel.y, -0.5, epsilon = 1e-12);
                assert_abs_diff_eq!(fix.hdop, 1.5, epsilon = 1e-12);
            }
            _ => panic!("expected gps measurement"),
        }
    }
}
