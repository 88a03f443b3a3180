// ekf/gps — satellite-navigation update (4 rows): horizontal NED position
// and velocity. Measurement noise scales with the reported dilution of
// precision, clamped so a single optimistic fix can never collapse the
// covariance.

use crate::algebra::Matrix;
use crate::meas::GpsFix;

use super::core::{MeasModel, UpdateEngine};
use super::model::{EkfTuning, RX, RY, STATE_LEN, VX, VY};

pub const MGPSX: usize = 0;
pub const MGPSY: usize = 1;
pub const MGPSVX: usize = 2;
pub const MGPSVY: usize = 3;

pub const GPS_MEAS_LEN: usize = 4;

pub struct GpsModel;

pub struct GpsEngine {
    pub update: UpdateEngine,
    pub model: GpsModel,
    hdop_scale: f64,
    pos_var_min: f64,
    pos_var_max: f64,
}

impl GpsEngine {
    pub fn new(tuning: &EkfTuning) -> Self {
        let mut update = UpdateEngine::new(STATE_LEN, GPS_MEAS_LEN);
        update.r.set(MGPSVX, MGPSVX, tuning.gps_vel_var);
        update.r.set(MGPSVY, MGPSVY, tuning.gps_vel_var);
        Self {
            update,
            model: GpsModel,
            hdop_scale: tuning.gps_hdop_scale,
            pos_var_min: tuning.gps_pos_var_min,
            pos_var_max: tuning.gps_pos_var_max,
        }
    }

    /// Fill Z and the live position noise from one fix. Fixes without a
    /// position solution are rejected.
    pub fn fill(&mut self, fix: &GpsFix) -> bool {
        if fix.fix == 0 {
            return false;
        }

        self.update.z.vec_set(MGPSX, fix.pos.x);
        self.update.z.vec_set(MGPSY, fix.pos.y);
        self.update.z.vec_set(MGPSVX, fix.vel.x);
        self.update.z.vec_set(MGPSVY, fix.vel.y);

        let pos_var = (self.hdop_scale * fix.hdop).clamp(self.pos_var_min, self.pos_var_max);
        self.update.r.set(MGPSX, MGPSX, pos_var);
        self.update.r.set(MGPSY, MGPSY, pos_var);
        true
    }
}

impl MeasModel for GpsModel {
    fn predict_meas(&self, state_est: &Matrix, hx: &mut Matrix, _dt: f64) {
        hx.vec_set(MGPSX, state_est.vec_at(RX));
        hx.vec_set(MGPSY, state_est.vec_at(RY));
        hx.vec_set(MGPSVX, state_est.vec_at(VX));
        hx.vec_set(MGPSVY, state_est.vec_at(VY));
    }

    fn jacobian(&self, h: &mut Matrix, _state_est: &Matrix, _dt: f64) {
        h.zero();
        h.set(MGPSX, RX, 1.0);
        h.set(MGPSY, RY, 1.0);
        h.set(MGPSVX, VX, 1.0);
        h.set(MGPSVY, VY, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::Quat;
    use crate::ekf::core::StateEngine;
    use crate::ekf::model::{QuadModel, CTRL_LEN, UAZ};
    use crate::meas::{Calibration, ExternalCalib, Geodetic, EARTH_G};
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn calib() -> Calibration {
        let ref_geo = Geodetic::new(52.0, 21.0, 100.0);
        Calibration {
            external: ExternalCalib::default(),
            init_quat: Quat::IDENTITY,
            init_accel: Vector3::new(0.0, 0.0, -EARTH_G),
            gravity: EARTH_G,
            init_mag: Vector3::new(22.0, 0.0, -41.0),
            gyro_bias: Vector3::zeros(),
            base_pressure: 101_325.0,
            base_temp: 293.15,
            ref_ecef: ref_geo.to_ecef(),
            ref_geo,
        }
    }

    fn fix(x: f64, y: f64, hdop: f64) -> GpsFix {
        GpsFix {
            timestamp: 1_000_000,
            pos: Vector3::new(x, y, 0.0),
            vel: Vector3::zeros(),
            lat: 52.0,
            lon: 21.0,
            hdop,
            eph: 1.0,
            epv: 1.5,
            fix: 3,
            sats_nb: 10,
        }
    }

    #[test]
    fn position_converges_to_fixes() {
        let c = calib();
        let tuning = EkfTuning::default();
        let model = QuadModel::new(&c, tuning.clone());
        let mut eng = StateEngine::new(STATE_LEN, CTRL_LEN);
        model.init_state(&mut eng.state, &c);
        model.init_cov(&mut eng.cov);
        eng.u.vec_set(UAZ, -EARTH_G);

        let mut gps = GpsEngine::new(&tuning);
        for _ in 0..200 {
            eng.predict(&model, 0.001);
            assert!(gps.fill(&fix(4.0, -2.0, 0.8)));
            gps.update.apply(&mut eng, &model, &gps.model, 0.001);
        }

        assert_abs_diff_eq!(eng.state.vec_at(RX), 4.0, epsilon = 0.1);
        assert_abs_diff_eq!(eng.state.vec_at(RY), -2.0, epsilon = 0.1);
    }

    #[test]
    fn hdop_scales_and_clamps_noise() {
        let tuning = EkfTuning::default();
        let mut gps = GpsEngine::new(&tuning);

        gps.fill(&fix(0.0, 0.0, 2.0));
        assert_abs_diff_eq!(gps.update.r.at(MGPSX, MGPSX), 6.0, epsilon = 1e-12);

        // far below the floor
        gps.fill(&fix(0.0, 0.0, 0.01));
        assert_abs_diff_eq!(gps.update.r.at(MGPSX, MGPSX), tuning.gps_pos_var_min, epsilon = 1e-12);

        // far above the ceiling
        gps.fill(&fix(0.0, 0.0, 1e4));
        assert_abs_diff_eq!(gps.update.r.at(MGPSX, MGPSX), tuning.gps_pos_var_max, epsilon = 1e-12);
    }

    #[test]
    fn fix_quality_zero_is_rejected() {
        let mut gps = GpsEngine::new(&EkfTuning::default());
        let mut f = fix(1.0, 1.0, 1.0);
        f.fix = 0;
        assert!(!gps.fill(&f));
    }
}
