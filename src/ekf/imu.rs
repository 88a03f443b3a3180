// ekf/imu — inertial measurement update (14 rows).
//
// Row layout: accel in NED with gravity removed (3), body angular rate (3),
// body magnetic field (3), instantaneous attitude quaternion (4), and the
// accelerometer-z bias prior (1). The attitude rows carry the real
// information: a frame-alignment quaternion computed from the normalised
// accel and mag vectors, de-weighted whenever the vehicle is manoeuvring.

use nalgebra::Vector3;

use crate::algebra::{Matrix, Quat};
use crate::meas::{Calibration, ImuSample, NED_EAST, NED_G};

use super::core::{MeasModel, UpdateEngine};
use super::model::{
    qpq_diff_p, qpq_diff_q, state_quat, state_vec3, EkfTuning, BAX, BAZ, BWX, QA, STATE_LEN,
};

pub const MAX: usize = 0;
pub const MAY: usize = 1;
pub const MAZ: usize = 2;
pub const MWX: usize = 3;
pub const MWY: usize = 4;
pub const MWZ: usize = 5;
pub const MMX: usize = 6;
pub const MMY: usize = 7;
pub const MMZ: usize = 8;
pub const MQA: usize = 9;
pub const MQB: usize = 10;
pub const MQC: usize = 11;
pub const MQD: usize = 12;
pub const MBAZ: usize = 13;

pub const IMU_MEAS_LEN: usize = 14;

pub struct ImuModel {
    /// Reference magnetic field in NED, from the calibration attitude and
    /// the averaged stationary magnetometer reading.
    mag_ned: Vector3<f64>,
    gravity: f64,
}

pub struct ImuEngine {
    pub update: UpdateEngine,
    pub model: ImuModel,
    base_r_w: f64,
}

impl ImuEngine {
    pub fn new(calib: &Calibration, tuning: &EkfTuning) -> Self {
        let mut update = UpdateEngine::new(STATE_LEN, IMU_MEAS_LEN);

        for row in MAX..=MAZ {
            update.r.set(row, row, tuning.r_astdev * tuning.r_astdev);
        }
        for row in MWX..=MWZ {
            update.r.set(row, row, tuning.r_wstdev * tuning.r_wstdev);
        }
        for row in MMX..=MMZ {
            update.r.set(row, row, tuning.r_mstdev * tuning.r_mstdev);
        }
        // quaternion rows are adaptive, rewritten every sample
        update.r.set(MBAZ, MBAZ, tuning.r_bzstdev * tuning.r_bzstdev);

        Self {
            update,
            model: ImuModel {
                mag_ned: calib.init_quat.rotate(&calib.init_mag),
                gravity: calib.gravity,
            },
            base_r_w: tuning.r_wstdev * tuning.r_wstdev,
        }
    }

    /// Fill Z and the adaptive R entries from one prepared inertial sample.
    pub fn fill(&mut self, sample: &ImuSample, state: &Matrix) {
        let q_state = state_quat(state);

        // acceleration rotated to NED with the gravity reaction removed;
        // zero for an unaccelerated vehicle
        let mut a_ned = q_state.rotate(&sample.accel);
        a_ned.z += self.model.gravity;

        // attitude error grows with non-gravitational acceleration and with
        // angular rate; the constants are empirically fitted
        let g_dev = a_ned.norm();
        let q_err = 0.1 + 100.0 * g_dev * g_dev + 10.0 * sample.gyro.norm();

        // instantaneous attitude: measured gravity direction and the
        // mag × accel east axis pinned onto the NED versors, hemisphere
        // picked by the current state estimate
        let acc_unit = unit_or(sample.accel, NED_G);
        let east_unit = unit_or(sample.mag.cross(&sample.accel), NED_EAST);
        let q_est = Quat::frame_rot(&acc_unit, &east_unit, &NED_G, &NED_EAST, Some(&q_state));

        let z = &mut self.update.z;
        z.vec_set(MAX, a_ned.x);
        z.vec_set(MAY, a_ned.y);
        z.vec_set(MAZ, a_ned.z);
        z.vec_set(MWX, sample.gyro.x);
        z.vec_set(MWY, sample.gyro.y);
        z.vec_set(MWZ, sample.gyro.z);
        z.vec_set(MMX, sample.mag.x);
        z.vec_set(MMY, sample.mag.y);
        z.vec_set(MMZ, sample.mag.z);
        z.vec_set(MQA, q_est.a);
        z.vec_set(MQB, q_est.i);
        z.vec_set(MQC, q_est.j);
        z.vec_set(MQD, q_est.k);
        z.vec_set(MBAZ, 0.0);

        for row in MQA..=MQD {
            self.update.r.set(row, row, q_err);
        }
        // rate rows estimate the residual gyro bias; trust them only when
        // the vehicle is close to stationary
        for row in MWX..=MWZ {
            self.update.r.set(row, row, self.base_r_w + q_err);
        }
    }
}

impl MeasModel for ImuModel {
    fn predict_meas(&self, state_est: &Matrix, hx: &mut Matrix, _dt: f64) {
        let q = state_quat(state_est);
        let bw = state_vec3(state_est, BWX);
        let ba = state_vec3(state_est, BAX);

        // predicted NED acceleration residual is what the bias explains
        let a_pred = q.rotate(&ba);
        hx.vec_set(MAX, a_pred.x);
        hx.vec_set(MAY, a_pred.y);
        hx.vec_set(MAZ, a_pred.z);

        hx.vec_set(MWX, bw.x);
        hx.vec_set(MWY, bw.y);
        hx.vec_set(MWZ, bw.z);

        let m_pred = q.conj().rotate(&self.mag_ned);
        hx.vec_set(MMX, m_pred.x);
        hx.vec_set(MMY, m_pred.y);
        hx.vec_set(MMZ, m_pred.z);

        hx.vec_set(MQA, state_est.vec_at(QA));
        hx.vec_set(MQB, state_est.vec_at(QA + 1));
        hx.vec_set(MQC, state_est.vec_at(QA + 2));
        hx.vec_set(MQD, state_est.vec_at(QA + 3));

        hx.vec_set(MBAZ, state_est.vec_at(BAZ));
    }

    fn jacobian(&self, h: &mut Matrix, state_est: &Matrix, _dt: f64) {
        let q = state_quat(state_est);
        let ba = state_vec3(state_est, BAX);

        h.zero();

        // accel rows: ∂(R(q)·ba)/∂q and ∂(R(q)·ba)/∂ba
        let mut dadq = Matrix::zeros(3, 4);
        qpq_diff_q(&q, &ba, &mut dadq);
        dadq.scale(2.0);
        h.write_submatrix(MAX, QA, &dadq);

        let mut dadba = Matrix::zeros(3, 3);
        qpq_diff_p(&q, &mut dadba);
        h.write_submatrix(MAX, BAX, &dadba);

        // rate rows observe the gyro bias directly
        for i in 0..3 {
            h.set(MWX + i, BWX + i, 1.0);
        }

        // mag rows: ∂(R(q*)·m_ned)/∂q, via the conjugate chain rule
        let qc = q.conj();
        let mut dmdqc = Matrix::zeros(3, 4);
        qpq_diff_q(&qc, &self.mag_ned, &mut dmdqc);
        dmdqc.scale(2.0);
        for r in 0..3 {
            h.set(MMX + r, QA, dmdqc.at(r, 0));
            for c in 1..4 {
                h.set(MMX + r, QA + c, -dmdqc.at(r, c));
            }
        }

        // quaternion rows are direct observations
        for i in 0..4 {
            h.set(MQA + i, QA + i, 1.0);
        }

        h.set(MBAZ, BAZ, 1.0);
    }
}

fn unit_or(v: Vector3<f64>, fallback: Vector3<f64>) -> Vector3<f64> {
    let n = v.norm();
    if n > 0.0 { v / n } else { fallback }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ekf::core::StateEngine;
    use crate::ekf::model::{QuadModel, CTRL_LEN, UAZ, VZ};
    use crate::meas::{Calibration, ExternalCalib, Geodetic, EARTH_G};
    use approx::assert_abs_diff_eq;

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

    fn stationary_sample(c: &Calibration) -> ImuSample {
        ImuSample {
            timestamp: 1_000,
            accel: Vector3::new(0.0, 0.0, -EARTH_G),
            accel_raw: Vector3::new(0.0, 0.0, -EARTH_G),
            gyro: Vector3::zeros(),
            mag: c.init_mag,
        }
    }

    fn setup() -> (QuadModel, StateEngine, ImuEngine) {
        let c = calib();
        let tuning = EkfTuning::default();
        let model = QuadModel::new(&c, tuning.clone());
        let mut eng = StateEngine::new(STATE_LEN, CTRL_LEN);
        model.init_state(&mut eng.state, &c);
        model.init_cov(&mut eng.cov);
        eng.u.vec_set(UAZ, -EARTH_G);
        let imu = ImuEngine::new(&c, &tuning);
        (model, eng, imu)
    }

    #[test]
    fn stationary_update_keeps_level_attitude() {
        let (model, mut eng, mut imu) = setup();
        let sample = stationary_sample(&calib());

        for _ in 0..200 {
            eng.predict(&model, 0.001);
            imu.fill(&sample, &eng.state);
            assert!(imu.update.apply(&mut eng, &model, &imu.model, 0.001));
        }

        let q = state_quat(&eng.state);
        assert_abs_diff_eq!(q.norm(), 1.0, epsilon = 1e-6);
        let (roll, pitch, yaw) = q.to_euler();
        assert_abs_diff_eq!(roll, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(pitch, 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(yaw, 0.0, epsilon = 1e-3);
        assert_eq!(imu.update.skipped, 0);
    }

    #[test]
    fn attitude_converges_from_wrong_initial_guess() {
        let (model, mut eng, mut imu) = setup();

        // filter believes it is yawed 0.3 rad; sensors say otherwise
        let wrong = Quat::from_axis_angle(&Vector3::z(), 0.3);
        eng.state.vec_set(QA, wrong.a);
        eng.state.vec_set(QA + 1, wrong.i);
        eng.state.vec_set(QA + 2, wrong.j);
        eng.state.vec_set(QA + 3, wrong.k);

        let sample = stationary_sample(&calib());
        for _ in 0..2000 {
            eng.predict(&model, 0.001);
            imu.fill(&sample, &eng.state);
            imu.update.apply(&mut eng, &model, &imu.model, 0.001);
        }

        let (_, _, yaw) = state_quat(&eng.state).to_euler();
        assert_abs_diff_eq!(yaw, 0.0, epsilon = 0.02);
    }

    #[test]
    fn attitude_noise_inflates_under_manoeuvre() {
        let (_, eng, mut imu) = setup();
        let c = calib();

        let still = stationary_sample(&c);
        imu.fill(&still, &eng.state);
        let r_still = imu.update.r.at(MQA, MQA);

        let moving = ImuSample {
            gyro: Vector3::new(2.0, 0.0, 0.0),
            accel: Vector3::new(3.0, 0.0, -EARTH_G),
            ..still
        };
        imu.fill(&moving, &eng.state);
        let r_moving = imu.update.r.at(MQA, MQA);

        assert!(r_moving > 10.0 * r_still, "{} vs {}", r_moving, r_still);
    }

    #[test]
    fn baz_prior_pulls_bias_back_to_zero() {
        let (model, mut eng, mut imu) = setup();
        eng.state.vec_set(BAZ, 0.4);

        let sample = stationary_sample(&calib());
        for _ in 0..2000 {
            eng.predict(&model, 0.001);
            imu.fill(&sample, &eng.state);
            imu.update.apply(&mut eng, &model, &imu.model, 0.001);
        }

        assert!(eng.state.vec_at(BAZ).abs() < 0.1, "baz = {}", eng.state.vec_at(BAZ));
    }

    #[test]
    fn velocity_stays_bounded_during_stationary_updates() {
        let (model, mut eng, mut imu) = setup();
        let sample = stationary_sample(&calib());

        for _ in 0..3000 {
            eng.predict(&model, 0.001);
            imu.fill(&sample, &eng.state);
            imu.update.apply(&mut eng, &model, &imu.model, 0.001);
        }
        assert!(eng.state.vec_at(VZ).abs() < 0.2);
    }
}
