// ekf/model — the quadrotor state layout and process model.
//
// State vector (17 rows, one reserved):
//   0..3   q   attitude quaternion, body to NED
//   4..6   bw  gyro bias, rad/s
//   7..9   v   velocity in NED, m/s
//   10..12 ba  accelerometer bias, m/s²
//   13..15 r   position in NED, m
//   16     reserved

use nalgebra::Vector3;

use crate::algebra::{Matrix, Quat};
use crate::meas::Calibration;

use super::core::ProcessModel;

pub const QA: usize = 0;
pub const QB: usize = 1;
pub const QC: usize = 2;
pub const QD: usize = 3;
pub const BWX: usize = 4;
pub const BWY: usize = 5;
pub const BWZ: usize = 6;
pub const VX: usize = 7;
pub const VY: usize = 8;
pub const VZ: usize = 9;
pub const BAX: usize = 10;
pub const BAY: usize = 11;
pub const BAZ: usize = 12;
pub const RX: usize = 13;
pub const RY: usize = 14;
pub const RZ: usize = 15;

pub const STATE_LEN: usize = 17;

/// Control vector: latest calibrated IMU reading in the body frame.
pub const UWX: usize = 0;
pub const UWY: usize = 1;
pub const UWZ: usize = 2;
pub const UAX: usize = 3;
pub const UAY: usize = 4;
pub const UAZ: usize = 5;

pub const CTRL_LEN: usize = 6;

/// Filter tuning. Standard deviations, not variances; squared where used.
#[derive(Clone, Debug)]
pub struct EkfTuning {
    pub p_qerr: f64,
    pub p_bwerr: f64,
    pub p_verr: f64,
    pub p_baerr: f64,
    pub p_rerr: f64,

    pub r_astdev: f64,
    pub r_wstdev: f64,
    pub r_mstdev: f64,
    pub r_bzstdev: f64,

    pub r_dzstdev: f64,
    pub r_vzstdev: f64,

    /// GPS position variance = hdop_scale · hdop, clamped to the band below.
    pub gps_hdop_scale: f64,
    pub gps_pos_var_min: f64,
    pub gps_pos_var_max: f64,
    pub gps_vel_var: f64,

    pub q_wstdev: f64,
    pub q_astdev: f64,
    pub q_bwdotstdev: f64,
    pub q_badotstdev: f64,
    pub q_rstdev: f64,

    /// When set, position is propagated from velocity each prediction;
    /// otherwise the position rows move only on GPS updates.
    pub integrate_position: bool,
}

impl Default for EkfTuning {
    fn default() -> Self {
        Self {
            p_qerr: 10.0_f64.to_radians(),
            p_bwerr: 1.0,
            p_verr: 1.0,
            p_baerr: 1.0,
            p_rerr: 1.0,

            r_astdev: 0.1,
            r_wstdev: 0.01,
            r_mstdev: 1.0,
            r_bzstdev: 0.1,

            r_dzstdev: 0.02,
            r_vzstdev: 0.2,

            gps_hdop_scale: 3.0,
            gps_pos_var_min: 1.0,
            gps_pos_var_max: 500.0,
            gps_vel_var: 2.0,

            q_wstdev: 0.9,
            q_astdev: 1.0,
            q_bwdotstdev: 0.001,
            q_badotstdev: 0.001,
            q_rstdev: 0.1,

            integrate_position: false,
        }
    }
}

pub fn state_quat(state: &Matrix) -> Quat {
    Quat::new(state.vec_at(QA), state.vec_at(QB), state.vec_at(QC), state.vec_at(QD))
}

pub fn state_vec3(state: &Matrix, base: usize) -> Vector3<f64> {
    Vector3::new(state.vec_at(base), state.vec_at(base + 1), state.vec_at(base + 2))
}

fn write_vec3(state: &mut Matrix, base: usize, v: &Vector3<f64>) {
    state.vec_set(base, v.x);
    state.vec_set(base + 1, v.y);
    state.vec_set(base + 2, v.z);
}

pub struct QuadModel {
    tuning: EkfTuning,
    /// Local gravity magnitude measured during calibration.
    gravity: f64,
}

impl QuadModel {
    pub fn new(calib: &Calibration, tuning: EkfTuning) -> Self {
        Self { gravity: calib.gravity, tuning }
    }

    pub fn tuning(&self) -> &EkfTuning {
        &self.tuning
    }

    pub fn gravity(&self) -> f64 {
        self.gravity
    }

    /// Initial state: calibration attitude, calibration gyro bias, all else
    /// zero (the vehicle starts at the NED origin, at rest).
    pub fn init_state(&self, state: &mut Matrix, calib: &Calibration) {
        state.zero();
        state.vec_set(QA, calib.init_quat.a);
        state.vec_set(QB, calib.init_quat.i);
        state.vec_set(QC, calib.init_quat.j);
        state.vec_set(QD, calib.init_quat.k);
        // the adapter already nivels the gyro with the calibration bias, so
        // the state tracks only the residual
        write_vec3(state, BWX, &Vector3::zeros());
    }

    pub fn init_cov(&self, cov: &mut Matrix) {
        let t = &self.tuning;
        cov.zero();
        for idx in QA..=QD {
            cov.set(idx, idx, t.p_qerr * t.p_qerr);
        }
        for idx in BWX..=BWZ {
            cov.set(idx, idx, t.p_bwerr * t.p_bwerr);
        }
        for idx in VX..=VZ {
            cov.set(idx, idx, t.p_verr * t.p_verr);
        }
        for idx in BAX..=BAZ {
            cov.set(idx, idx, t.p_baerr * t.p_baerr);
        }
        for idx in RX..=RZ {
            cov.set(idx, idx, t.p_rerr * t.p_rerr);
        }
    }
}

// ─── Quaternion derivative blocks ────────────────────────────────────────────

/// 3×3 cross-product matrix [v]× so that [v]×·p = v × p.
fn cross_mat(v: &Vector3<f64>, out: &mut Matrix) {
    out.set(0, 0, 0.0);
    out.set(1, 1, 0.0);
    out.set(2, 2, 0.0);
    out.set(2, 1, v.x);
    out.set(1, 2, -v.x);
    out.set(0, 2, v.y);
    out.set(2, 0, -v.y);
    out.set(1, 0, v.z);
    out.set(0, 1, -v.z);
}

/// Half of d(q ⊗ p ⊗ q*)/dq for a fixed vector p, written into a 3×4
/// matrix. Callers double it (and scale by Δt) when assembling F.
pub fn qpq_diff_q(q: &Quat, p: &Vector3<f64>, out: &mut Matrix) {
    let qv = q.imag();
    let pxq = p.cross(&qv);

    let mut p_cross = Matrix::zeros(3, 3);
    let mut buf = Matrix::zeros(3, 3);
    cross_mat(p, &mut p_cross);
    cross_mat(&pxq, &mut buf);

    p_cross.scale(q.a);
    buf.sub_assign(&p_cross);
    let diag = p.dot(&qv);
    buf.set(0, 0, diag);
    buf.set(1, 1, diag);
    buf.set(2, 2, diag);

    out.write_submatrix(0, 1, &buf);
    out.set(0, 0, q.a * p.x - pxq.x);
    out.set(1, 0, q.a * p.y - pxq.y);
    out.set(2, 0, q.a * p.z - pxq.z);
}

/// d(q ⊗ p ⊗ q*)/dp, the 3×3 rotation matrix of q.
pub fn qpq_diff_p(q: &Quat, out: &mut Matrix) {
    let qv = q.imag();

    cross_mat(&qv, out);
    out.scale(2.0 * q.a);
    let diag = q.a * q.a - qv.dot(&qv);
    out.set(0, 0, diag);
    out.set(1, 1, diag);
    out.set(2, 2, diag);

    for r in 0..3 {
        for c in 0..3 {
            out.add_at(r, c, 2.0 * qv[r] * qv[c]);
        }
    }
}

/// d(q ⊗ p)/dq, the 4×4 right-multiplication matrix of p.
pub fn qp_diff_q(p: &Quat, out: &mut Matrix) {
    out.set(0, 0, p.a);
    out.set(1, 1, p.a);
    out.set(2, 2, p.a);
    out.set(3, 3, p.a);

    out.set(1, 0, p.i);
    out.set(2, 3, p.i);
    out.set(0, 1, -p.i);
    out.set(3, 2, -p.i);

    out.set(2, 0, p.j);
    out.set(3, 1, p.j);
    out.set(0, 2, -p.j);
    out.set(1, 3, -p.j);

    out.set(3, 0, p.k);
    out.set(1, 2, p.k);
    out.set(0, 3, -p.k);
    out.set(2, 1, -p.k);
}

/// d(q ⊗ w)/dw for a quaternionised vector w, written into a 4×3 matrix.
pub fn qw_diff_w(q: &Quat, out: &mut Matrix) {
    out.set(1, 0, q.a);
    out.set(2, 1, q.a);
    out.set(3, 2, q.a);

    out.set(3, 1, q.i);
    out.set(0, 0, -q.i);
    out.set(2, 2, -q.i);

    out.set(1, 2, q.j);
    out.set(0, 1, -q.j);
    out.set(3, 0, -q.j);

    out.set(2, 0, q.k);
    out.set(0, 2, -q.k);
    out.set(1, 1, -q.k);
}

// ─── Process model ───────────────────────────────────────────────────────────

impl ProcessModel for QuadModel {
    fn estimate(&self, state: &Matrix, state_est: &mut Matrix, u: &Matrix, dt: f64) {
        let q = state_quat(state);
        let bw = state_vec3(state, BWX);
        let v = state_vec3(state, VX);
        let ba = state_vec3(state, BAX);
        let r = state_vec3(state, RX);

        let w_meas = state_vec3(u, UWX);
        let a_meas = state_vec3(u, UAX);

        // q̂ = q ⊗ (1 ⊕ ½·Δt·(ω − bw)), renormalised
        let mut dq = Quat::from_vec(&(w_meas - bw));
        dq.scale(dt / 2.0);
        dq.a += 1.0;
        let mut q_est = q.mul(&dq);
        q_est.normalize();

        state_est.vec_set(QA, q_est.a);
        state_est.vec_set(QB, q_est.i);
        state_est.vec_set(QC, q_est.j);
        state_est.vec_set(QD, q_est.k);

        // biases are random walks: identity transition
        write_vec3(state_est, BWX, &bw);
        write_vec3(state_est, BAX, &ba);

        // v̂ = v + (R(q)·(a − ba) + g_comp)·Δt; the measured specific force
        // carries the reaction to gravity, cancelled here with the gravity
        // magnitude observed during calibration.
        let mut a_ned = q.rotate(&(a_meas - ba));
        a_ned.z += self.gravity;
        write_vec3(state_est, VX, &(v + a_ned * dt));

        // position: constant between GPS updates unless integration is on
        if self.tuning.integrate_position {
            write_vec3(state_est, RX, &(r + v * dt));
        } else {
            write_vec3(state_est, RX, &r);
        }

        state_est.vec_set(STATE_LEN - 1, 0.0);
    }

    fn jacobian(&self, f: &mut Matrix, state: &Matrix, u: &Matrix, dt: f64) {
        let q = state_quat(state);
        let bw = state_vec3(state, BWX);
        let ba = state_vec3(state, BAX);
        let w_meas = state_vec3(u, UWX);
        let a_meas = state_vec3(u, UAX);

        // ∂f_q/∂q: right-multiplication matrix of the small-angle quaternion
        let mut p = Quat::from_vec(&(w_meas - bw));
        p.scale(dt / 2.0);
        p.a += 1.0;
        let mut dfqdq = Matrix::zeros(4, 4);
        qp_diff_q(&p, &mut dfqdq);
        f.write_submatrix(QA, QA, &dfqdq);

        // ∂f_q/∂bw = -½·Δt·(left multiplication of q, imaginary columns)
        let mut dfqdbw = Matrix::zeros(4, 3);
        qw_diff_w(&q, &mut dfqdbw);
        dfqdbw.scale(-dt / 2.0);
        f.write_submatrix(QA, BWX, &dfqdbw);

        // ∂f_v/∂q = 2·Δt·(half derivative of q(a-ba)q* over q)
        let a_true = a_meas - ba;
        let mut dfvdq = Matrix::zeros(3, 4);
        qpq_diff_q(&q, &a_true, &mut dfvdq);
        dfvdq.scale(2.0 * dt);
        f.write_submatrix(VX, QA, &dfvdq);

        // ∂f_v/∂ba = -Δt·R(q)
        let mut dfvdba = Matrix::zeros(3, 3);
        qpq_diff_p(&q, &mut dfvdba);
        dfvdba.scale(-dt);
        f.write_submatrix(VX, BAX, &dfvdba);

        // identity on the remaining diagonal blocks
        for idx in BWX..=BWZ {
            f.set(idx, idx, 1.0);
        }
        for idx in VX..=VZ {
            f.set(idx, idx, 1.0);
        }
        for idx in BAX..=BAZ {
            f.set(idx, idx, 1.0);
        }
        for idx in RX..=RZ {
            f.set(idx, idx, 1.0);
        }
        f.set(STATE_LEN - 1, STATE_LEN - 1, 1.0);

        if self.tuning.integrate_position {
            f.set(RX, VX, dt);
            f.set(RY, VY, dt);
            f.set(RZ, VZ, dt);
        }
    }

    fn process_noise(&self, noise: &mut Matrix, state: &Matrix, dt: f64) {
        let t = &self.tuning;
        let q = state_quat(state);
        let dt_sq = dt * dt;

        noise.zero();

        // quaternion block: (I - q·qᵀ)·σ_w²·Δt²/4, symmetric by construction
        let qe = [q.a, q.i, q.j, q.k];
        let scale = t.q_wstdev * t.q_wstdev * dt_sq / 4.0;
        for r in 0..4 {
            for c in 0..4 {
                let iden = if r == c { 1.0 } else { 0.0 };
                noise.set(QA + r, QA + c, (iden - qe[r] * qe[c]) * scale);
            }
        }

        for idx in BWX..=BWZ {
            noise.set(idx, idx, t.q_bwdotstdev * t.q_bwdotstdev * dt_sq);
        }
        for idx in VX..=VZ {
            noise.set(idx, idx, t.q_astdev * t.q_astdev * dt_sq);
        }
        for idx in BAX..=BAZ {
            noise.set(idx, idx, t.q_badotstdev * t.q_badotstdev * dt_sq);
        }
        if t.integrate_position {
            for idx in RX..=RZ {
                noise.set(idx, idx, t.q_rstdev * t.q_rstdev * dt_sq);
            }
        }
    }

    fn constrain(&self, state: &mut Matrix) {
        let mut q = state_quat(state);
        q.normalize();
        state.vec_set(QA, q.a);
        state.vec_set(QB, q.i);
        state.vec_set(QC, q.j);
        state.vec_set(QD, q.k);
    }
}
