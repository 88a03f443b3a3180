// ekf/core — the filter mathematics, independent of the state layout.
//
// A `StateEngine` owns the state vector, covariance and prediction
// workspaces; an `UpdateEngine` owns everything one measurement model needs
// (H, R, Z, innovation, gain, scratch). Both are allocated once at startup;
// predict and update run without touching the allocator.

use log::warn;

use crate::algebra::Matrix;

/// Process model callbacks: state transition, its Jacobian, and the
/// per-step process noise.
pub trait ProcessModel: Send {
    fn estimate(&self, state: &Matrix, state_est: &mut Matrix, u: &Matrix, dt: f64);
    fn jacobian(&self, f: &mut Matrix, state: &Matrix, u: &Matrix, dt: f64);
    fn process_noise(&self, q: &mut Matrix, state: &Matrix, dt: f64);
    /// Post-step fixups that keep the state on its manifold (quaternion
    /// renormalisation).
    fn constrain(&self, state: &mut Matrix);
}

/// Measurement model callbacks: predicted measurement h(x) and Jacobian H.
/// Filling Z and R is model-specific and happens before `UpdateEngine::apply`.
pub trait MeasModel: Send {
    fn predict_meas(&self, state_est: &Matrix, hx: &mut Matrix, dt: f64);
    fn jacobian(&self, h: &mut Matrix, state_est: &Matrix, dt: f64);
}

pub struct StateEngine {
    pub state: Matrix,     // n x 1
    pub state_est: Matrix, // n x 1 a-priori estimate
    pub cov: Matrix,       // n x n
    pub cov_est: Matrix,   // n x n a-priori estimate
    pub u: Matrix,         // control vector

    f: Matrix,
    q: Matrix,
    tmp_nn: Matrix,
}

impl StateEngine {
    pub fn new(state_len: usize, ctrl_len: usize) -> Self {
        Self {
            state: Matrix::zeros(state_len, 1),
            state_est: Matrix::zeros(state_len, 1),
            cov: Matrix::zeros(state_len, state_len),
            cov_est: Matrix::zeros(state_len, state_len),
            u: Matrix::zeros(ctrl_len, 1),
            f: Matrix::zeros(state_len, state_len),
            q: Matrix::zeros(state_len, state_len),
            tmp_nn: Matrix::zeros(state_len, state_len),
        }
    }

    /// A-priori estimation of state and covariance:
    /// x̂ = f(x, u), P̂ = F·P·Fᵀ + Q.
    pub fn predict(&mut self, model: &dyn ProcessModel, dt: f64) {
        self.f.zero();
        model.jacobian(&mut self.f, &self.state, &self.u, dt);
        model.estimate(&self.state, &mut self.state_est, &self.u, dt);
        model.process_noise(&mut self.q, &self.state, dt);

        // F is block sparse; the sparse sandwich skips its structural zeros.
        Matrix::sandwich_sparse(&self.f, &self.cov, &mut self.cov_est, &mut self.tmp_nn);
        self.cov_est.add_assign(&self.q);
    }

    /// Adopt the a-priori estimate as the new state, used when no
    /// measurement (or no usable measurement) followed a prediction.
    pub fn commit_prediction(&mut self, model: &dyn ProcessModel) {
        self.state.copy_from(&self.state_est);
        self.cov.copy_from(&self.cov_est);
        model.constrain(&mut self.state);
    }

    /// Keep the covariance numerically symmetric.
    fn symmetrize(&mut self) {
        let n = self.cov.rows();
        for r in 0..n {
            for c in (r + 1)..n {
                let avg = 0.5 * (self.cov.at(r, c) + self.cov.at(c, r));
                self.cov.set(r, c, avg);
                self.cov.set(c, r, avg);
            }
        }
    }
}

pub struct UpdateEngine {
    /// Measurement vector, filled by the owning model before `apply`.
    pub z: Matrix,
    /// Measurement noise, diagonal entries maintained by the owning model.
    pub r: Matrix,

    h: Matrix,
    hx: Matrix,
    y: Matrix,
    s: Matrix,
    s_inv: Matrix,
    k: Matrix,
    i_kh: Matrix,

    tmp_ms: Matrix, // meas x state
    tmp_sm: Matrix, // state x meas
    tmp_s1: Matrix, // state x 1
    inv_scratch: Vec<f64>,

    /// Updates skipped because S was singular or produced non-finite
    /// entries. The state keeps the prediction in that case.
    pub skipped: u64,
}

impl UpdateEngine {
    pub fn new(state_len: usize, meas_len: usize) -> Self {
        Self {
            z: Matrix::zeros(meas_len, 1),
            r: Matrix::zeros(meas_len, meas_len),
            h: Matrix::zeros(meas_len, state_len),
            hx: Matrix::zeros(meas_len, 1),
            y: Matrix::zeros(meas_len, 1),
            s: Matrix::zeros(meas_len, meas_len),
            s_inv: Matrix::zeros(meas_len, meas_len),
            k: Matrix::zeros(state_len, meas_len),
            i_kh: Matrix::zeros(state_len, state_len),
            tmp_ms: Matrix::zeros(meas_len, state_len),
            tmp_sm: Matrix::zeros(state_len, meas_len),
            tmp_s1: Matrix::zeros(state_len, 1),
            inv_scratch: vec![0.0; 2 * meas_len * meas_len],
            skipped: 0,
        }
    }

    /// Measurement update against the engine's current Z and R. On a
    /// singular or non-finite innovation covariance the update is skipped:
    /// the prediction is committed untouched and the error counter bumped.
    pub fn apply(
        &mut self,
        eng: &mut StateEngine,
        process: &dyn ProcessModel,
        model: &dyn MeasModel,
        dt: f64,
    ) -> bool {
        model.jacobian(&mut self.h, &eng.state_est, dt);
        model.predict_meas(&eng.state_est, &mut self.hx, dt);

        // y = z - h(x̂)
        Matrix::sub(&self.z, &self.hx, &mut self.y);

        // S = H·P̂·Hᵀ + R
        Matrix::sandwich_sparse(&self.h, &eng.cov_est, &mut self.s, &mut self.tmp_ms);
        self.s.add_assign(&self.r);

        let invertible = self.s.is_finite()
            && self.s.invert_into(&mut self.s_inv, &mut self.inv_scratch).is_ok();
        if !invertible || !self.s_inv.is_finite() {
            self.skipped += 1;
            warn!("ekf: innovation covariance not invertible, update skipped");
            eng.commit_prediction(process);
            return false;
        }

        // K = P̂·Hᵀ·S⁻¹
        self.h.transpose();
        Matrix::mul(&eng.cov_est, &self.h, &mut self.tmp_sm);
        self.h.transpose();
        Matrix::mul(&self.tmp_sm, &self.s_inv, &mut self.k);

        // x = x̂ + K·y
        Matrix::mul(&self.k, &self.y, &mut self.tmp_s1);
        eng.state.copy_from(&eng.state_est);
        eng.state.add_assign(&self.tmp_s1);

        // P = (I - K·H)·P̂
        Matrix::mul_sparse(&self.k, &self.h, &mut self.i_kh);
        self.i_kh.scale(-1.0);
        for d in 0..self.i_kh.rows() {
            self.i_kh.add_at(d, d, 1.0);
        }
        Matrix::mul(&self.i_kh, &eng.cov_est, &mut eng.cov);

        eng.symmetrize();
        process.constrain(&mut eng.state);
        true
    }
}
