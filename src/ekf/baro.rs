// ekf/baro — barometric update (2 rows).
//
// The filter receives the change of altitude between consecutive baro
// samples together with the derived vertical speed, never the absolute
// altitude; the vertical channel stays observable without tying the state
// to a drifting atmospheric reference.

use crate::algebra::Matrix;
use crate::meas::BaroDelta;

use super::core::{MeasModel, UpdateEngine};
use super::model::{EkfTuning, STATE_LEN, VZ};

pub const MDZ: usize = 0;
pub const MVZ: usize = 1;

pub const BARO_MEAS_LEN: usize = 2;

pub struct BaroModel;

pub struct BaroEngine {
    pub update: UpdateEngine,
    pub model: BaroModel,
    last_ts: Option<u64>,
}

impl BaroEngine {
    pub fn new(tuning: &EkfTuning) -> Self {
        let mut update = UpdateEngine::new(STATE_LEN, BARO_MEAS_LEN);
        update.r.set(MDZ, MDZ, tuning.r_dzstdev * tuning.r_dzstdev);
        update.r.set(MVZ, MVZ, tuning.r_vzstdev * tuning.r_vzstdev);
        Self { update, model: BaroModel, last_ts: None }
    }

    /// Fill Z from one Δ-altitude measurement; returns the sample period in
    /// seconds, which the measurement prediction depends on. The first
    /// sample after a restart only primes the timestamp.
    pub fn fill(&mut self, delta: &BaroDelta) -> Option<f64> {
        let dt = match self.last_ts {
            Some(last) if delta.timestamp > last => (delta.timestamp - last) as f64 / 1e6,
            _ => {
                self.last_ts = Some(delta.timestamp);
                return None;
            }
        };
        self.last_ts = Some(delta.timestamp);

        self.update.z.vec_set(MDZ, delta.dz);
        self.update.z.vec_set(MVZ, delta.vz);
        Some(dt)
    }
}

impl MeasModel for BaroModel {
    fn predict_meas(&self, state_est: &Matrix, hx: &mut Matrix, dt: f64) {
        let vz = state_est.vec_at(VZ);
        hx.vec_set(MDZ, vz * dt);
        hx.vec_set(MVZ, vz);
    }

    fn jacobian(&self, h: &mut Matrix, _state_est: &Matrix, dt: f64) {
        h.zero();
        h.set(MDZ, VZ, dt);
        h.set(MVZ, VZ, 1.0);
    }
}
