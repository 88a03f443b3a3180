use nalgebra::Vector3;

/*
 * Inertial data is passed through a windowed-sinc FIR filter:
 *  - cutoff frequency: 15 Hz
 *  - transition bandwidth: 35 Hz
 *  - window: Kaiser
 *  - stop-band attenuation: -40 dB
 *  - window length: 65
 */
pub const IMU_FIR_LEN: usize = 65;

static IMU_FIR_WINDOW: [f64; IMU_FIR_LEN] = [
    0.000199210030239271,
    0.000424229608547700,
    0.000723297047419754,
    0.001104142046107193,
    0.001573712960730727,
    0.002137953110816643,
    0.002801586486658635,
    0.003567918798687632,
    0.004438659652200897,
    0.005413771309271377,
    0.006491349018560496,
    0.007667537261972304,
    0.008936485498099311,
    0.010290346094017595,
    0.011719316150862934,
    0.013211723869743890,
    0.014754159000534514,
    0.016331645796411526,
    0.017927855792147184,
    0.019525356664762756,
    0.021105892451041771,
    0.022650689515795901,
    0.024140781913360887,
    0.025557349184979403,
    0.026882059204929122,
    0.028097408442343864,
    0.029187051952518743,
    0.030136115554644904,
    0.030931482990494263,
    0.031562051383240454,
    0.032018949014774860,
    0.032295710296038962,
    0.032388403796089343,
    0.032295710296038962,
    0.032018949014774860,
    0.031562051383240454,
    0.030931482990494263,
    0.030136115554644904,
    0.029187051952518743,
    0.028097408442343864,
    0.026882059204929122,
    0.025557349184979403,
    0.024140781913360887,
    0.022650689515795901,
    0.021105892451041771,
    0.019525356664762756,
    0.017927855792147184,
    0.016331645796411526,
    0.014754159000534514,
    0.013211723869743890,
    0.011719316150862934,
    0.010290346094017595,
    0.008936485498099311,
    0.007667537261972304,
    0.006491349018560496,
    0.005413771309271377,
    0.004438659652200897,
    0.003567918798687632,
    0.002801586486658635,
    0.002137953110816643,
    0.001573712960730727,
    0.001104142046107193,
    0.000723297047419754,
    0.000424229608547700,
    0.000199210030239271,
];

/// FIR low-pass over a stream of 3-vectors with a circular history buffer.
/// Feeding `None` clears the history (used around mode changes so stale
/// samples do not bleed into the restart).
pub struct VecFir {
    buf: [Vector3<f64>; IMU_FIR_LEN],
    pos: usize,
}

impl VecFir {
    pub fn new() -> Self {
        Self { buf: [Vector3::zeros(); IMU_FIR_LEN], pos: 0 }
    }

    pub fn apply(&mut self, input: Option<Vector3<f64>>) -> Vector3<f64> {
        let raw = match input {
            Some(v) => v,
            None => {
                self.buf = [Vector3::zeros(); IMU_FIR_LEN];
                self.pos = 0;
                return Vector3::zeros();
            }
        };

        self.buf[self.pos] = raw;

        let mut full = Vector3::zeros();
        for i in 0..IMU_FIR_LEN {
            let j = (self.pos + IMU_FIR_LEN - i) % IMU_FIR_LEN;
            full += self.buf[j] * IMU_FIR_WINDOW[IMU_FIR_LEN - 1 - i];
        }

        self.pos = (self.pos + 1) % IMU_FIR_LEN;
        full
    }
}

impl Default for VecFir {
    fn default() -> Self {
        Self::new()
    }
}

/// One-pole IIR low-pass for scalar streams (the barometric Δh channel).
pub struct LowPass {
    alpha: f64,
    last: f64,
    primed: bool,
}

impl LowPass {
    pub fn new(cutoff_hz: f64, sample_hz: f64) -> Self {
        let dt = 1.0 / sample_hz;
        let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff_hz);
        Self { alpha: dt / (rc + dt), last: 0.0, primed: false }
    }

    pub fn apply(&mut self, input: f64) -> f64 {
        if !self.primed {
            self.last = input;
            self.primed = true;
            return input;
        }
        self.last = self.last * (1.0 - self.alpha) + input * self.alpha;
        self.last
    }

    pub fn reset(&mut self) {
        self.last = 0.0;
        self.primed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn window_has_unit_gain() {
        let sum: f64 = IMU_FIR_WINDOW.iter().sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn constant_input_converges_to_itself() {
        let mut fir = VecFir::new();
        let v = Vector3::new(1.0, -2.0, 9.81);
        let mut out = Vector3::zeros();
        for _ in 0..IMU_FIR_LEN {
            out = fir.apply(Some(v));
        }
        assert_abs_diff_eq!(out.x, v.x, epsilon = 1e-6);
        assert_abs_diff_eq!(out.y, v.y, epsilon = 1e-6);
        assert_abs_diff_eq!(out.z, v.z, epsilon = 1e-6);
    }

    #[test]
    fn none_input_clears_history() {
        let mut fir = VecFir::new();
        for _ in 0..IMU_FIR_LEN {
            fir.apply(Some(Vector3::new(5.0, 5.0, 5.0)));
        }
        let cleared = fir.apply(None);
        assert_eq!(cleared, Vector3::zeros());
        // first sample after the clear only carries one tap of weight
        let first = fir.apply(Some(Vector3::new(1.0, 0.0, 0.0)));
        assert!(first.x < 0.05);
    }

    #[test]
    fn attenuates_alternating_input() {
        // Nyquist-rate square wave should be almost fully suppressed.
        let mut fir = VecFir::new();
        let mut out = Vector3::zeros();
        for i in 0..(4 * IMU_FIR_LEN) {
            let s = if i % 2 == 0 { 1.0 } else { -1.0 };
            out = fir.apply(Some(Vector3::new(s, s, s)));
        }
        assert!(out.x.abs() < 0.05);
    }

    #[test]
    fn low_pass_primes_on_first_sample() {
        let mut lp = LowPass::new(1.0, 20.0);
        assert_eq!(lp.apply(3.0), 3.0);
        let second = lp.apply(4.0);
        assert!(second > 3.0 && second < 4.0);
    }
}
