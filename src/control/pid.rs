// control/pid — two-stage R→PID controller.
//
// Stage one turns the position error into a target rate through the R gain;
// stage two is a standard PID on the rate error. Every coefficient block
// carries its own saturation bound and an optional one-pole IIR on the
// stored value. A scalar instance runs each attitude/altitude axis; the
// 3-vector instance runs the horizontal position loop.

use nalgebra::Vector3;

use std::ops::BitOr;

// ─── Flags ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PidFlags(u32);

impl PidFlags {
    pub const FULL: PidFlags = PidFlags(0);
    pub const IGNORE_P: PidFlags = PidFlags(1 << 0);
    pub const IGNORE_I: PidFlags = PidFlags(1 << 1);
    pub const IGNORE_D: PidFlags = PidFlags(1 << 2);
    pub const RESET_I: PidFlags = PidFlags(1 << 3);

    pub fn contains(self, other: PidFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PidFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PidFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for PidFlags {
    type Output = PidFlags;
    fn bitor(self, rhs: PidFlags) -> PidFlags {
        PidFlags(self.0 | rhs.0)
    }
}

// ─── Coefficient blocks ──────────────────────────────────────────────────────

/// Stored-value arithmetic shared by the scalar and 3-vector controllers.
pub trait PidTerm: Copy {
    fn zero() -> Self;
    fn scaled(self, k: f64) -> Self;
    fn plus(self, other: Self) -> Self;
    fn minus(self, other: Self) -> Self;
    /// Clip to the symmetric bound: absolute value for scalars, vector
    /// length for vectors.
    fn clipped(self, max: f64) -> Self;
}

impl PidTerm for f64 {
    fn zero() -> Self {
        0.0
    }
    fn scaled(self, k: f64) -> Self {
        self * k
    }
    fn plus(self, other: Self) -> Self {
        self + other
    }
    fn minus(self, other: Self) -> Self {
        self - other
    }
    fn clipped(self, max: f64) -> Self {
        self.clamp(-max, max)
    }
}

impl PidTerm for Vector3<f64> {
    fn zero() -> Self {
        Vector3::zeros()
    }
    fn scaled(self, k: f64) -> Self {
        self * k
    }
    fn plus(self, other: Self) -> Self {
        self + other
    }
    fn minus(self, other: Self) -> Self {
        self - other
    }
    fn clipped(self, max: f64) -> Self {
        let len = self.norm();
        if len > max && len > 0.0 {
            self * (max / len)
        } else {
            self
        }
    }
}

/// One coefficient block: gain, saturation bound, IIR factor in [0, 1)
/// (zero disables filtering) and the stored value.
#[derive(Clone, Copy, Debug)]
pub struct PidCoef<T: PidTerm> {
    pub k: f64,
    pub max: f64,
    pub f: f64,
    val: T,
}

impl<T: PidTerm> PidCoef<T> {
    pub fn new(k: f64, max: f64, f: f64) -> Self {
        Self { k, max, f, val: T::zero() }
    }

    pub fn value(&self) -> T {
        self.val
    }

    pub fn reset(&mut self) {
        self.val = T::zero();
    }

    /// Blend the new value through the IIR, then saturate.
    fn store(&mut self, new_val: T) {
        let blended = if self.f == 0.0 {
            new_val
        } else {
            self.val.scaled(self.f).plus(new_val.scaled(1.0 - self.f))
        };
        self.val = blended.clipped(self.max);
    }
}

// ─── Controller context ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub struct PidCtx<T: PidTerm> {
    pub r: PidCoef<T>,
    pub p: PidCoef<T>,
    pub i: PidCoef<T>,
    pub d: PidCoef<T>,

    prev_err: T,

    /// Cyclic bound for the process variable (π for the yaw axis); the
    /// position error is wrapped into (-bound, bound].
    pub err_bound: Option<f64>,

    pub flags: PidFlags,
}

impl<T: PidTerm> PidCtx<T> {
    pub fn new(r: PidCoef<T>, p: PidCoef<T>, i: PidCoef<T>, d: PidCoef<T>) -> Self {
        Self { r, p, i, d, prev_err: T::zero(), err_bound: None, flags: PidFlags::FULL }
    }

    /// Zero all stored values and the previous error; gains stay.
    pub fn reset_state(&mut self) {
        self.r.reset();
        self.p.reset();
        self.i.reset();
        self.d.reset();
        self.prev_err = T::zero();
    }

    /// The common second stage on a rate error.
    fn rate_stage(&mut self, rate_err: T, dt: f64) -> T {
        let mut out = T::zero();

        self.p.store(rate_err.scaled(self.p.k));
        if !self.flags.contains(PidFlags::IGNORE_P) {
            out = out.plus(self.p.value());
        }

        self.i.store(self.i.value().plus(rate_err.scaled(dt * self.i.k)));
        if self.flags.contains(PidFlags::RESET_I) {
            self.i.reset();
        }
        if !self.flags.contains(PidFlags::IGNORE_I) {
            out = out.plus(self.i.value());
        }

        self.d.store(rate_err.minus(self.prev_err).scaled(self.d.k / dt));
        if !self.flags.contains(PidFlags::IGNORE_D) {
            out = out.plus(self.d.value());
        }
        self.prev_err = rate_err;

        out
    }
}

impl PidCtx<f64> {
    /// One controller tick: position error (wrapped through the cyclic
    /// bound) → target rate → PID on the rate error. `dt` in seconds.
    pub fn calc(&mut self, target_pos: f64, curr_pos: f64, curr_rate: f64, dt: f64) -> f64 {
        let mut err = target_pos - curr_pos;
        if let Some(bound) = self.err_bound {
            if err > bound {
                err -= 2.0 * bound;
            }
            if err < -bound {
                err += 2.0 * bound;
            }
        }

        self.r.store(err * self.r.k);
        let rate_err = self.r.value() - curr_rate;
        self.rate_stage(rate_err, dt)
    }
}

impl PidCtx<Vector3<f64>> {
    /// 3-vector variant used by the horizontal position controller; no
    /// cyclic wrap, saturation acts on vector length.
    pub fn calc3d(
        &mut self,
        target_pos: &Vector3<f64>,
        curr_pos: &Vector3<f64>,
        curr_rate: &Vector3<f64>,
        dt: f64,
    ) -> Vector3<f64> {
        let pos_err = target_pos - curr_pos;
        self.r.store(pos_err * self.r.k);
        let rate_err = self.r.value() - curr_rate;
        self.rate_stage(rate_err, dt)
    }
}
