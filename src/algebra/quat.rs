use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Rotation quaternion, Hamilton convention (i·j = k).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub a: f64,
    pub i: f64,
    pub j: f64,
    pub k: f64,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { a: 1.0, i: 0.0, j: 0.0, k: 0.0 };

    /// Half-turn about the x axis; the fallback for antiparallel inputs.
    pub const HALF_TURN_X: Quat = Quat { a: 0.0, i: 1.0, j: 0.0, k: 0.0 };

    pub fn new(a: f64, i: f64, j: f64, k: f64) -> Self {
        Self { a, i, j, k }
    }

    /// Pure quaternion from a vector (zero real part).
    pub fn from_vec(v: &Vector3<f64>) -> Self {
        Self { a: 0.0, i: v.x, j: v.y, k: v.z }
    }

    pub fn imag(&self) -> Vector3<f64> {
        Vector3::new(self.i, self.j, self.k)
    }

    pub fn from_axis_angle(axis: &Vector3<f64>, angle: f64) -> Self {
        let half = angle / 2.0;
        let s = half.sin() / axis.norm();
        Self { a: half.cos(), i: axis.x * s, j: axis.y * s, k: axis.z * s }
    }

    /// Hamilton product self ⊗ rhs. Returns a fresh quaternion, so the
    /// operands may be anything, including `self`.
    pub fn mul(&self, rhs: &Quat) -> Quat {
        Quat {
            a: self.a * rhs.a - self.i * rhs.i - self.j * rhs.j - self.k * rhs.k,
            i: self.a * rhs.i + self.i * rhs.a + self.j * rhs.k - self.k * rhs.j,
            j: self.a * rhs.j - self.i * rhs.k + self.j * rhs.a + self.k * rhs.i,
            k: self.a * rhs.k + self.i * rhs.j - self.j * rhs.i + self.k * rhs.a,
        }
    }

    pub fn conj(&self) -> Quat {
        Quat { a: self.a, i: -self.i, j: -self.j, k: -self.k }
    }

    pub fn dot(&self, rhs: &Quat) -> f64 {
        self.a * rhs.a + self.i * rhs.i + self.j * rhs.j + self.k * rhs.k
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    pub fn scale(&mut self, s: f64) {
        self.a *= s;
        self.i *= s;
        self.j *= s;
        self.k *= s;
    }

    pub fn add_assign(&mut self, rhs: &Quat) {
        self.a += rhs.a;
        self.i += rhs.i;
        self.j += rhs.j;
        self.k += rhs.k;
    }

    pub fn normalize(&mut self) {
        let inv = 1.0 / self.norm();
        self.scale(inv);
    }

    pub fn normalized(&self) -> Quat {
        let mut q = *self;
        q.normalize();
        q
    }

    /// Rotate a vector: q ⊗ v ⊗ q*. Expanded form, no intermediate
    /// quaternion churn in the hot path.
    pub fn rotate(&self, v: &Vector3<f64>) -> Vector3<f64> {
        let a = -self.i * v.x - self.j * v.y - self.k * v.z;
        let i = self.a * v.x + self.j * v.z - self.k * v.y;
        let j = self.a * v.y - self.i * v.z + self.k * v.x;
        let k = self.a * v.z + self.i * v.y - self.j * v.x;

        Vector3::new(
            -a * self.i + i * self.a - j * self.k + k * self.j,
            -a * self.j + i * self.k + j * self.a - k * self.i,
            -a * self.k - i * self.j + j * self.i + k * self.a,
        )
    }

    /// Quaternion rotating unit vector `v1` onto unit vector `v2`.
    /// Near-parallel inputs return the identity; near-antiparallel inputs
    /// return a half turn (the axis is then arbitrary).
    pub fn uvec_to_uvec(v1: &Vector3<f64>, v2: &Vector3<f64>) -> Quat {
        let cos = v1.dot(v2);

        if cos > 1.0 - 1e-8 {
            return Quat::IDENTITY;
        }
        if cos < -1.0 + 1e-8 {
            return Quat::HALF_TURN_X;
        }

        let qv1 = Quat::from_vec(v1);
        let qv2 = Quat::from_vec(v2);

        // q = v1 ⊗ v2 gives the double rotation; halve it by blending with
        // identity and renormalising.
        let mut q = qv1.mul(&qv2);
        q.a = -q.a;
        let cos_full = q.a;
        q.a += 1.0;
        q.scale(1.0 / (2.0 + 2.0 * cos_full).sqrt());
        q.normalize();
        q
    }

    /// Quaternion carrying the orthonormal frame (v1, v2) onto (w1, w2).
    /// Two quaternions satisfy the constraint (q and −q); `help` picks the
    /// hemisphere by sign of the 4-D dot product.
    pub fn frame_rot(
        v1: &Vector3<f64>,
        v2: &Vector3<f64>,
        w1: &Vector3<f64>,
        w2: &Vector3<f64>,
        help: Option<&Quat>,
    ) -> Quat {
        let n = unit_normal(v1, v2);
        let p = unit_normal(w1, w2);

        let q1 = Quat::uvec_to_uvec(v1, w1);
        let n_rot = q1.rotate(&n);
        let q2 = Quat::uvec_to_uvec(&n_rot, &p);

        let mut res = q2.mul(&q1);
        res.normalize();

        if let Some(h) = help {
            if res.dot(h) < 0.0 {
                res.scale(-1.0);
            }
        }
        res
    }

    /// Tait-Bryan angles (roll, pitch, yaw) of the rotation. The asin
    /// argument is clamped so accumulated rounding can not produce NaN at
    /// gimbal extremes.
    pub fn to_euler(&self) -> (f64, f64, f64) {
        let q = self.normalized();
        let roll = (2.0 * (q.a * q.i + q.j * q.k)).atan2(1.0 - 2.0 * (q.i * q.i + q.j * q.j));
        let pitch = (2.0 * (q.a * q.j - q.k * q.i)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (q.a * q.k + q.i * q.j)).atan2(1.0 - 2.0 * (q.j * q.j + q.k * q.k));
        (roll, pitch, yaw)
    }
}

/// Unit vector perpendicular to both `a` and `b` (zero vector if parallel).
pub fn unit_normal(a: &Vector3<f64>, b: &Vector3<f64>) -> Vector3<f64> {
    let c = a.cross(b);
    let len = c.norm();
    if len != 0.0 {
        c / len
    } else {
        Vector3::zeros()
    }
}
