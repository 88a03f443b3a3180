// algebra — fixed-shape dense matrices and quaternion/vector rotations.
//
// Everything downstream (EKF workspaces, measurement models, the attitude
// pipeline) is built on these two modules. Matrix shapes are decided at the
// call sites; the kernel only checks them where an operation would otherwise
// write out of bounds.

pub mod matrix;
pub mod quat;

pub use matrix::{Matrix, MatrixError};
pub use quat::Quat;
