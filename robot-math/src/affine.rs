//! 4x4 homogeneous transform utilities using nalgebra
//!
//! Deck attitude transforms map deck (world) coordinates to machine
//! coordinates: `machine = attitude * world`. Only the XY block and the
//! translation column are expected to deviate from identity in practice.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use thiserror::Error;

/// Error when matrix inversion fails due to a singular matrix
#[derive(Error, Debug, Clone, PartialEq)]
#[error("singular matrix: determinant={determinant:.6e}")]
pub struct SingularMatrixError {
    /// The determinant value (zero or near-zero)
    pub determinant: f64,
}

/// Threshold for considering a determinant as zero
const DETERMINANT_EPSILON: f64 = 1e-10;

/// Identity deck attitude (nominal deck, no correction)
pub fn identity_attitude() -> Matrix4<f64> {
    Matrix4::identity()
}

/// Invert a homogeneous transform with error handling for singular matrices
///
/// # Arguments
/// * `matrix` - The 4x4 transform to invert
///
/// # Returns
/// * `Ok(Matrix4<f64>)` - The inverse transform
/// * `Err(SingularMatrixError)` - If the transform is singular
pub fn invert_attitude(matrix: &Matrix4<f64>) -> Result<Matrix4<f64>, SingularMatrixError> {
    let det = matrix.determinant();

    if det.abs() < DETERMINANT_EPSILON {
        return Err(SingularMatrixError { determinant: det });
    }

    matrix
        .try_inverse()
        .ok_or(SingularMatrixError { determinant: det })
}

/// Apply a homogeneous transform to a point
pub fn apply_transform(matrix: &Matrix4<f64>, point: Vector3<f64>) -> Vector3<f64> {
    let out = matrix * Vector4::new(point.x, point.y, point.z, 1.0);
    Vector3::new(out.x, out.y, out.z)
}

/// Solve the deck attitude from three nominal points and where they were found.
///
/// The XY block is the exact affine map taking the three `expected` points to
/// the three `measured` points (solved in 2D homogeneous coordinates). The Z
/// translation is the mean Z difference between the point sets.
///
/// # Errors
/// Returns `SingularMatrixError` if the expected points are collinear.
pub fn solve_attitude(
    expected: [Vector3<f64>; 3],
    measured: [Vector3<f64>; 3],
) -> Result<Matrix4<f64>, SingularMatrixError> {
    let homogeneous = |pts: &[Vector3<f64>; 3]| {
        Matrix3::from_columns(&[
            Vector3::new(pts[0].x, pts[0].y, 1.0),
            Vector3::new(pts[1].x, pts[1].y, 1.0),
            Vector3::new(pts[2].x, pts[2].y, 1.0),
        ])
    };

    let e = homogeneous(&expected);
    let m = homogeneous(&measured);

    let det = e.determinant();
    if det.abs() < DETERMINANT_EPSILON {
        return Err(SingularMatrixError { determinant: det });
    }
    let e_inv = e.try_inverse().ok_or(SingularMatrixError { determinant: det })?;
    let xy = m * e_inv;

    let z_offset = (0..3).map(|i| measured[i].z - expected[i].z).sum::<f64>() / 3.0;

    #[rustfmt::skip]
    let attitude = Matrix4::new(
        xy[(0, 0)], xy[(0, 1)], 0.0, xy[(0, 2)],
        xy[(1, 0)], xy[(1, 1)], 0.0, xy[(1, 2)],
        0.0,        0.0,        1.0, z_offset,
        0.0,        0.0,        0.0, 1.0,
    );
    Ok(attitude)
}

/// Round a value to a fixed number of decimal places
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn assert_point_eq(a: Vector3<f64>, b: Vector3<f64>) {
        assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
        assert_relative_eq!(a.z, b.z, epsilon = 1e-9);
    }

    #[test]
    fn test_identity_apply() {
        let p = Vector3::new(12.5, 80.0, 3.0);
        assert_point_eq(apply_transform(&identity_attitude(), p), p);
    }

    #[test]
    fn test_inversion_roundtrip() {
        let mut m = Matrix4::identity();
        m[(0, 1)] = 0.01;
        m[(0, 3)] = 2.5;
        m[(1, 3)] = -1.0;
        m[(2, 3)] = 0.3;
        let inv = invert_attitude(&m).unwrap();

        let p = Vector3::new(100.0, 50.0, 10.0);
        let back = apply_transform(&inv, apply_transform(&m, p));
        assert_point_eq(back, p);
    }

    #[test]
    fn test_singular_matrix_error() {
        let m = Matrix4::zeros();
        let err = invert_attitude(&m).unwrap_err();
        assert!(err.determinant.abs() < 1e-9);
    }

    #[test]
    fn test_solve_pure_translation() {
        let expected = [
            Vector3::new(12.13, 9.0, 0.0),
            Vector3::new(380.87, 9.0, 0.0),
            Vector3::new(12.13, 348.5, 0.0),
        ];
        let delta = Vector3::new(1.5, -0.75, 0.2);
        let measured = expected.map(|p| p + delta);

        let attitude = solve_attitude(expected, measured).unwrap();
        for p in expected {
            assert_point_eq(apply_transform(&attitude, p), p + delta);
        }
        assert_relative_eq!(attitude[(2, 3)], 0.2, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_skewed_deck() {
        let expected = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(300.0, 0.0, 0.0),
            Vector3::new(0.0, 300.0, 0.0),
        ];
        // Small rotation plus scale error
        let measured = [
            Vector3::new(1.0, 2.0, 0.0),
            Vector3::new(301.2, 3.5, 0.0),
            Vector3::new(-0.5, 302.0, 0.0),
        ];
        let attitude = solve_attitude(expected, measured).unwrap();
        for (e, m) in expected.iter().zip(measured.iter()) {
            assert_point_eq(apply_transform(&attitude, *e), *m);
        }
    }

    #[test]
    fn test_solve_collinear_points_rejected() {
        let expected = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(100.0, 100.0, 0.0),
            Vector3::new(200.0, 200.0, 0.0),
        ];
        assert!(solve_attitude(expected, expected).is_err());
    }

    #[test]
    fn test_round_to() {
        assert_relative_eq!(round_to(1.23456789, 6), 1.234568);
        assert_relative_eq!(round_to(-0.0000004, 6), 0.0);
    }
}
