//! Dense kernels for symmetric positive definite matrices.
//!
//! Matrices are stored column-major in `faer::Mat`. Symmetric inputs are read
//! from their upper triangle; Cholesky factors are upper triangular, so that
//! `A = Uᵀ U`.

use faer::{
    linalg::{triangular_inverse, triangular_solve},
    Col, Mat, MatMut, Par, Side,
};

use crate::error::{check_dim, EpError, Result};

pub(crate) fn check_square(what: &'static str, mat: &Mat<f64>) -> Result<usize> {
    check_dim(what, mat.nrows(), mat.ncols())?;
    Ok(mat.nrows())
}

/// Replace the symmetric matrix `a` by its upper Cholesky factor `U`.
///
/// Only the upper triangle of `a` is read. The strictly lower triangle of the
/// result is zero.
pub fn cholesky_upper_in_place(a: &mut Mat<f64>) -> Result<()> {
    check_square("cholesky input", a)?;
    let llt = a.llt(Side::Upper).map_err(|err| EpError::Factorization {
        routine: "cholesky",
        reason: format!("matrix is not positive definite ({err:?})"),
    })?;
    a.copy_from(llt.L().transpose());
    Ok(())
}

pub fn cholesky_upper(a: &Mat<f64>) -> Result<Mat<f64>> {
    let mut factor = a.clone();
    cholesky_upper_in_place(&mut factor)?;
    Ok(factor)
}

/// Solve `U x = b` in place.
pub fn solve_upper_in_place(u: &Mat<f64>, b: &mut Col<f64>) {
    solve_upper_mat_in_place(u, b.as_mat_mut());
}

/// Solve `U X = B` in place for every column of `B`.
pub fn solve_upper_mat_in_place(u: &Mat<f64>, b: MatMut<'_, f64>) {
    triangular_solve::solve_upper_triangular_in_place(u.as_ref(), b, Par::Seq);
}

/// Solve `Uᵀ U x = b` in place, given the upper Cholesky factor `U`.
pub fn cho_solve_in_place(u: &Mat<f64>, b: &mut Col<f64>) -> Result<()> {
    check_dim("right hand side", u.nrows(), b.nrows())?;
    cho_solve_mat_in_place(u, b.as_mat_mut())
}

/// Solve `Uᵀ U X = B` in place for every column of `B`.
pub fn cho_solve_mat_in_place(u: &Mat<f64>, mut b: MatMut<'_, f64>) -> Result<()> {
    check_dim("right hand side", u.nrows(), b.nrows())?;
    triangular_solve::solve_lower_triangular_in_place(u.transpose(), b.as_mut(), Par::Seq);
    triangular_solve::solve_upper_triangular_in_place(u.as_ref(), b.as_mut(), Par::Seq);
    Ok(())
}

/// 1-based index of the first zero on the diagonal, or zero if there is none.
fn zero_diagonal_status(u: &Mat<f64>) -> usize {
    u.diagonal()
        .column_vector()
        .iter()
        .position(|&val| val == 0f64)
        .map_or(0, |idx| idx + 1)
}

/// Given the upper Cholesky factor `U` of `A`, overwrite it with
/// `A⁻¹ = U⁻¹ U⁻ᵀ`.
///
/// Only the upper triangle of `U` is read.
pub fn inverse_from_cholesky_in_place(u: &mut Mat<f64>) -> Result<()> {
    let n = check_square("cholesky factor", u)?;
    let status = zero_diagonal_status(u);
    if status != 0 {
        return Err(EpError::Factorization {
            routine: "inverse_from_cholesky",
            reason: format!("zero on diagonal of cholesky factor (status {status})"),
        });
    }
    let mut inv = Mat::<f64>::zeros(n, n);
    triangular_inverse::invert_upper_triangular(inv.as_mut(), u.as_ref(), Par::Seq);
    u.copy_from(&inv * inv.transpose());
    Ok(())
}

/// Mirror the upper triangle of a square matrix into its lower triangle.
pub fn copy_upper_to_lower(a: &mut Mat<f64>) {
    let n = a.nrows();
    for j in 0..n {
        for i in (j + 1)..n {
            a[(i, j)] = a[(j, i)];
        }
    }
}

/// Half the log-determinant of `Uᵀ U`, i.e. the sum of the log-diagonal of `U`.
pub fn half_log_det(u: &Mat<f64>) -> f64 {
    u.diagonal().column_vector().iter().map(|val| val.ln()).sum()
}

pub fn trace(a: &Mat<f64>) -> f64 {
    a.diagonal().column_vector().sum()
}

pub fn frobenius_norm_squared(a: &Mat<f64>) -> f64 {
    a.as_ref().squared_norm_l2()
}

/// `Σ_ij a_ij b_ij`
pub fn elementwise_dot(a: &Mat<f64>, b: &Mat<f64>) -> f64 {
    let mut acc = 0f64;
    faer::zip!(a.as_ref(), b.as_ref()).for_each(|faer::unzip!(x, y)| acc += *x * *y);
    acc
}

pub fn mat_vec(a: &Mat<f64>, x: &Col<f64>) -> Col<f64> {
    a * x
}

/// Solve `A X = B` for a symmetric positive definite `A`, consuming both.
pub fn solve_spd(mut a: Mat<f64>, mut b: Mat<f64>) -> Result<Mat<f64>> {
    cholesky_upper_in_place(&mut a)?;
    cho_solve_mat_in_place(&a, b.as_mut())?;
    Ok(b)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use faer::{Col, Mat};

    use super::{
        cho_solve_in_place, cholesky_upper, copy_upper_to_lower, half_log_det,
        inverse_from_cholesky_in_place, solve_spd,
    };
    use crate::EpError;

    fn example() -> Mat<f64> {
        Mat::from_fn(3, 3, |i, j| match (i, j) {
            (0, 0) => 4.,
            (1, 1) => 5.,
            (2, 2) => 6.,
            (0, 1) | (1, 0) => 2.,
            (1, 2) | (2, 1) => 1.,
            _ => 0.5,
        })
    }

    #[test]
    fn factor_reconstructs_matrix() {
        let a = example();
        let u = cholesky_upper(&a).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let value: f64 = (0..3).map(|k| u[(k, i)] * u[(k, j)]).sum();
                assert_abs_diff_eq!(value, a[(i, j)], epsilon = 1e-12);
            }
            for j in 0..i {
                assert_eq!(u[(i, j)], 0.);
            }
        }
    }

    #[test]
    fn inverse_times_matrix_is_identity() {
        let a = example();
        let mut inv = cholesky_upper(&a).unwrap();
        inverse_from_cholesky_in_place(&mut inv).unwrap();
        copy_upper_to_lower(&mut inv);
        for i in 0..3 {
            for j in 0..3 {
                let value: f64 = (0..3).map(|k| a[(i, k)] * inv[(k, j)]).sum();
                let expected = if i == j { 1. } else { 0. };
                assert_abs_diff_eq!(value, expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn cho_solve_matches_inverse() {
        let a = example();
        let u = cholesky_upper(&a).unwrap();
        let mut b = Col::from_fn(3, |i| i as f64 + 1.);
        cho_solve_in_place(&u, &mut b).unwrap();
        let back = Col::from_fn(3, |i| (0..3).map(|k| a[(i, k)] * b[k]).sum::<f64>());
        for i in 0..3 {
            assert_abs_diff_eq!(back[i], i as f64 + 1., epsilon = 1e-12);
        }
    }

    #[test]
    fn not_positive_definite() {
        let a = Mat::from_fn(2, 2, |i, j| if i == j { 1. } else { 2. });
        let err = cholesky_upper(&a).unwrap_err();
        assert!(matches!(err, EpError::Factorization { .. }));
    }

    #[test]
    fn zero_diagonal_in_factor_is_reported() {
        let mut u = Mat::from_fn(2, 2, |i, j| if i == 0 && j == 0 { 1. } else { 0. });
        let err = inverse_from_cholesky_in_place(&mut u).unwrap_err();
        assert!(matches!(err, EpError::Factorization { .. }));
    }

    #[test]
    fn log_det_of_diagonal() {
        let a = Mat::from_fn(2, 2, |i, j| if i == j { 4. } else { 0. });
        let u = cholesky_upper(&a).unwrap();
        assert_abs_diff_eq!(2. * half_log_det(&u), 16f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn spd_solve_multiple_rhs() {
        let a = example();
        let b = Mat::from_fn(3, 2, |i, j| (i * 2 + j) as f64);
        let x = solve_spd(a.clone(), b.clone()).unwrap();
        for j in 0..2 {
            for i in 0..3 {
                let value: f64 = (0..3).map(|k| a[(i, k)] * x[(k, j)]).sum();
                assert_abs_diff_eq!(value, b[(i, j)], epsilon = 1e-12);
            }
        }
    }
}
