use faer::{Mat, Scale};
use log::debug;

use crate::{
    buffer::{Operand, Slot},
    error::{check_dim, EpError, Result},
    gaussian::invert_spd,
    linalg::{check_square, elementwise_dot, frobenius_norm_squared, trace},
};

/// Optimal linear shrinkage estimate of a precision matrix.
///
/// Estimates the precision matrix from the sample covariance `s` of
/// `num_samples` draws, shrinking the inverse sample covariance towards
/// `prior`, or towards the naive prior `I/d` if no prior is given
/// (Bodnar, Gupta and Parolya, arXiv:1308.0931).
///
/// The estimate is symmetric but it is not guaranteed to be positive definite
/// when `num_samples` is small compared to the dimension.
pub fn olse<'a>(
    s: Operand<'a, Mat<f64>>,
    num_samples: usize,
    prior: Option<&Mat<f64>>,
) -> Result<Slot<'a, Mat<f64>>> {
    let dim = check_square("sample covariance", s.source())?;
    if let Some(prior) = prior {
        check_dim("prior rows", dim, prior.nrows())?;
        check_dim("prior columns", dim, prior.ncols())?;
    }
    if num_samples == 0 {
        return Err(EpError::Configuration(
            "shrinkage needs at least one sample".into(),
        ));
    }

    let mut out = invert_spd(s)?;
    let d = dim as f64;
    let n = num_samples as f64;
    let tr = trace(&out);
    let tr2 = tr * tr;
    let f2 = frobenius_norm_squared(&out);

    match prior {
        None => {
            let alpha = 1. - (d + tr2 / (f2 - tr2 / d)) / n;
            let beta = tr * (1. - d / n - alpha);
            debug!("Naive prior shrinkage with alpha {alpha:.4}, beta {beta:.4}");
            *out *= Scale(alpha);
            out.diagonal_mut()
                .column_vector_mut()
                .iter_mut()
                .for_each(|x| *x += beta / d);
        }
        Some(prior) => {
            let f2p = frobenius_norm_squared(prior);
            let tr_sp = elementwise_dot(&out, prior);
            let alpha = 1. - (d + tr2 * f2p / (f2 * f2p - tr_sp * tr_sp)) / n;
            let beta = (tr_sp / f2p) * (1. - d / n - alpha);
            debug!("Prior shrinkage with alpha {alpha:.4}, beta {beta:.4}");
            let shrunk = &*out * Scale(alpha) + prior * Scale(beta);
            out.copy_from(&shrunk);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use faer::Mat;
    use proptest::prelude::*;

    use super::olse;
    use crate::{buffer::Operand, gaussian::invert_spd, EpError};

    fn covariance() -> Mat<f64> {
        Mat::from_fn(3, 3, |i, j| match (i, j) {
            (0, 0) => 2.,
            (1, 1) => 1.,
            (2, 2) => 0.5,
            (0, 1) | (1, 0) => 0.3,
            (1, 2) | (2, 1) => -0.2,
            _ => 0.1,
        })
    }

    #[test]
    fn diagonal_example() {
        let s = Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 0) => 1.,
            (1, 1) => 0.5,
            _ => 0.,
        });
        // Inverse diag(1, 2): tr = 3, |.|² = 5, alpha = 0.8, beta = 0.54
        let q = olse(Operand::Allocate(&s), 100, None).unwrap();
        assert_abs_diff_eq!(q[(0, 0)], 1.07, epsilon = 1e-12);
        assert_abs_diff_eq!(q[(1, 1)], 1.87, epsilon = 1e-12);
        assert_abs_diff_eq!(q[(0, 1)], 0., epsilon = 1e-12);
    }

    #[test]
    fn large_sample_count_gives_inverse() {
        let s = covariance();
        let inv = invert_spd(Operand::Allocate(&s)).unwrap();
        let q = olse(Operand::Allocate(&s), 1_000_000_000, None).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(q[(i, j)], inv[(i, j)], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn naive_prior_matches_explicit_prior() {
        let s = covariance();
        let prior = Mat::from_fn(3, 3, |i, j| if i == j { 1. / 3. } else { 0. });
        let naive = olse(Operand::Allocate(&s), 50, None).unwrap();
        let explicit = olse(Operand::Allocate(&s), 50, Some(&prior)).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(naive[(i, j)], explicit[(i, j)], epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn overwrite_sample_covariance() {
        let mut s = covariance();
        let expected = olse(Operand::Allocate(&s), 40, None).unwrap().into_owned();
        olse(Operand::Overwrite(&mut s), 40, None).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(s[(i, j)], expected[(i, j)]);
            }
        }
    }

    #[test]
    fn invalid_inputs() {
        let s = covariance();
        let prior = Mat::<f64>::zeros(2, 2);
        assert!(matches!(
            olse(Operand::Allocate(&s), 10, Some(&prior)).unwrap_err(),
            EpError::DimensionMismatch { .. }
        ));
        assert!(matches!(
            olse(Operand::Allocate(&s), 0, None).unwrap_err(),
            EpError::Configuration(_)
        ));
        let not_pd = Mat::from_fn(2, 2, |i, j| if i == j { 0. } else { 1. });
        assert!(matches!(
            olse(Operand::Allocate(&not_pd), 10, None).unwrap_err(),
            EpError::Factorization { .. }
        ));
    }

    proptest! {
        #[test]
        fn estimate_is_symmetric(
            values in prop::collection::vec(-1f64..1., 9),
            n in 5usize..500,
            with_prior in any::<bool>(),
        ) {
            let b = Mat::from_fn(3, 3, |i, j| values[3 * i + j]);
            let s = Mat::from_fn(3, 3, |i, j| {
                let prod: f64 = (0..3).map(|k| b[(i, k)] * b[(j, k)]).sum();
                if i == j { prod + 1. } else { prod }
            });
            let prior = Mat::from_fn(3, 3, |i, j| if i == j { 2. } else { 0.5 });
            let q = olse(Operand::Allocate(&s), n, with_prior.then_some(&prior)).unwrap();
            for i in 0..3 {
                for j in 0..3 {
                    prop_assert_eq!(q[(i, j)], q[(j, i)]);
                }
            }
        }
    }
}
