use faer::{Col, Mat, Scale};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    buffer::{Operand, Slot},
    error::{check_dim, EpError, Result},
    linalg::{
        check_square, cho_solve_in_place, cho_solve_mat_in_place, cholesky_upper,
        cholesky_upper_in_place, copy_upper_to_lower, half_log_det,
        inverse_from_cholesky_in_place, solve_upper_mat_in_place, trace,
    },
};

pub(crate) const LOG_2PI: f64 = 1.8378770664093453;

/// How the matrix passed to [`invert_normal_params`] is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixForm {
    /// The symmetric positive definite matrix itself.
    #[default]
    Full,
    /// The upper Cholesky factor `U` of the matrix `Uᵀ U`.
    UpperCholesky,
}

/// Switch between the moment parameters `(S, m)` and the natural parameters
/// `(Q, r)` of a multivariate normal distribution.
///
/// Passing `(S, m)` yields `(S⁻¹, S⁻¹ m) = (Q, r)`, and passing `(Q, r)` yields
/// `(S, m)`. The vector is computed from the Cholesky factor by two
/// triangular solves before the factor itself is inverted. If `form` is
/// [`MatrixForm::UpperCholesky`], `a` already holds the upper factor of the
/// matrix and only its upper triangle is read.
///
/// The returned matrix is fully populated and exactly symmetric.
///
/// # Errors
///
/// [`EpError::Factorization`] if the matrix is not positive definite.
pub fn invert_normal_params<'a>(
    a: Operand<'a, Mat<f64>>,
    b: Option<Operand<'a, Col<f64>>>,
    form: MatrixForm,
) -> Result<(Slot<'a, Mat<f64>>, Option<Slot<'a, Col<f64>>>)> {
    let dim = check_square("normal parameter matrix", a.source())?;
    if let Some(b) = b.as_ref() {
        check_dim("normal parameter vector", dim, b.source().nrows())?;
    }
    let mut a = a.resolve("normal parameter matrix")?;
    let mut b = b
        .map(|b| b.resolve("normal parameter vector"))
        .transpose()?;

    if form == MatrixForm::Full {
        cholesky_upper_in_place(&mut a)?;
    }
    if let Some(b) = b.as_mut() {
        cho_solve_in_place(&a, b)?;
    }
    inverse_from_cholesky_in_place(&mut a)?;
    copy_upper_to_lower(&mut a);
    Ok((a, b))
}

/// Invert a symmetric positive definite matrix.
pub fn invert_spd<'a>(a: Operand<'a, Mat<f64>>) -> Result<Slot<'a, Mat<f64>>> {
    let (a, _) = invert_normal_params(a, None, MatrixForm::Full)?;
    Ok(a)
}

/// A multivariate normal in moment parameters.
#[derive(Debug, Clone)]
pub struct GaussianMoment {
    pub mean: Col<f64>,
    pub covariance: Mat<f64>,
}

/// A multivariate normal in natural parameters.
#[derive(Debug, Clone)]
pub struct GaussianNatural {
    pub precision: Mat<f64>,
    pub info: Col<f64>,
}

impl GaussianMoment {
    pub fn new(mean: Col<f64>, covariance: Mat<f64>) -> Result<Self> {
        let dim = check_square("covariance", &covariance)?;
        check_dim("mean", dim, mean.nrows())?;
        Ok(Self { mean, covariance })
    }

    pub fn dim(&self) -> usize {
        self.mean.nrows()
    }

    pub fn to_natural(&self) -> Result<GaussianNatural> {
        let (precision, info) = invert_normal_params(
            Operand::Allocate(&self.covariance),
            Some(Operand::Allocate(&self.mean)),
            MatrixForm::Full,
        )?;
        Ok(GaussianNatural {
            precision: precision.into_owned(),
            info: info.map(Slot::into_owned).unwrap_or_else(|| Col::zeros(0)),
        })
    }

    /// Sample mean and unbiased sample covariance of the rows of `samples`.
    pub fn from_samples(samples: &Mat<f64>) -> Result<Self> {
        let n = samples.nrows();
        if n < 2 {
            return Err(EpError::Configuration(format!(
                "at least two samples are needed for a covariance, got {n}"
            )));
        }
        let mean = column_means(samples);
        let mut covariance = scatter(samples, &mean);
        covariance *= Scale(((n - 1) as f64).recip());
        Ok(Self { mean, covariance })
    }

    /// `KL(self ‖ other)`.
    pub fn kl_divergence(&self, other: &GaussianMoment) -> Result<f64> {
        let own = cholesky_upper(&self.covariance)?;
        self.kl_divergence_with(other, half_log_det(&own))
    }

    /// `KL(self ‖ other)` with a precomputed half log-determinant of
    /// `self.covariance`, i.e. the log-diagonal sum of its Cholesky factor.
    pub fn kl_divergence_with(
        &self,
        other: &GaussianMoment,
        half_log_det_self: f64,
    ) -> Result<f64> {
        let dim = self.dim();
        check_dim("kl divergence dimension", dim, other.dim())?;
        let factor = cholesky_upper(&other.covariance)?;

        let mut ratio = self.covariance.clone();
        cho_solve_mat_in_place(&factor, ratio.as_mut())?;

        let diff = &other.mean - &self.mean;
        let mut solved = diff.clone();
        cho_solve_in_place(&factor, &mut solved)?;
        let mahalanobis = diff.transpose() * solved.as_ref();

        Ok(0.5 * (trace(&ratio) + mahalanobis - dim as f64) + half_log_det(&factor)
            - half_log_det_self)
    }
}

impl GaussianNatural {
    pub fn new(precision: Mat<f64>, info: Col<f64>) -> Result<Self> {
        let dim = check_square("precision", &precision)?;
        check_dim("info", dim, info.nrows())?;
        Ok(Self { precision, info })
    }

    /// The improper flat distribution with zero precision.
    pub fn zeros(dim: usize) -> Self {
        Self {
            precision: Mat::zeros(dim, dim),
            info: Col::zeros(dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.info.nrows()
    }

    pub fn to_moment(&self) -> Result<GaussianMoment> {
        let (covariance, mean) = invert_normal_params(
            Operand::Allocate(&self.precision),
            Some(Operand::Allocate(&self.info)),
            MatrixForm::Full,
        )?;
        Ok(GaussianMoment {
            covariance: covariance.into_owned(),
            mean: mean.map(Slot::into_owned).unwrap_or_else(|| Col::zeros(0)),
        })
    }

    /// Natural parameters of the sample moments of the rows of `samples`.
    ///
    /// The upper factor of the scatter matrix comes from a QR decomposition of
    /// the centered samples. Its inverse is multiplied by `scale`, which
    /// defaults to `n - 1` so the precision matches the inverse of the unbiased
    /// sample covariance.
    pub fn estimate_from_samples(samples: &Mat<f64>, scale: Option<f64>) -> Result<Self> {
        let (n, dim) = (samples.nrows(), samples.ncols());
        if n < 2 || n <= dim {
            return Err(EpError::Configuration(format!(
                "a precision in {dim} dimensions needs more than {} samples, got {n}",
                dim.max(1)
            )));
        }
        let mean = column_means(samples);
        let factor = centered(samples, &mean).qr().thin_R().to_owned();
        let (precision, info) = invert_normal_params(
            Operand::Allocate(&factor),
            Some(Operand::Allocate(&mean)),
            MatrixForm::UpperCholesky,
        )?;
        let scale = Scale(scale.unwrap_or((n - 1) as f64));
        let mut precision = precision.into_owned();
        let mut info = info.map(Slot::into_owned).unwrap_or_else(|| Col::zeros(0));
        precision *= scale;
        info *= scale;
        Ok(Self { precision, info })
    }

    /// `self + weight · other`, elementwise in both parameters.
    pub fn combine(&self, other: &GaussianNatural, weight: f64) -> Result<GaussianNatural> {
        check_dim("natural parameter dimension", self.dim(), other.dim())?;
        Ok(GaussianNatural {
            precision: &self.precision + &other.precision * Scale(weight),
            info: &self.info + &other.info * Scale(weight),
        })
    }

    /// Move `self` a fraction `damping` of the way towards `target`.
    pub fn damped_towards(
        &self,
        target: &GaussianNatural,
        damping: f64,
    ) -> Result<GaussianNatural> {
        let step = target.combine(self, -1.)?;
        self.combine(&step, damping)
    }

    /// Normalized log-density at every row of `points`.
    pub fn log_density(&self, points: &Mat<f64>) -> Result<Col<f64>> {
        let dim = self.dim();
        check_dim("point dimension", dim, points.ncols())?;
        let factor = cholesky_upper(&self.precision)?;
        let mut mean = self.info.clone();
        cho_solve_in_place(&factor, &mut mean)?;
        let constant = half_log_det(&factor) - 0.5 * dim as f64 * LOG_2PI;

        // Row r holds (U (x_r - m))ᵀ.
        let whitened = centered(points, &mean) * factor.transpose();
        Ok(Col::from_fn(points.nrows(), |r| {
            constant - 0.5 * whitened.row(r).squared_norm_l2()
        }))
    }

    /// Draw `num_draws` samples, one per row.
    ///
    /// With `Q = Uᵀ U`, the draws are `m + U⁻¹ z` for standard normal `z`.
    pub fn sample<R: Rng + ?Sized>(&self, num_draws: usize, rng: &mut R) -> Result<Mat<f64>> {
        let dim = self.dim();
        let factor = cholesky_upper(&self.precision)?;
        let mut mean = self.info.clone();
        cho_solve_in_place(&factor, &mut mean)?;

        // One draw per column.
        let mut z = Mat::<f64>::from_fn(dim, num_draws, |_, _| rng.sample(StandardNormal));
        solve_upper_mat_in_place(&factor, z.as_mut());
        Ok(Mat::from_fn(num_draws, dim, |r, j| mean[j] + z[(j, r)]))
    }
}

pub(crate) fn column_means(samples: &Mat<f64>) -> Col<f64> {
    let n = samples.nrows() as f64;
    Col::from_fn(samples.ncols(), |j| samples.col(j).sum() / n)
}

/// The rows of `samples` minus `center`.
pub(crate) fn centered(samples: &Mat<f64>, center: &Col<f64>) -> Mat<f64> {
    Mat::from_fn(samples.nrows(), samples.ncols(), |r, j| {
        samples[(r, j)] - center[j]
    })
}

/// `Σ_r (x_r - center)(x_r - center)ᵀ`, exactly symmetric.
pub(crate) fn scatter(samples: &Mat<f64>, center: &Col<f64>) -> Mat<f64> {
    let dev = centered(samples, center);
    let mut out = dev.transpose() * &dev;
    copy_upper_to_lower(&mut out);
    out
}
