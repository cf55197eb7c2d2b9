//! Control variate estimates of posterior moments.
//!
//! Samples from the distribution of interest are compared against a tilted
//! reference Gaussian whose moments are known exactly. The importance-weighted
//! samples have the reference moments as expectation, which makes them a
//! control variate for the plain sample moments.

use faer::{Col, Mat, Scale};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    buffer::{Operand, Slot},
    error::{check_dim, EpError, Result},
    gaussian::{
        centered, invert_normal_params, GaussianMoment, GaussianNatural, MatrixForm, LOG_2PI,
    },
    linalg::{cholesky_upper, half_log_det, solve_spd},
    packing::{pack, packed_outer_products, unpack},
};

/// Settings for control variate moment estimation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvOptions {
    /// Regress each dimension of the estimate on all dimensions of the control
    /// variate. Otherwise each dimension is only controlled by the matching
    /// dimension.
    pub multiple_control_variates: bool,
    /// Multiply the fitted coefficients by this value. Values closer to zero
    /// trade variance for less bias.
    pub correlation_regularizer: Option<f64>,
    /// Clip the fitted coefficients to `[-max, max]`.
    pub max_correlation: Option<f64>,
    /// Fall back to plain sample moments if the fraction of samples on one
    /// side of the reference mean exceeds this in any dimension. Values below
    /// 0.5 are mirrored.
    pub mean_balance_threshold: Option<f64>,
    /// Return the fitted coefficients with the estimate.
    pub return_coefficients: bool,
}

impl Default for CvOptions {
    fn default() -> Self {
        Self {
            multiple_control_variates: true,
            correlation_regularizer: None,
            max_correlation: None,
            mean_balance_threshold: Some(0.9),
            return_coefficients: false,
        }
    }
}

impl CvOptions {
    pub fn validate(&self) -> Result<()> {
        if let Some(max) = self.max_correlation {
            if !(max >= 0.) {
                return Err(EpError::Configuration(format!(
                    "max_correlation must be non-negative, got {max}"
                )));
            }
        }
        if let Some(threshold) = self.mean_balance_threshold {
            if !(0. ..=1.).contains(&threshold) {
                return Err(EpError::Configuration(format!(
                    "mean_balance_threshold must lie in [0, 1], got {threshold}"
                )));
            }
        }
        Ok(())
    }
}

/// The Gaussian the samples are compared against.
///
/// Only the natural parameters are required. Moment parameters and the half
/// log-determinant of the precision are derived from its Cholesky factor
/// unless they are supplied.
#[derive(Debug, Clone)]
pub struct TiltedReference {
    natural: GaussianNatural,
    moment: Option<GaussianMoment>,
    half_log_det: Option<f64>,
}

impl TiltedReference {
    pub fn new(natural: GaussianNatural) -> Self {
        Self {
            natural,
            moment: None,
            half_log_det: None,
        }
    }

    pub fn with_moment(mut self, moment: GaussianMoment) -> Result<Self> {
        check_dim("reference moment dimension", self.natural.dim(), moment.dim())?;
        self.moment = Some(moment);
        Ok(self)
    }

    /// Sum of the log-diagonal of the Cholesky factor of the precision.
    pub fn with_half_log_det(mut self, half_log_det: f64) -> Self {
        self.half_log_det = Some(half_log_det);
        self
    }

    pub fn natural(&self) -> &GaussianNatural {
        &self.natural
    }

    pub fn dim(&self) -> usize {
        self.natural.dim()
    }

    fn resolve(&self) -> Result<(GaussianMoment, f64)> {
        if let (Some(moment), Some(half_log_det)) = (&self.moment, self.half_log_det) {
            return Ok((moment.clone(), half_log_det));
        }
        let factor = cholesky_upper(&self.natural.precision)?;
        let half_log_det = self.half_log_det.unwrap_or_else(|| half_log_det(&factor));
        let moment = match &self.moment {
            Some(moment) => moment.clone(),
            None => {
                let (covariance, mean) = invert_normal_params(
                    Operand::Allocate(&factor),
                    Some(Operand::Allocate(&self.natural.info)),
                    MatrixForm::UpperCholesky,
                )?;
                GaussianMoment {
                    covariance: covariance.into_owned(),
                    mean: mean.map(Slot::into_owned).unwrap_or_else(|| Col::zeros(0)),
                }
            }
        };
        Ok((moment, half_log_det))
    }
}

/// Fitted control variate coefficients.
#[derive(Debug, Clone)]
pub enum Coefficients {
    /// Coefficient matrix `a` with `estimate -= mean(h - E h) · a`.
    Full(Mat<f64>),
    /// One coefficient per dimension.
    Diagonal(Col<f64>),
}

impl Coefficients {
    fn regulate(&mut self, options: &CvOptions) {
        let adjust = |val: &mut f64| {
            if let Some(factor) = options.correlation_regularizer {
                *val *= factor;
            }
            if let Some(max) = options.max_correlation {
                *val = val.clamp(-max, max);
            }
        };
        match self {
            Coefficients::Full(a) => {
                faer::zip!(a.as_mut()).for_each(|faer::unzip!(val)| adjust(val))
            }
            Coefficients::Diagonal(a) => a.iter_mut().for_each(adjust),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CvCoefficients {
    pub mean: Coefficients,
    /// Coefficients of the packed covariance (see [`crate::packing`]).
    pub covariance: Coefficients,
}

#[derive(Debug, Clone)]
pub struct CvEstimate {
    pub mean: Col<f64>,
    pub covariance: Mat<f64>,
    /// False if the plain sample moments were returned instead.
    pub used_control_variate: bool,
    /// Present if requested and the control variate was used.
    pub coefficients: Option<CvCoefficients>,
}

/// Scale factors for the regression of `f` on `h`.
#[derive(Debug, Clone, Copy)]
struct Scaling {
    cov: f64,
    var: f64,
    /// Degrees of freedom removed from the mean of `f`.
    ddof_f: usize,
}

/// Estimate `E f` using `h` with known expectation `expected_h` as control
/// variate. Both `f` and `h` have one row per sample.
fn regress(
    f: &Mat<f64>,
    h: &Mat<f64>,
    expected_h: &Col<f64>,
    options: &CvOptions,
    scaling: Scaling,
) -> Result<(Col<f64>, Coefficients)> {
    let (n, k) = (f.nrows(), f.ncols());
    let denom = (n - scaling.ddof_f) as f64;
    let mean_f = Col::from_fn(k, |j| f.col(j).sum() / denom);
    let fc = centered(f, &mean_f);
    let hc = centered(h, expected_h);

    let mut coefficients = if options.multiple_control_variates {
        let mut var_h = hc.transpose() * &hc;
        let mut cov_fh = hc.transpose() * &fc;
        var_h *= Scale(scaling.var);
        cov_fh *= Scale(scaling.cov);
        Coefficients::Full(solve_spd(var_h, cov_fh)?)
    } else {
        Coefficients::Diagonal(Col::from_fn(k, |j| {
            let cov = hc.col(j).transpose() * fc.col(j);
            let var = hc.col(j).squared_norm_l2();
            (cov * scaling.cov) / (var * scaling.var)
        }))
    };
    coefficients.regulate(options);

    let hm = Col::from_fn(k, |j| hc.col(j).sum() / n as f64);
    let correction = match &coefficients {
        Coefficients::Full(a) => a.transpose() * &hm,
        Coefficients::Diagonal(a) => Col::from_fn(k, |j| hm[j] * a[j]),
    };
    Ok((mean_f - correction, coefficients))
}

/// Fraction of samples strictly below `center`, per dimension.
fn fraction_below(samples: &Mat<f64>, center: &Col<f64>) -> Vec<f64> {
    let n = samples.nrows() as f64;
    (0..samples.ncols())
        .map(|j| {
            (0..samples.nrows())
                .filter(|&r| samples[(r, j)] < center[j])
                .count() as f64
                / n
        })
        .collect()
}

/// Estimate mean and covariance of the distribution the `samples` were drawn
/// from, using the `reference` Gaussian as control variate.
///
/// `log_density` must hold the *normalized* log-density of the sampled
/// distribution at each sample. This is not checked; unnormalized values bias
/// the estimate.
///
/// If the samples are too unbalanced around the reference mean (see
/// [`CvOptions::mean_balance_threshold`]) the plain sample mean and unbiased
/// sample covariance are returned with `used_control_variate == false`.
pub fn cv_moments(
    samples: &Mat<f64>,
    log_density: &[f64],
    reference: &TiltedReference,
    options: &CvOptions,
) -> Result<CvEstimate> {
    options.validate()?;
    let (n, dim) = (samples.nrows(), samples.ncols());
    check_dim("log density length", n, log_density.len())?;
    check_dim("reference dimension", dim, reference.dim())?;
    if n < 2 {
        return Err(EpError::Configuration(format!(
            "control variate estimate needs at least two samples, got {n}"
        )));
    }

    let (tilted, half_log_det) = reference.resolve()?;
    let precision = &reference.natural().precision;

    // Importance ratios between the reference and the sampled distribution.
    let constant = half_log_det - 0.5 * dim as f64 * LOG_2PI;
    let dev_tilde = centered(samples, &tilted.mean);
    let projected = &dev_tilde * precision;
    let weights: Vec<f64> = (0..n)
        .map(|r| {
            let quad = projected.row(r) * dev_tilde.row(r).transpose();
            (constant - 0.5 * quad - log_density[r]).exp()
        })
        .collect();

    if let Some(threshold) = options.mean_balance_threshold {
        let threshold = if threshold < 0.5 {
            1. - threshold
        } else {
            threshold
        };
        let fractions = fraction_below(samples, &tilted.mean);
        if fractions
            .iter()
            .any(|&frac| frac > threshold || frac < 1. - threshold)
        {
            warn!(
                "Samples unbalanced around the reference mean (fractions below: {:?}), \
                 using plain sample moments",
                fractions
            );
            let plain = GaussianMoment::from_samples(samples)?;
            return Ok(CvEstimate {
                mean: plain.mean,
                covariance: plain.covariance,
                used_control_variate: false,
                coefficients: None,
            });
        }
    }

    let nf = n as f64;

    // Mean
    let h = Mat::from_fn(n, dim, |r, j| samples[(r, j)] * weights[r]);
    let (mean, a_mean) = regress(
        samples,
        &h,
        &tilted.mean,
        options,
        Scaling {
            cov: nf,
            var: nf - 1.,
            ddof_f: 0,
        },
    )?;

    // Covariance, on the packed upper triangle.
    let outer = packed_outer_products(&dev_tilde);
    let h = Mat::from_fn(n, outer.ncols(), |r, j| outer[(r, j)] * weights[r]);
    let expected_h = pack(&tilted.covariance)?;
    let f = packed_outer_products(&centered(samples, &mean));
    let (packed, a_covariance) = regress(
        &f,
        &h,
        &expected_h,
        options,
        Scaling {
            cov: nf * nf,
            var: (nf - 1.) * (nf - 1.),
            ddof_f: 1,
        },
    )?;
    let covariance = unpack(&packed)?;
    debug!("Control variate moments estimated from {n} samples");

    Ok(CvEstimate {
        mean,
        covariance,
        used_control_variate: true,
        coefficients: options.return_coefficients.then_some(CvCoefficients {
            mean: a_mean,
            covariance: a_covariance,
        }),
    })
}
