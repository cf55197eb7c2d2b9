//! Expectation propagation updates of a single site.
//!
//! A site owns a sampler for its tilted distribution, the cavity distribution
//! times the likelihood of the site's data, and a Gaussian approximation of
//! that likelihood in natural parameters. An update samples the tilted
//! distribution, estimates its moments and moves the site approximation
//! towards the difference between the tilted estimate and the cavity.

use faer::Mat;
use log::{debug, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    buffer::Operand,
    control_variate::{cv_moments, CvOptions, TiltedReference},
    error::{check_dim, EpError, Result},
    gaussian::{GaussianMoment, GaussianNatural},
    layout::{mat_from_slice, Layout},
    linalg::mat_vec,
    shrinkage::olse,
};

/// Draws from a tilted distribution with their log-densities.
#[derive(Debug, Clone)]
pub struct DrawBatch {
    pub draws: Vec<f64>,
    pub num_draws: usize,
    pub dim: usize,
    pub layout: Layout,
    /// Normalized log-density of the tilted distribution at every draw.
    pub log_density: Vec<f64>,
}

impl DrawBatch {
    pub fn samples(&self) -> Result<Mat<f64>> {
        check_dim("log density length", self.num_draws, self.log_density.len())?;
        mat_from_slice(&self.draws, self.num_draws, self.dim, self.layout)
    }
}

/// Samples the tilted distribution of a site.
///
/// This needs to be implemented by users of the library; it wraps whatever
/// sampler can draw from the product of the cavity distribution and the
/// likelihood of the site's data.
pub trait TiltedSampler {
    type Error: std::error::Error + Send + Sync + 'static;

    fn dim(&self) -> usize;

    /// Draw `num_draws` samples from the cavity distribution times the site
    /// likelihood, returning them with their normalized log-densities.
    fn sample<R: Rng + ?Sized>(
        &mut self,
        cavity: &GaussianNatural,
        num_draws: usize,
        rng: &mut R,
    ) -> std::result::Result<DrawBatch, Self::Error>;
}

/// How the natural parameters of the tilted distribution are estimated from
/// its draws.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PrecisionEstimator {
    /// Invert the unbiased sample covariance.
    Sample,
    /// Optimal linear shrinkage of the inverse sample covariance.
    Olse,
    /// Control variate moments against the current global approximation.
    ControlVariate(CvOptions),
}

impl Default for PrecisionEstimator {
    fn default() -> Self {
        PrecisionEstimator::ControlVariate(CvOptions::default())
    }
}

/// Settings for site updates
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SiteSettings {
    /// Number of draws from the tilted distribution per update.
    pub num_draws: usize,
    pub estimator: PrecisionEstimator,
    /// Fraction of the way the site approximation moves towards the new
    /// estimate in each update.
    pub damping: f64,
    /// Seed of the random number generators. Each site draws from its own
    /// stream.
    pub seed: u64,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            num_draws: 1000,
            estimator: PrecisionEstimator::default(),
            damping: 1.,
            seed: 42,
        }
    }
}

impl SiteSettings {
    pub fn validate(&self) -> Result<()> {
        if self.num_draws < 2 {
            return Err(EpError::Configuration(format!(
                "a site update needs at least two draws, got {}",
                self.num_draws
            )));
        }
        if !(self.damping > 0. && self.damping <= 1.) {
            return Err(EpError::Configuration(format!(
                "damping must lie in (0, 1], got {}",
                self.damping
            )));
        }
        if let PrecisionEstimator::ControlVariate(options) = &self.estimator {
            options.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TiltedEstimate {
    pub natural: GaussianNatural,
    pub used_control_variate: bool,
    /// The control variate covariance was not positive definite and the
    /// shrinkage estimate of the sample covariance was used instead.
    pub used_shrinkage_fallback: bool,
}

fn shrinkage_natural(moment: &GaussianMoment, num_samples: usize) -> Result<GaussianNatural> {
    let precision = olse(Operand::Allocate(&moment.covariance), num_samples, None)?.into_owned();
    let info = mat_vec(&precision, &moment.mean);
    Ok(GaussianNatural { precision, info })
}

/// Estimate the natural parameters of the distribution `samples` were drawn
/// from. `reference` is only used by the control variate estimator.
pub fn estimate_tilted(
    samples: &Mat<f64>,
    log_density: &[f64],
    reference: &GaussianNatural,
    estimator: &PrecisionEstimator,
) -> Result<TiltedEstimate> {
    let n = samples.nrows();
    match estimator {
        PrecisionEstimator::Sample => Ok(TiltedEstimate {
            natural: GaussianNatural::estimate_from_samples(samples, None)?,
            used_control_variate: false,
            used_shrinkage_fallback: false,
        }),
        PrecisionEstimator::Olse => Ok(TiltedEstimate {
            natural: shrinkage_natural(&GaussianMoment::from_samples(samples)?, n)?,
            used_control_variate: false,
            used_shrinkage_fallback: false,
        }),
        PrecisionEstimator::ControlVariate(options) => {
            let estimate = cv_moments(
                samples,
                log_density,
                &TiltedReference::new(reference.clone()),
                options,
            )?;
            let moment = GaussianMoment::new(estimate.mean, estimate.covariance)?;
            match moment.to_natural() {
                Ok(natural) => Ok(TiltedEstimate {
                    natural,
                    used_control_variate: estimate.used_control_variate,
                    used_shrinkage_fallback: false,
                }),
                Err(EpError::Factorization { reason, .. }) => {
                    warn!(
                        "Covariance estimate is not positive definite ({reason}), \
                         using shrinkage estimate"
                    );
                    Ok(TiltedEstimate {
                        natural: shrinkage_natural(&GaussianMoment::from_samples(samples)?, n)?,
                        used_control_variate: false,
                        used_shrinkage_fallback: true,
                    })
                }
                Err(err) => Err(err),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SiteUpdate {
    pub site: usize,
    /// The site approximation after the update.
    pub approximation: GaussianNatural,
    pub used_control_variate: bool,
    pub used_shrinkage_fallback: bool,
}

pub struct Site<S: TiltedSampler> {
    index: usize,
    sampler: S,
    settings: SiteSettings,
    approximation: GaussianNatural,
    rng: ChaCha8Rng,
}

impl<S: TiltedSampler> Site<S> {
    /// A site with a flat initial approximation.
    pub fn new(index: usize, sampler: S, settings: SiteSettings) -> Result<Self> {
        settings.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
        rng.set_stream(index as u64);
        Ok(Self {
            index,
            approximation: GaussianNatural::zeros(sampler.dim()),
            sampler,
            settings,
            rng,
        })
    }

    pub fn with_approximation(mut self, approximation: GaussianNatural) -> Result<Self> {
        check_dim("site approximation", self.sampler.dim(), approximation.dim())?;
        self.approximation = approximation;
        Ok(self)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn approximation(&self) -> &GaussianNatural {
        &self.approximation
    }

    pub fn settings(&self) -> &SiteSettings {
        &self.settings
    }

    /// Run one update against the current global approximation.
    pub fn update(&mut self, global: &GaussianNatural) -> Result<SiteUpdate> {
        check_dim("global approximation", self.sampler.dim(), global.dim())?;
        let cavity = global.combine(&self.approximation, -1.)?;

        let batch = self
            .sampler
            .sample(&cavity, self.settings.num_draws, &mut self.rng)
            .map_err(|err| EpError::Sampler(Box::new(err)))?;
        check_dim("draw dimension", self.sampler.dim(), batch.dim)?;
        let samples = batch.samples()?;

        let tilted = estimate_tilted(
            &samples,
            &batch.log_density,
            global,
            &self.settings.estimator,
        )?;
        let target = tilted.natural.combine(&cavity, -1.)?;
        self.approximation = self
            .approximation
            .damped_towards(&target, self.settings.damping)?;
        debug!(
            "Updated site {} from {} draws (control variate: {})",
            self.index, batch.num_draws, tilted.used_control_variate
        );

        Ok(SiteUpdate {
            site: self.index,
            approximation: self.approximation.clone(),
            used_control_variate: tilted.used_control_variate,
            used_shrinkage_fallback: tilted.used_shrinkage_fallback,
        })
    }
}

/// Update all sites against the same global approximation in parallel.
///
/// Every site only touches its own sampler, buffers and random stream, so the
/// result is the same as updating them one after another.
pub fn update_sites_parallel<S>(
    sites: &mut [Site<S>],
    global: &GaussianNatural,
) -> Result<Vec<SiteUpdate>>
where
    S: TiltedSampler + Send,
{
    sites
        .par_iter_mut()
        .map(|site| site.update(global))
        .collect()
}

/// Sum of a prior and all site approximations.
pub fn global_approximation<S: TiltedSampler>(
    prior: &GaussianNatural,
    sites: &[Site<S>],
) -> Result<GaussianNatural> {
    sites
        .iter()
        .try_fold(prior.clone(), |acc, site| acc.combine(site.approximation(), 1.))
}

#[cfg(test)]
mod tests {
    use faer::{Col, Mat};
    use rand::{rngs::SmallRng, SeedableRng};

    use super::{estimate_tilted, PrecisionEstimator, SiteSettings};
    use crate::{
        control_variate::CvOptions,
        gaussian::{GaussianMoment, GaussianNatural},
        layout::col_to_vec,
        EpError,
    };

    #[test]
    fn settings_validation() {
        assert!(SiteSettings::default().validate().is_ok());
        let bad_damping = SiteSettings {
            damping: 0.,
            ..Default::default()
        };
        assert!(matches!(
            bad_damping.validate().unwrap_err(),
            EpError::Configuration(_)
        ));
        let bad_draws = SiteSettings {
            num_draws: 1,
            ..Default::default()
        };
        assert!(bad_draws.validate().is_err());
    }

    #[test]
    fn estimators_agree_on_large_samples() {
        let truth = GaussianMoment::new(
            Col::from_fn(2, |i| [0.5, -1.][i]),
            Mat::from_fn(2, 2, |i, j| if i == j { 1. } else { 0.3 }),
        )
        .unwrap()
        .to_natural()
        .unwrap();
        let mut rng = SmallRng::seed_from_u64(11);
        let samples = truth.sample(10_000, &mut rng).unwrap();
        let lp = col_to_vec(&truth.log_density(&samples).unwrap());

        for estimator in [
            PrecisionEstimator::Sample,
            PrecisionEstimator::Olse,
            PrecisionEstimator::ControlVariate(CvOptions::default()),
        ] {
            let estimate = estimate_tilted(&samples, &lp, &truth, &estimator).unwrap();
            assert!(!estimate.used_shrinkage_fallback);
            for i in 0..2 {
                assert!((estimate.natural.info[i] - truth.info[i]).abs() < 0.1);
                for j in 0..2 {
                    assert!(
                        (estimate.natural.precision[(i, j)] - truth.precision[(i, j)]).abs() < 0.1
                    );
                }
            }
        }
    }

    #[test]
    fn flat_reference_needs_positive_definite_precision() {
        let samples = Mat::from_fn(10, 2, |i, j| (i * (j + 1)) as f64);
        let lp = vec![0.; 10];
        let err = estimate_tilted(
            &samples,
            &lp,
            &GaussianNatural::zeros(2),
            &PrecisionEstimator::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EpError::Factorization { .. }));
    }
}
