//! Building blocks for distributed expectation propagation with Gaussian
//! site approximations.
//!
//! The crate covers switching between moment and natural parameters of
//! multivariate normals, shrinkage and control variate estimates of tilted
//! distribution moments, assignment of data groups to sites and the update
//! loop of individual sites.

pub(crate) mod buffer;
pub(crate) mod control_variate;
pub(crate) mod distribute;
pub(crate) mod error;
pub(crate) mod gaussian;
pub(crate) mod layout;
pub mod linalg;
pub mod packing;
pub(crate) mod shrinkage;
pub(crate) mod site;

pub use buffer::{Buffer, Operand, Slot};
pub use control_variate::{
    cv_moments, Coefficients, CvCoefficients, CvEstimate, CvOptions, TiltedReference,
};
pub use distribute::{distribute_groups, GroupSizes, Partition, SiteAssignment};
pub use error::{EpError, Result};
pub use gaussian::{
    invert_normal_params, invert_spd, GaussianMoment, GaussianNatural, MatrixForm,
};
pub use layout::{
    col_from_slice, col_to_vec, mat_from_slice, mat_to_vec, symmetric_from_slice, Layout,
};
pub use shrinkage::olse;
pub use site::{
    estimate_tilted, global_approximation, update_sites_parallel, DrawBatch, PrecisionEstimator,
    Site, SiteSettings, SiteUpdate, TiltedEstimate, TiltedSampler,
};
