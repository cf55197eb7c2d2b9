//! Conversion between flat buffers and the column-major matrices used by the
//! linear algebra routines.
//!
//! All conversions happen here, at the boundary; everything past this module
//! works on `faer` matrices, which are column-major.

use faer::{Col, Mat};
use serde::{Deserialize, Serialize};

use crate::error::{check_dim, Result};

/// Element order of a flat matrix buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Layout {
    /// Consecutive elements belong to the same row (one draw after another).
    #[default]
    RowMajor,
    /// Consecutive elements belong to the same column.
    ColMajor,
}

impl Layout {
    fn index(self, nrows: usize, ncols: usize, row: usize, col: usize) -> usize {
        match self {
            Layout::RowMajor => row * ncols + col,
            Layout::ColMajor => col * nrows + row,
        }
    }

    pub fn transposed(self) -> Self {
        match self {
            Layout::RowMajor => Layout::ColMajor,
            Layout::ColMajor => Layout::RowMajor,
        }
    }
}

pub fn mat_from_slice(
    data: &[f64],
    nrows: usize,
    ncols: usize,
    layout: Layout,
) -> Result<Mat<f64>> {
    check_dim("matrix buffer", nrows * ncols, data.len())?;
    Ok(Mat::from_fn(nrows, ncols, |i, j| {
        data[layout.index(nrows, ncols, i, j)]
    }))
}

/// Read a symmetric matrix from a flat buffer.
///
/// The transpose of a symmetric matrix is the matrix itself, so a row-major
/// buffer is read as if it were column-major.
pub fn symmetric_from_slice(data: &[f64], dim: usize, layout: Layout) -> Result<Mat<f64>> {
    let layout = match layout {
        Layout::RowMajor => layout.transposed(),
        Layout::ColMajor => layout,
    };
    mat_from_slice(data, dim, dim, layout)
}

pub fn mat_to_vec(mat: &Mat<f64>, layout: Layout) -> Vec<f64> {
    let (nrows, ncols) = (mat.nrows(), mat.ncols());
    let mut out = vec![0f64; nrows * ncols];
    for j in 0..ncols {
        for i in 0..nrows {
            out[layout.index(nrows, ncols, i, j)] = mat[(i, j)];
        }
    }
    out
}

pub fn col_from_slice(data: &[f64]) -> Col<f64> {
    Col::from_fn(data.len(), |i| data[i])
}

pub fn col_to_vec(col: &Col<f64>) -> Vec<f64> {
    (0..col.nrows()).map(|i| col[i]).collect()
}
