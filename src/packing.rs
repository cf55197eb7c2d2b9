//! Half-vectorization of symmetric matrices.
//!
//! A symmetric `d × d` matrix is packed into a vector of length `d(d+1)/2`
//! holding its upper triangle in row-major order:
//! `(0,0), (0,1), …, (0,d-1), (1,1), (1,2), …, (d-1,d-1)`.

use faer::{Col, Mat};
use multiversion::multiversion;

use crate::error::{check_dim, EpError, Result};
use crate::linalg::check_square;

/// Number of elements in the upper triangle of a `dim × dim` matrix.
pub fn packed_len(dim: usize) -> usize {
    // Halve the even factor first so the product does not overflow early.
    if dim % 2 == 0 {
        (dim / 2) * (dim + 1)
    } else {
        dim.div_ceil(2) * dim
    }
}

/// Dimension of the square matrix whose upper triangle has `len` elements.
pub fn unpacked_dim(len: usize) -> Result<usize> {
    let mut dim = ((2. * len as f64).sqrt()) as usize;
    while packed_len(dim) < len {
        dim += 1;
    }
    while dim > 0 && packed_len(dim) > len {
        dim -= 1;
    }
    if packed_len(dim) != len {
        return Err(EpError::Configuration(format!(
            "{len} is not the length of a packed upper triangle"
        )));
    }
    Ok(dim)
}

/// Pack the upper triangle of `a` row by row.
pub fn pack(a: &Mat<f64>) -> Result<Col<f64>> {
    let dim = check_square("packed matrix", a)?;
    let mut out = Col::<f64>::zeros(packed_len(dim));
    let mut idx = 0;
    for i in 0..dim {
        for j in i..dim {
            out[idx] = a[(i, j)];
            idx += 1;
        }
    }
    Ok(out)
}

/// Inverse of [`pack`]: build the full symmetric matrix.
pub fn unpack(packed: &Col<f64>) -> Result<Mat<f64>> {
    let dim = unpacked_dim(packed.nrows())?;
    let mut out = Mat::<f64>::zeros(dim, dim);
    unpack_into(packed, &mut out)?;
    Ok(out)
}

pub fn unpack_into(packed: &Col<f64>, out: &mut Mat<f64>) -> Result<()> {
    let dim = check_square("unpacked matrix", out)?;
    check_dim("packed vector", packed_len(dim), packed.nrows())?;
    let mut idx = 0;
    for i in 0..dim {
        for j in i..dim {
            out[(i, j)] = packed[idx];
            out[(j, i)] = packed[idx];
            idx += 1;
        }
    }
    Ok(())
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
fn packed_outer_row(x: &[f64], out: &mut [f64]) {
    let mut idx = 0;
    for (i, &xi) in x.iter().enumerate() {
        for &xj in &x[i..] {
            out[idx] = xi * xj;
            idx += 1;
        }
    }
}

/// Packed outer product `x xᵀ` of every row `x` of `rows`.
///
/// Row `r` of the result is `pack(rows[r]ᵀ rows[r])`.
pub fn packed_outer_products(rows: &Mat<f64>) -> Mat<f64> {
    let (n, dim) = (rows.nrows(), rows.ncols());
    let len = packed_len(dim);
    let mut out = Mat::<f64>::zeros(n, len);
    let mut row = vec![0f64; dim];
    let mut packed = vec![0f64; len];
    for r in 0..n {
        row.iter_mut()
            .enumerate()
            .for_each(|(j, val)| *val = rows[(r, j)]);
        packed_outer_row(&row, &mut packed);
        for (k, &val) in packed.iter().enumerate() {
            out[(r, k)] = val;
        }
    }
    out
}
