//! Output targets for routines that can work in place.
//!
//! A routine taking an [`Operand`] either allocates a fresh result, overwrites
//! the caller's buffer, or copies the input into a caller-provided buffer and
//! computes there. The result comes back as a [`Slot`], which derefs to the
//! buffer holding it.

use std::ops::{Deref, DerefMut};

use faer::{Col, Mat};

use crate::error::{check_dim, Result};

/// Dense buffers that can be copied into an existing allocation.
pub trait Buffer: Clone {
    fn shape(&self) -> (usize, usize);

    /// Copy all values of `other` into `self`. Shapes must already match.
    fn fill_from(&mut self, other: &Self);
}

impl Buffer for Mat<f64> {
    fn shape(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn fill_from(&mut self, other: &Self) {
        self.copy_from(other);
    }
}

impl Buffer for Col<f64> {
    fn shape(&self) -> (usize, usize) {
        (self.nrows(), 1)
    }

    fn fill_from(&mut self, other: &Self) {
        self.copy_from(other);
    }
}

#[derive(Debug)]
pub enum Operand<'a, T> {
    /// Read the value and write the result into a new buffer.
    Allocate(&'a T),
    /// Overwrite the value with the result.
    Overwrite(&'a mut T),
    /// Copy `source` into `target` and compute the result there.
    CopyInto { source: &'a T, target: &'a mut T },
}

impl<'a, T: Buffer> Operand<'a, T> {
    pub fn source(&self) -> &T {
        match self {
            Operand::Allocate(source) => source,
            Operand::Overwrite(target) => target,
            Operand::CopyInto { source, .. } => source,
        }
    }

    pub(crate) fn resolve(self, what: &'static str) -> Result<Slot<'a, T>> {
        match self {
            Operand::Allocate(source) => Ok(Slot::Owned(source.clone())),
            Operand::Overwrite(target) => Ok(Slot::Borrowed(target)),
            Operand::CopyInto { source, target } => {
                let (rows, cols) = source.shape();
                let (target_rows, target_cols) = target.shape();
                check_dim(what, rows, target_rows)?;
                check_dim(what, cols, target_cols)?;
                target.fill_from(source);
                Ok(Slot::Borrowed(target))
            }
        }
    }
}

impl<'a, T> From<&'a T> for Operand<'a, T> {
    fn from(value: &'a T) -> Self {
        Operand::Allocate(value)
    }
}

impl<'a, T> From<&'a mut T> for Operand<'a, T> {
    fn from(value: &'a mut T) -> Self {
        Operand::Overwrite(value)
    }
}

/// A buffer holding the result of a routine.
#[derive(Debug)]
pub enum Slot<'a, T> {
    Owned(T),
    Borrowed(&'a mut T),
}

impl<T: Clone> Slot<'_, T> {
    /// Take the result out, cloning it if it lives in a caller's buffer.
    pub fn into_owned(self) -> T {
        match self {
            Slot::Owned(value) => value,
            Slot::Borrowed(value) => value.clone(),
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, Slot::Borrowed(_))
    }
}

impl<T> Deref for Slot<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Slot::Owned(value) => value,
            Slot::Borrowed(value) => value,
        }
    }
}

impl<T> DerefMut for Slot<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match self {
            Slot::Owned(value) => value,
            Slot::Borrowed(value) => value,
        }
    }
}
