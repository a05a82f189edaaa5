//! Single-assignment placeholder cells.
//!
//! Instructions are built before the final position of the things they
//! reference is known: function and global indices are assigned when the
//! module is linearized, stack offsets when a function's frame is resolved.
//! A [`Latent`] is created at declaration time, cloned into every instruction
//! that needs it, and written exactly once later. All clones observe the same
//! value.

use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LatentError {
    #[error("`{0}` was read before it was resolved")]
    Unresolved(&'static str),

    #[error("`{0}` was resolved more than once")]
    AlreadyResolved(&'static str),
}

/// A shared, write-once value.
#[derive(Clone)]
pub struct Latent<T: Copy> {
    cell: Rc<OnceCell<T>>,
    label: &'static str,
}

impl<T: Copy> Latent<T> {
    /// Create an unresolved cell. `label` names it in error messages.
    pub fn new(label: &'static str) -> Self {
        Self {
            cell: Rc::new(OnceCell::new()),
            label,
        }
    }

    /// Create a cell that is already resolved.
    pub fn resolved(label: &'static str, value: T) -> Self {
        let latent = Self::new(label);
        let _ = latent.cell.set(value);
        latent
    }

    pub fn resolve(&self, value: T) -> Result<(), LatentError> {
        self.cell
            .set(value)
            .map_err(|_| LatentError::AlreadyResolved(self.label))
    }

    pub fn get(&self) -> Result<T, LatentError> {
        self.cell
            .get()
            .copied()
            .ok_or(LatentError::Unresolved(self.label))
    }

    pub fn try_get(&self) -> Option<T> {
        self.cell.get().copied()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Whether two handles share the same cell.
    pub fn same_cell(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Latent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.get() {
            Some(value) => write!(f, "{}={:?}", self.label, value),
            None => write!(f, "{}=?", self.label),
        }
    }
}
