//! Structural self-checks for the per-step data structures.
//!
//! Matrices, receiver graphs and partitions implement [`DebugInvariants`].
//! The checks run on construction in debug builds (or with the
//! `strict-invariants` / `check-invariants` features) and can be called
//! explicitly from tests.

use crate::surface_error::SurfaceError;

/// Trait for validating data structure invariants.
pub trait DebugInvariants {
    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), SurfaceError>;

    /// Panic on the first violated invariant when invariant checking is enabled.
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "structure check failed");
    }
}

/// Length check shared by the invariant implementations.
pub(crate) fn expect_len(
    context: &'static str,
    expected: usize,
    got: usize,
) -> Result<(), SurfaceError> {
    if expected == got {
        Ok(())
    } else {
        Err(SurfaceError::LayoutMismatch {
            context,
            expected,
            got,
        })
    }
}

/// Run a fallible check and panic with context when invariant checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}
