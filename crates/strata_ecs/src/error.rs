use thiserror::Error;

use strata_memory::AllocError;

/// Recoverable failures of the entity store.
///
/// Everything else (unknown entities, type-token mismatches, unregistered
/// components) is a precondition violation and panics; the store makes no
/// attempt to continue after one.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Column storage could not grow. The store's state is unchanged.
    #[error("failed to grow column storage")]
    AllocationFailure(#[from] AllocError),
}
