//! Error taxonomy shared by every controller in the engine.

use crate::api::ApiError;
use thiserror::Error;

/// Errors surfaced by reconcilers and controller plumbing.
///
/// Nothing is swallowed: every non-success propagates here, the queue layer
/// applies backoff, and items that keep failing are dropped once the retry
/// budget or the wall-clock ceiling is exhausted. Delegation conflicts are
/// expected to be repaired by the patroller deleting the orphan on a later
/// sweep.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The delegation UID stored on the physical object does not identify
    /// the current virtual object.
    #[error("delegation uid conflict on {reference}: expected {expected}, found {found}")]
    DelegationConflict {
        /// The object the conflict was detected on.
        reference: String,
        /// The UID of the live virtual object.
        expected: String,
        /// The UID recorded in the delegation annotations.
        found: String,
    },

    /// An API request failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A projection could not be built from the virtual object.
    #[error(transparent)]
    Projection(#[from] vcsync_core::projection::Error),

    /// A cache did not sync before the configured deadline.
    #[error("cache for {reference} did not sync in time")]
    CacheSync {
        /// The cluster or kind whose cache timed out.
        reference: String,
    },

    /// A tenant API client could not be built from the descriptor.
    #[error("failed to connect tenant cluster {cluster}: {message}")]
    Connect {
        /// The tenant's cluster key or descriptor name.
        cluster: String,
        /// Underlying failure.
        message: String,
    },

    /// An adapter hit a state it cannot represent (missing annotations,
    /// undecodable object). Logged loudly and dropped after the retry budget.
    #[error("adapter error: {0}")]
    Adapter(String),
}

impl SyncError {
    /// Whether this failure is expected to clear without outside repair.
    ///
    /// Non-transient failures still go through the same backoff and give-up
    /// path; the distinction only changes how loudly they are logged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Api(ApiError::Service(_) | ApiError::Conflict) | SyncError::CacheSync { .. }
        )
    }
}
