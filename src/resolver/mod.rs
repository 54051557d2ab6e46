//! URL resolution: record identifier to ordered candidate locations.
//!
//! The remote storage has moved archives between several directory layouts
//! over time. [`LayoutResolver`] expands each configured layout template for a
//! record, most likely layout first. Resolution is pure string work; nothing
//! here touches the network.

mod layout;

pub use layout::{Candidates, DEFAULT_LAYOUTS, LayoutResolver};

use thiserror::Error;

/// Errors raised while building candidates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The record cannot be turned into candidate URLs.
    #[error("malformed identifier {id}: {reason}")]
    MalformedIdentifier {
        /// Offending record identifier.
        id: i64,
        /// Why the identifier was rejected.
        reason: String,
    },

    /// A layout template cannot produce a usable URL.
    #[error("invalid layout '{template}': {reason}")]
    InvalidLayout {
        /// The rejected template.
        template: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ResolveError {
    pub(crate) fn malformed(id: i64, reason: impl Into<String>) -> Self {
        Self::MalformedIdentifier {
            id,
            reason: reason.into(),
        }
    }
}
