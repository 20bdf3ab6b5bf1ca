//! Error types for the pageout core.
//!
//! Most abnormal conditions inside the reclamation loop (an ineligible page,
//! a full writeback queue, a blown CPU budget) are not errors at all — they
//! are expected outcomes reported inline as enum variants and counted in
//! [`crate::stats::PageoutStats`]. The types here cover the boot-time and
//! integration failures a host program can actually react to.

use thiserror::Error;

/// Result alias used throughout this crate's fallible, boundary-facing APIs.
pub type Result<T> = std::result::Result<T, PageoutError>;

/// Top-level error type returned by [`crate::PageoutEngine`] construction
/// and control operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PageoutError {
    /// The supplied [`crate::config::PageoutTunables`] failed validation.
    #[error("invalid tunables: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while validating operator-supplied tunables.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// `min_percent_cpu` was greater than `max_percent_cpu`.
    #[error("min_percent_cpu ({min}) must be <= max_percent_cpu ({max})")]
    CpuBudgetOrder {
        /// The offending minimum.
        min: u64,
        /// The offending maximum.
        max: u64,
    },

    /// A percent-of-CPU tunable was outside `0..=100`.
    #[error("percent_cpu values must be in 0..=100, got {0}")]
    PercentOutOfRange(u64),

    /// `lotsfree_fraction` was explicitly set to zero.
    #[error("lotsfree_fraction must be nonzero")]
    ZeroFraction,

    /// `async_list_size` was explicitly set to zero.
    #[error("async_list_size must be nonzero")]
    ZeroQueueCapacity,

    /// `total_pages` was zero; there is nothing to reclaim.
    #[error("total_pages must be nonzero")]
    ZeroTotalPages,
}
