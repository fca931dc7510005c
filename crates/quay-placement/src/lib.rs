//! Node selection for the Quay coordination layer.
//!
//! The placement ring itself is an external collaborator, consumed through
//! the [`Ring`] trait. This crate owns what the coordination layer does with
//! the ring's answer: per-node failure accounting with time-boxed suppression
//! ([`ErrorLimiter`]) and the ordered, affinity-aware, suppression-filtered
//! candidate sequence ([`NodeIter`]).

pub mod iter;
pub mod limiter;
pub mod ring;

pub use iter::{AffinityPolicy, NodeIter};
pub use limiter::{ErrorKind, ErrorLimiter, ErrorLimiterConfig};
pub use ring::{Ring, StaticRing};
