//! The Quay coordination engine.
//!
//! Given a client PUT/GET/HEAD/DELETE for an object, the engine fans the
//! request out to the backend nodes chosen by the placement ring, drives one
//! connection per node, and resolves the many backend outcomes into a single
//! client-facing response:
//!
//! - replicated policies go through [`QuorumResolver`];
//! - erasure-coded GET goes through [`FragmentReconstructor`];
//! - erasure-coded PUT adds the multi-phase durable-commit protocol.
//!
//! Controllers are selected per request from the storage policy via
//! [`controller_for`]; both variants share the placement, backend, and
//! quorum toolkit.

pub mod body;
pub mod conditional;
pub mod config;
pub mod controller;
pub mod error;
pub mod expiry;
pub mod outcome;
pub mod quorum;
pub mod range;
pub mod reconstruct;

pub use body::{BytesBody, ClientBody, ClientBodyError};
pub use config::ProxyConfig;
pub use controller::{
    ClientResponse, EcController, FootersCallback, ObjectController, ObjectRequest,
    ReplicatedController, controller_for,
};
pub use error::ProxyError;
pub use outcome::BackendOutcome;
pub use quorum::{Decision, QuorumResolver};
pub use range::{ByteRange, parse_range};
pub use reconstruct::{Feed, FragmentBucket, FragmentReconstructor, PreferenceHint};

#[cfg(test)]
mod tests;
