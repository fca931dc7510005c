//! Per-node backend wire layer.
//!
//! The coordination engine talks to each backend node through one
//! [`Session`] per request, obtained from a [`Connector`]. Transport-level
//! HTTP parsing lives outside Quay; this crate owns what rides on top of
//! it: the request/reply types, the fixed-shape multipart PUT envelope
//! ([`MimeWriter`]/[`parse_mime`]), and the per-node write state machine
//! ([`Putter`]).
//!
//! [`mock`] provides a scripted in-memory connector for tests.

pub mod error;
pub mod mime;
pub mod mock;
pub mod putter;
pub mod request;
pub mod transport;

pub use error::BackendError;
pub use mime::{MimePart, MimeWriter, parse_mime, random_boundary};
pub use putter::{Putter, PutterPhase};
pub use request::{BackendReply, BackendRequest, Method};
pub use transport::{Connector, Interim, Session};
