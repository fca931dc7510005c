//! Backend wire-header names.
//!
//! One HTTP request per node per verb; these are the Quay-specific headers
//! layered on top of the standard method/path/headers. Header-name matching
//! is case-insensitive at the transport layer; constants here use the
//! canonical spelling.

/// Object timestamp for the operation.
pub const TIMESTAMP: &str = "X-Timestamp";
/// Timestamp a backend reports when refusing an older write.
pub const BACKEND_TIMESTAMP: &str = "X-Backend-Timestamp";
/// Timestamp at which a fragment became durable on the responding node.
pub const BACKEND_DURABLE_TIMESTAMP: &str = "X-Backend-Durable-Timestamp";
/// Storage-policy index the backend should file the object under.
pub const STORAGE_POLICY_INDEX: &str = "X-Backend-Storage-Policy-Index";

/// Footer-capability negotiation: the proxy will append a metadata part.
pub const METADATA_FOOTER: &str = "X-Backend-Obj-Metadata-Footer";
/// Multi-phase-commit negotiation (erasure-coded PUT only).
pub const MULTIPHASE_COMMIT: &str = "X-Backend-Obj-Multiphase-Commit";
/// Declared multipart boundary token for the PUT body envelope.
pub const MULTIPART_BOUNDARY: &str = "X-Backend-Obj-Multipart-Mime-Boundary";
/// Object byte count as visible to the backend (envelope excluded).
pub const BACKEND_CONTENT_LENGTH: &str = "X-Backend-Obj-Content-Length";

/// Whole-object content length (erasure-coded system attribute).
pub const EC_CONTENT_LENGTH: &str = "X-Object-Sysmeta-Ec-Content-Length";
/// Whole-object etag (erasure-coded system attribute).
pub const EC_ETAG: &str = "X-Object-Sysmeta-Ec-Etag";
/// Segment size used when the object was encoded.
pub const EC_SEGMENT_SIZE: &str = "X-Object-Sysmeta-Ec-Segment-Size";
/// Fragment position of the stored piece.
pub const EC_FRAG_INDEX: &str = "X-Object-Sysmeta-Ec-Frag-Index";
/// Fragment preference hints sent on erasure-coded GET.
pub const FRAGMENT_PREFERENCES: &str = "X-Backend-Fragment-Preferences";

/// Name of the sysmeta attribute conditional requests should compare
/// against instead of the default etag.
pub const ETAG_IS_AT: &str = "X-Backend-Etag-Is-At";

/// Container-update override etag, carried in the footer document.
pub const CONTAINER_UPDATE_OVERRIDE_ETAG: &str = "X-Backend-Container-Update-Override-Etag";
/// Container-update override size, carried in the footer document.
pub const CONTAINER_UPDATE_OVERRIDE_SIZE: &str = "X-Backend-Container-Update-Override-Size";

/// Absolute expiry time (epoch seconds).
pub const DELETE_AT: &str = "X-Delete-At";
/// Relative expiry (seconds from now); converted to [`DELETE_AT`].
pub const DELETE_AFTER: &str = "X-Delete-After";
/// Node responsible for expiry bookkeeping.
pub const DELETE_AT_HOST: &str = "X-Delete-At-Host";
/// Device for expiry bookkeeping.
pub const DELETE_AT_DEVICE: &str = "X-Delete-At-Device";
/// Partition for expiry bookkeeping.
pub const DELETE_AT_PARTITION: &str = "X-Delete-At-Partition";
/// Expiry bookkeeping container.
pub const DELETE_AT_CONTAINER: &str = "X-Delete-At-Container";

/// Section name header inside the multipart PUT envelope.
pub const DOCUMENT: &str = "X-Document";

/// Standard headers the coordination layer inspects.
pub const ETAG: &str = "Etag";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_RANGE: &str = "Content-Range";
pub const IF_MATCH: &str = "If-Match";
pub const IF_NONE_MATCH: &str = "If-None-Match";
pub const RANGE: &str = "Range";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
