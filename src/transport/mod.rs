//! Transport primitives
//!
//! Raw-stream building blocks shared by the tunnel and the HTTP paths:
//! a read-ahead duplex wrapper, request-head parsing, a status-line writer
//! and the bidirectional splice.

mod head;
mod prebuffered;
mod splice;

pub use head::{parse_request_head, peek_request_head, status_line, write_status, CONNECTION_ESTABLISHED};
pub use prebuffered::Prebuffered;
pub use splice::splice;

/// Maximum size of a request head read from a raw connection
pub const MAX_HEAD_LEN: usize = 64 * 1024;
