//! File Transfer Module
//!
//! Base64 file transfer framed by a single ASCII control line:
//!
//! ```text
//! FILE_TRANSFER:<filename>:<base64-byte-count>\n<base64 payload>
//! ```
//!
//! No further framing and no checksum.

mod codec;

pub use codec::{receive_file, send_file, TransferError, TransferHeader, FILE_TRANSFER_PREFIX};
