//! nimbus-multipart: streaming `multipart/form-data` parsing
//!
//! Request bodies arrive as a stream of arbitrarily sized chunks. File parts
//! are written to a staging directory as they are decoded, so memory use is
//! bounded by the header/field limits and the write buffer, never by file size.
//!
//! ```text
//!   Boundary ──▶ Headers ──▶ Data ──┐
//!      ▲                            │
//!      └────────────────────────────┘
//!      │
//!      └──▶ Finished   (on "--boundary--")
//! ```

pub mod content_type;
pub mod headers;
pub mod parser;

pub use content_type::boundary_from_content_type;
pub use headers::{parse_part_headers, PartHeaders};
pub use parser::{
    parse_multipart_stream, MultipartParser, ParsedUpload, ParserLimits, StagedFile,
    UploadCallbacks,
};

/// Form field whose value names the storage key of the next file part.
pub const STORAGE_KEY_FIELD: &str = "storageKey";

/// Default MIME type for file parts without a `Content-Type` header.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
