//! A client for the authorization and large file APIs of Backblaze B2.
//!
//! A [`B2Session`] holds the account authorization and refreshes it when B2
//! rejects the token. A [`LargeFileUploader`] drives the multipart upload of
//! one large file through a session.

mod application;
mod bucket;
mod config;
mod errors;
mod file;
mod large_file;
mod part;
mod session;
mod source;

#[cfg(test)]
mod testing;

/// Version prefix of every API path.
const B2_API_VERSION: &str = "b2api/v1";

/// Where accounts are authorized.
const B2_AUTHORIZATION_URL: &str = "https://api.backblazeb2.com";

/// Default size of every part of a large file except the last.
pub const B2_DEFAULT_MINIMUM_PART_SIZE: u64 = 100_000_000;

/// Number of file parts to simultaneously upload.
const B2_DEFAULT_CONCURRENCY: usize = 1;

/// Number of upload retries
const B2_UPLOAD_RETRIES: u32 = 5;

/// A large file has at most this many parts.
const B2_MAX_PARTS: u64 = 10_000;

/// A file has at most this many custom file info entries.
const B2_MAX_FILE_INFO: usize = 10;

/// Parts requested per page when listing parts.
const B2_LIST_PARTS_PAGE: u32 = 1000;

/// Default timeout for regular requests
const B2_DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Default connect timeout
const B2_DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub use crate::application::{B2ApplicationKey, B2Authorization};
pub use crate::bucket::BucketID;
pub use crate::config::{B2Config, UploadSettings};
pub use crate::errors::{
    B2Error, B2ErrorCode, B2RequestError, ErrorKind, StateError, ValidationError,
};
pub use crate::file::{Action, BzMime, FileID, FileInfo, FileInfoMap, InvalidMime};
pub use crate::large_file::{LargeFileUploader, StartLargeFile, UploadSession, UploadStatus};
pub use crate::part::{plan_parts, InvalidSha1, PartRange, PartResult, Sha1};
pub use crate::session::B2Session;
pub use crate::source::{FileSource, PartSource};
pub use api_client::{Backoff, Secret};
