use std::fmt;
use std::io;

use api_client::Response;
use http::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

use crate::large_file::UploadStatus;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error deserialized from a response from the B2 API.
#[derive(Debug, Clone, Error, Deserialize)]
#[serde(try_from = "RawErrorInfo")]
#[error("{status}: {message} ({code})")]
pub struct B2Error {
    status: StatusCode,
    code: B2ErrorCode,
    message: String,
}

impl B2Error {
    pub(crate) fn new(status: StatusCode, code: impl Into<B2ErrorCode>, message: impl Into<String>) -> Self {
        B2Error {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// The HTTP status code of the response.
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// The error code returned by the B2 API.
    pub fn kind(&self) -> &B2ErrorCode {
        &self.code
    }

    /// The error message returned by the B2 API.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The account authorization token was rejected as expired or invalid.
    pub fn is_auth_expired(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
            && matches!(
                self.code,
                B2ErrorCode::ExpiredAuthToken | B2ErrorCode::BadAuthToken
            )
    }

    /// The request may succeed if it is sent again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        ) || self.status.is_server_error()
            || matches!(
                self.code,
                B2ErrorCode::ServiceUnavailable
                    | B2ErrorCode::TooManyRequests
                    | B2ErrorCode::RequestTimeout
            )
    }

    /// The server rejected an upload because the body did not match its SHA1.
    pub fn is_checksum_mismatch(&self) -> bool {
        self.status == StatusCode::BAD_REQUEST && self.message.to_lowercase().contains("sha1")
    }

    /// The server rejected the name of a file.
    pub fn is_invalid_file_name(&self) -> bool {
        if matches!(&self.code, B2ErrorCode::Other(code) if code == "invalid_file_name") {
            return true;
        }

        let message = self.message.to_lowercase();
        self.status == StatusCode::BAD_REQUEST
            && (message.contains("file name") || message.contains("filename"))
    }
}

/// An error code returned by the B2 API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum B2ErrorCode {
    /// The authorization token has expired, and should be refreshed.
    ExpiredAuthToken,

    /// The authorization token is not valid.
    BadAuthToken,

    /// The credentials are not valid, or lack a capability.
    Unauthorized,

    /// The request was malformed or invalid.
    BadRequest,

    /// The file or large file does not exist.
    NotFound,

    /// The service is temporarily unable to handle the request.
    ServiceUnavailable,

    /// Too many requests were sent.
    TooManyRequests,

    /// The service timed out reading the request.
    RequestTimeout,

    /// An error code not recognized by this library.
    Other(String),
}

impl fmt::Display for B2ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            B2ErrorCode::ExpiredAuthToken => f.write_str("expired_auth_token"),
            B2ErrorCode::BadAuthToken => f.write_str("bad_auth_token"),
            B2ErrorCode::Unauthorized => f.write_str("unauthorized"),
            B2ErrorCode::BadRequest => f.write_str("bad_request"),
            B2ErrorCode::NotFound => f.write_str("not_found"),
            B2ErrorCode::ServiceUnavailable => f.write_str("service_unavailable"),
            B2ErrorCode::TooManyRequests => f.write_str("too_many_requests"),
            B2ErrorCode::RequestTimeout => f.write_str("request_timeout"),
            B2ErrorCode::Other(message) => f.write_str(message),
        }
    }
}

impl From<String> for B2ErrorCode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "expired_auth_token" => B2ErrorCode::ExpiredAuthToken,
            "bad_auth_token" => B2ErrorCode::BadAuthToken,
            "unauthorized" => B2ErrorCode::Unauthorized,
            "bad_request" => B2ErrorCode::BadRequest,
            "not_found" | "file_not_present" => B2ErrorCode::NotFound,
            "service_unavailable" => B2ErrorCode::ServiceUnavailable,
            "too_many_requests" => B2ErrorCode::TooManyRequests,
            "request_timeout" => B2ErrorCode::RequestTimeout,
            _ => B2ErrorCode::Other(value),
        }
    }
}

impl From<&str> for B2ErrorCode {
    fn from(value: &str) -> Self {
        B2ErrorCode::from(value.to_owned())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawErrorInfo {
    status: u16,
    code: String,
    message: String,
}

impl TryFrom<RawErrorInfo> for B2Error {
    type Error = http::status::InvalidStatusCode;

    fn try_from(value: RawErrorInfo) -> Result<Self, Self::Error> {
        Ok(B2Error {
            status: StatusCode::from_u16(value.status)?,
            code: value.code.into(),
            message: value.message,
        })
    }
}

/// A request was refused before it reached the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// B2 accepts at most 10 custom file info entries.
    #[error("{count} file info entries given, at most {max} are allowed")]
    TooManyFileInfo {
        /// Number of entries given.
        count: usize,
        /// Maximum number of entries.
        max: usize,
    },

    /// A file info name uses characters or a length B2 does not accept.
    #[error("invalid file info name {0:?}")]
    FileInfoName(String),

    /// The file name is empty.
    #[error("file name is empty")]
    EmptyFileName,

    /// A large file needs at least one byte of content.
    #[error("large file has no content")]
    EmptyFile,

    /// The minimum part size must be positive.
    #[error("minimum part size must be greater than zero")]
    PartSize,

    /// The content would need more parts than B2 allows.
    #[error("{parts} parts needed, at most {max} are allowed")]
    TooManyParts {
        /// Number of parts the content needs.
        parts: u64,
        /// Maximum number of parts.
        max: u64,
    },

    /// The content source does not have the size given when the upload started.
    #[error("content source has {actual} bytes, expected {expected}")]
    SourceSize {
        /// Size given at start.
        expected: u64,
        /// Size of the source.
        actual: u64,
    },

    /// The content source returned fewer bytes than the part needs.
    #[error("part {part_number}: read {actual} bytes, expected {expected}")]
    ShortRead {
        /// The part being read.
        part_number: u32,
        /// Bytes the part needs.
        expected: u64,
        /// Bytes the source returned.
        actual: u64,
    },

    /// Not every byte has been uploaded yet.
    #[error("{sent} of {total} bytes uploaded")]
    IncompleteUpload {
        /// Bytes uploaded.
        sent: u64,
        /// Bytes in the file.
        total: u64,
    },
}

/// An operation was called in a state of the upload which does not allow it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot {operation}: large file upload is {status}")]
pub struct StateError {
    operation: &'static str,
    status: UploadStatus,
}

impl StateError {
    pub(crate) fn new(operation: &'static str, status: UploadStatus) -> Self {
        Self { operation, status }
    }

    /// The state of the upload when the operation was attempted.
    pub fn status(&self) -> UploadStatus {
        self.status
    }
}

/// Broad classes of [`B2RequestError`], for deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The account authorization token expired or was rejected.
    AuthExpired,
    /// The application key was rejected.
    Credentials,
    /// The server rejected a part's checksum.
    PartIntegrity,
    /// The server rejected the file name.
    InvalidFileName,
    /// Network failures, timeouts and temporary server errors.
    Transient,
    /// Rejected locally, no request was sent.
    Validation,
    /// The response was malformed or did not match what was sent.
    Protocol,
    /// The upload is not in a state which allows the operation.
    InvalidState,
    /// The upload was cancelled.
    Cancelled,
    /// Any other rejection from the B2 API.
    Service,
    /// Reading the content failed.
    Io,
}

/// An error that occurred while making a request to the B2 API.
///
/// This can include errors from the B2 API itself, as well as errors from the client
/// or the network. Use [`B2RequestError::kind`] to branch on the class of error.
#[derive(Debug, Error)]
pub enum B2RequestError {
    /// An error returned by the B2 API.
    #[error(transparent)]
    B2(B2Error),

    /// The account authorization token has expired.
    #[error("authorization expired: {0}")]
    AuthExpired(#[source] B2Error),

    /// The application key was not accepted.
    #[error("credentials rejected: {0}")]
    Credentials(#[source] B2Error),

    /// The server did not accept the SHA1 sent with a part.
    #[error("part {part_number} failed its integrity check: {error}")]
    PartIntegrity {
        /// The part which was rejected.
        part_number: u32,
        /// The error returned by B2.
        #[source]
        error: B2Error,
    },

    /// The server did not accept the file name.
    #[error("invalid file name: {0}")]
    InvalidFileName(#[source] B2Error),

    /// The server is temporarily unable to handle the request.
    #[error("unavailable: {0}")]
    Unavailable(#[source] B2Error),

    /// An error occurred while sending a request, including timeouts.
    #[error("client: {0}")]
    Client(#[from] hyperdriver::client::Error),

    /// An error occurred while reading the response body.
    #[error("body: {0}")]
    Body(#[source] BoxError),

    /// An error deserializing a response from the B2 API.
    #[error("deserializing: {0} {1}")]
    Serde(#[source] serde_json::Error, String),

    /// The response did not match the request.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The request was rejected before sending.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The upload does not allow this operation in its current state.
    #[error(transparent)]
    InvalidState(#[from] StateError),

    /// The upload was cancelled.
    #[error("upload cancelled")]
    Cancelled,

    /// An io error occurred while reading content.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The request could not be built.
    #[error("request: {0}")]
    Request(#[from] http::Error),

    /// The request encountered too many errors during retries.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the last attempt.
        source: Box<B2RequestError>,
    },
}

impl From<B2Error> for B2RequestError {
    fn from(error: B2Error) -> Self {
        if error.is_auth_expired() {
            B2RequestError::AuthExpired(error)
        } else if error.is_transient() {
            B2RequestError::Unavailable(error)
        } else {
            B2RequestError::B2(error)
        }
    }
}

impl From<api_client::Error> for B2RequestError {
    fn from(error: api_client::Error) -> Self {
        match error {
            api_client::Error::Request(error) => B2RequestError::Client(error),
            api_client::Error::ResponseBody(error) => B2RequestError::Body(error),
        }
    }
}

impl B2RequestError {
    /// The class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            B2RequestError::B2(_) => ErrorKind::Service,
            B2RequestError::AuthExpired(_) => ErrorKind::AuthExpired,
            B2RequestError::Credentials(_) => ErrorKind::Credentials,
            B2RequestError::PartIntegrity { .. } => ErrorKind::PartIntegrity,
            B2RequestError::InvalidFileName(_) => ErrorKind::InvalidFileName,
            B2RequestError::Unavailable(_)
            | B2RequestError::Client(_)
            | B2RequestError::Body(_) => ErrorKind::Transient,
            B2RequestError::Serde(_, _)
            | B2RequestError::Protocol(_)
            | B2RequestError::Request(_) => ErrorKind::Protocol,
            B2RequestError::Validation(_) => ErrorKind::Validation,
            B2RequestError::InvalidState(_) => ErrorKind::InvalidState,
            B2RequestError::Cancelled => ErrorKind::Cancelled,
            B2RequestError::Io(_) => ErrorKind::Io,
            B2RequestError::RetriesExhausted { source, .. } => source.kind(),
        }
    }

    /// Is this a network failure, timeout or temporary server error?
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Was the authorization token rejected?
    pub fn is_auth_expired(&self) -> bool {
        self.kind() == ErrorKind::AuthExpired
    }

    /// Get a reference to the B2 error, if there is one.
    pub fn b2(&self) -> Option<&B2Error> {
        match self {
            B2RequestError::B2(error)
            | B2RequestError::AuthExpired(error)
            | B2RequestError::Credentials(error)
            | B2RequestError::PartIntegrity { error, .. }
            | B2RequestError::InvalidFileName(error)
            | B2RequestError::Unavailable(error) => Some(error),
            B2RequestError::RetriesExhausted { source, .. } => source.b2(),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
pub(crate) trait B2ResponseExt {
    async fn deserialize<D: DeserializeOwned>(self) -> Result<D, B2RequestError>;
    async fn handle_errors(self) -> Result<Self, B2RequestError>
    where
        Self: Sized;
}

#[async_trait::async_trait]
impl B2ResponseExt for Response {
    async fn handle_errors(self) -> Result<Self, B2RequestError> {
        if self.status().is_success() {
            return Ok(self);
        }

        let status = self.status();
        let url = self.uri().clone();
        let text = self.text().await?;

        // Proxies and load balancers may answer without a B2 error body.
        let err = match serde_json::from_str::<B2Error>(&text) {
            Ok(err) => B2Error { status, ..err },
            Err(_) => B2Error::new(
                status,
                status.canonical_reason().unwrap_or("unknown").to_lowercase(),
                text,
            ),
        };

        tracing::debug!(%url, %status, code=%err.kind(), "B2 error response");
        b2_response_breadcrumb(&err, &url);
        Err(err.into())
    }

    async fn deserialize<D: DeserializeOwned>(self) -> Result<D, B2RequestError> {
        let resp = self.handle_errors().await?;

        let text = resp.text().await?;

        let resp =
            serde_json::from_str(&text).map_err(|err| B2RequestError::Serde(err, text.clone()))?;
        Ok(resp)
    }
}

fn b2_response_breadcrumb(error: &B2Error, url: &http::Uri) {
    use sentry::protocol::{Breadcrumb, Map};

    let breadcrumb = Breadcrumb {
        ty: "http".into(),
        category: Some("request".into()),
        data: {
            let mut map = Map::new();

            map.insert("url".into(), url.to_string().into());
            map.insert("status_code".into(), error.status_code().to_string().into());
            map.insert("code".into(), error.kind().to_string().into());
            map.insert("message".into(), error.message().to_string().into());
            map.insert("service".into(), "b2".into());
            map
        },
        ..Default::default()
    };

    sentry::add_breadcrumb(breadcrumb);
}
