//! Multipart upload of one large file.
//!
//! A large file is started, uploaded as numbered parts of at least the
//! minimum part size (only the last may be shorter), and then either finished
//! with the SHA1 of every part in order or cancelled. Parts are sent to an
//! upload URL with its own token, which is fetched separately from the
//! account authorization.

use std::fmt;
use std::future::Future;

use api_client::{RequestExt as _, Secret};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{TimeZone as _, Utc};
use futures::{StreamExt as _, TryStreamExt as _};
use http::{Method, Uri};
use hyperdriver::Body;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bucket::BucketID;
use crate::config::UploadSettings;
use crate::errors::{
    B2RequestError, B2ResponseExt as _, ErrorKind, StateError, ValidationError,
};
use crate::file::{validate_file_info, Action, BzMime, FileID, FileInfo, FileInfoMap};
use crate::part::{
    digest_part, merge_parts, part_count, plan_parts, PartRange, PartResult, Sha1,
};
use crate::session::B2Session;
use crate::source::PartSource;
use crate::B2_LIST_PARTS_PAGE;

/// What to start: the file's bucket, name, content type and custom info.
#[derive(Debug, Clone)]
pub struct StartLargeFile {
    bucket_id: BucketID,
    file_name: Utf8PathBuf,
    content_type: BzMime,
    file_info: FileInfoMap,
}

impl StartLargeFile {
    /// Start a file in a bucket, letting B2 pick the content type.
    pub fn new(bucket_id: impl Into<BucketID>, file_name: impl Into<Utf8PathBuf>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            file_name: file_name.into(),
            content_type: BzMime::Auto,
            file_info: FileInfoMap::new(),
        }
    }

    /// Set the content type.
    pub fn with_content_type(mut self, content_type: impl Into<BzMime>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Add a custom file info entry.
    pub fn with_file_info(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.file_info.insert(name.into(), value.into());
        self
    }

    /// The bucket the file is uploaded to.
    pub fn bucket_id(&self) -> &BucketID {
        &self.bucket_id
    }

    /// The name of the file.
    pub fn file_name(&self) -> &Utf8Path {
        &self.file_name
    }

    /// The content type of the file.
    pub fn content_type(&self) -> &BzMime {
        &self.content_type
    }

    /// Custom file info.
    pub fn file_info(&self) -> &FileInfoMap {
        &self.file_info
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.file_name.as_str().is_empty() {
            return Err(ValidationError::EmptyFileName);
        }
        validate_file_info(&self.file_info)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileBody<'r> {
    bucket_id: &'r BucketID,
    file_name: &'r Utf8Path,
    content_type: &'r BzMime,
    file_info: &'r FileInfoMap,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileIdBody<'f> {
    file_id: &'f FileID,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadPartUrl {
    file_id: FileID,
    #[serde(with = "api_client::uri::serde")]
    upload_url: Uri,
    authorization_token: Secret,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadPartResponse {
    file_id: FileID,
    part_number: u32,
    content_length: u64,
    content_sha1: Sha1,
    #[serde(default)]
    upload_timestamp: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListPartsBody<'f> {
    file_id: &'f FileID,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_part_number: Option<u32>,
    max_part_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPartsResponse {
    parts: Vec<ListedPart>,
    next_part_number: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedPart {
    part_number: u32,
    content_sha1: Sha1,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileBody<'s> {
    file_id: &'s FileID,
    part_sha1_array: &'s [Sha1],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelLargeFileResponse {
    file_id: FileID,
    file_name: Utf8PathBuf,
}

/// Retry an API call which fails transiently, with backoff between attempts.
async fn retry_transient<T, F, Fut>(
    settings: &UploadSettings,
    operation: &str,
    mut op: F,
) -> Result<T, B2RequestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, B2RequestError>>,
{
    let attempts = settings.call_attempts();
    let mut attempt = 1;

    loop {
        match op().await {
            Err(error) if error.is_transient() && attempt < attempts => {
                tracing::warn!(%attempt, "{operation} failed, retrying: {error}");
                settings.backoff.wait(attempt).await;
                attempt += 1;
            }
            Err(error) if error.is_transient() && attempt > 1 => {
                return Err(B2RequestError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                })
            }
            result => return result,
        }
    }
}

/// Uploads parts of one large file.
///
/// Each worker holds its own upload URL, so several may run at once.
#[derive(Debug, Clone)]
struct PartUploader {
    session: B2Session,
    settings: UploadSettings,
    file_id: FileID,
}

impl PartUploader {
    #[tracing::instrument(skip_all, fields(file = %self.file_id))]
    async fn upload_part_url(&self) -> Result<UploadPartUrl, B2RequestError> {
        tracing::trace!("requesting part uploader");
        let body = FileIdBody {
            file_id: &self.file_id,
        };
        let body = &body;

        let url: UploadPartUrl = retry_transient(&self.settings, "get upload part url", || {
            self.session.api_call("b2_get_upload_part_url", body)
        })
        .await?;

        if url.file_id != self.file_id {
            return Err(B2RequestError::Protocol(format!(
                "requested an upload URL for {}, B2 returned one for {}",
                self.file_id, url.file_id
            )));
        }
        Ok(url)
    }

    async fn send(
        &self,
        url: &UploadPartUrl,
        range: &PartRange,
        data: Bytes,
        sha1: &Sha1,
    ) -> Result<UploadPartResponse, B2RequestError> {
        tracing::trace!("sending upload_part post request");

        let request = http::Request::builder()
            .method(Method::POST)
            .version(http::Version::HTTP_11)
            .uri(url.upload_url.clone())
            .authorization(
                url.authorization_token
                    .to_header()
                    .map_err(http::Error::from)?,
            )
            .header(http::header::CONTENT_LENGTH, range.length)
            .header("X-Bz-Part-Number", range.part_number)
            .header("X-Bz-Content-Sha1", sha1.to_hex())
            .body(Body::from(data))?;

        let response = self.session.client.execute(request).await?;
        response.deserialize().await.map_err(|error| match error {
            B2RequestError::B2(error) if error.is_checksum_mismatch() => {
                B2RequestError::PartIntegrity {
                    part_number: range.part_number,
                    error,
                }
            }
            error => error,
        })
    }

    fn accept(
        &self,
        range: &PartRange,
        sha1: &Sha1,
        response: UploadPartResponse,
    ) -> Result<PartResult, B2RequestError> {
        if response.file_id != self.file_id
            || response.part_number != range.part_number
            || response.content_sha1 != *sha1
            || response.content_length != range.length
        {
            return Err(B2RequestError::Protocol(format!(
                "sent part {} ({} bytes, sha1 {sha1}), B2 recorded part {} ({} bytes, sha1 {})",
                range.part_number,
                range.length,
                response.part_number,
                response.content_length,
                response.content_sha1,
            )));
        }

        let upload_timestamp = match response.upload_timestamp {
            Some(millis) => Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                B2RequestError::Protocol(format!("invalid upload timestamp {millis}"))
            })?,
            None => Utc::now(),
        };

        Ok(PartResult {
            part_number: range.part_number,
            sha1: *sha1,
            content_length: range.length,
            upload_timestamp,
        })
    }

    /// Read, hash and upload one part.
    ///
    /// The same bytes are re-sent to a fresh upload URL when B2 rejects the
    /// checksum or the part token, or the request fails transiently.
    #[tracing::instrument("part", skip_all, fields(part = range.part_number))]
    async fn upload(
        &self,
        source: &dyn PartSource,
        range: PartRange,
        cached: Option<UploadPartUrl>,
    ) -> Result<(PartResult, UploadPartUrl), B2RequestError> {
        tracing::trace!("Gathering chunk");
        let data = source.read_range(range.offset, range.length).await?;
        if data.len() as u64 != range.length {
            return Err(ValidationError::ShortRead {
                part_number: range.part_number,
                expected: range.length,
                actual: data.len() as u64,
            }
            .into());
        }

        tracing::trace!("digesting");
        let sha1 = digest_part(data.clone()).await?;

        let mut url = match cached {
            Some(url) => url,
            None => self.upload_part_url().await?,
        };

        let attempts = self.settings.part_attempts();
        let mut attempt = 1;
        loop {
            tracing::trace!(%attempt, "uploading part");
            let error = match self.send(&url, &range, data.clone(), &sha1).await {
                Ok(response) => return Ok((self.accept(&range, &sha1, response)?, url)),
                Err(error) => error,
            };

            if !matches!(
                error.kind(),
                ErrorKind::PartIntegrity | ErrorKind::Transient | ErrorKind::AuthExpired
            ) {
                return Err(error);
            }

            if attempt >= attempts {
                return Err(B2RequestError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            tracing::warn!(%attempt, "Part upload failed, retrying with a new upload URL: {error}");
            self.settings.backoff.wait(attempt).await;
            url = self.upload_part_url().await?;
            attempt += 1;
        }
    }
}

/// Where a [`LargeFileUploader`] is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStatus {
    /// `start` has not been called.
    NotStarted,
    /// The large file exists on B2 and parts may be uploaded.
    Started,
    /// The large file was finished.
    Finished,
    /// The large file was cancelled.
    Cancelled,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::NotStarted => f.write_str("not started"),
            UploadStatus::Started => f.write_str("started"),
            UploadStatus::Finished => f.write_str("finished"),
            UploadStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A started large file, and the parts uploaded so far.
#[derive(Debug, Clone)]
pub struct UploadSession {
    file_id: FileID,
    bucket_id: BucketID,
    file_name: Utf8PathBuf,
    content_type: BzMime,
    file_info: FileInfoMap,
    minimum_part_size: u64,
    total_size: u64,
    parts: Vec<PartResult>,
    part_url: Option<UploadPartUrl>,
}

impl UploadSession {
    /// The id B2 assigned to the large file.
    pub fn file_id(&self) -> &FileID {
        &self.file_id
    }

    /// The bucket the file is uploaded to.
    pub fn bucket_id(&self) -> &BucketID {
        &self.bucket_id
    }

    /// The name of the file.
    pub fn file_name(&self) -> &Utf8Path {
        &self.file_name
    }

    /// The content type of the file.
    pub fn content_type(&self) -> &BzMime {
        &self.content_type
    }

    /// Custom file info.
    pub fn file_info(&self) -> &FileInfoMap {
        &self.file_info
    }

    /// Size of every part except the last.
    pub fn minimum_part_size(&self) -> u64 {
        self.minimum_part_size
    }

    /// Size of the whole file.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Parts uploaded so far, in order.
    pub fn parts(&self) -> &[PartResult] {
        &self.parts
    }

    /// Bytes uploaded so far.
    pub fn bytes_sent(&self) -> u64 {
        self.parts.iter().map(|part| part.content_length).sum()
    }

    /// Has every byte been uploaded?
    pub fn is_complete(&self) -> bool {
        self.bytes_sent() == self.total_size
    }

    fn next_range(&self) -> Option<PartRange> {
        let offset = self.bytes_sent();
        if offset >= self.total_size {
            return None;
        }

        Some(PartRange {
            part_number: self.parts.len() as u32 + 1,
            offset,
            length: self.minimum_part_size.min(self.total_size - offset),
        })
    }

    fn remaining(&self) -> Result<Vec<PartRange>, ValidationError> {
        Ok(plan_parts(self.total_size, self.minimum_part_size)?
            .into_iter()
            .skip(self.parts.len())
            .collect())
    }

    fn check_source(&self, source: &dyn PartSource) -> Result<(), ValidationError> {
        if source.size() != self.total_size {
            return Err(ValidationError::SourceSize {
                expected: self.total_size,
                actual: source.size(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
enum UploadState {
    NotStarted,
    Started(UploadSession),
    Finished(FileInfo),
    Cancelled,
}

/// Drives the multipart upload of one large file.
///
/// Operations which the current [`UploadStatus`] does not allow fail with
/// [`ErrorKind::InvalidState`] without sending any request.
#[derive(Debug)]
pub struct LargeFileUploader {
    session: B2Session,
    settings: UploadSettings,
    state: UploadState,
    cancellation: CancellationToken,
}

impl LargeFileUploader {
    /// Create an uploader which has not started a file yet.
    pub fn new(session: B2Session, settings: UploadSettings) -> Self {
        Self {
            session,
            settings,
            state: UploadState::NotStarted,
            cancellation: CancellationToken::new(),
        }
    }

    /// Where the upload is in the protocol.
    pub fn status(&self) -> UploadStatus {
        match self.state {
            UploadState::NotStarted => UploadStatus::NotStarted,
            UploadState::Started(_) => UploadStatus::Started,
            UploadState::Finished(_) => UploadStatus::Finished,
            UploadState::Cancelled => UploadStatus::Cancelled,
        }
    }

    /// The started large file, while it is in progress.
    pub fn upload_session(&self) -> Option<&UploadSession> {
        match &self.state {
            UploadState::Started(session) => Some(session),
            _ => None,
        }
    }

    /// The finished file.
    pub fn file_info(&self) -> Option<&FileInfo> {
        match &self.state {
            UploadState::Finished(info) => Some(info),
            _ => None,
        }
    }

    /// The settings used for this upload.
    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// A token which aborts the upload when cancelled.
    ///
    /// The part in flight is dropped, the large file is cancelled on B2, and
    /// the running operation returns [`ErrorKind::Cancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    fn started(&self, operation: &'static str) -> Result<&UploadSession, StateError> {
        match &self.state {
            UploadState::Started(session) => Ok(session),
            _ => Err(StateError::new(operation, self.status())),
        }
    }

    fn started_mut(&mut self, operation: &'static str) -> Result<&mut UploadSession, StateError> {
        let status = self.status();
        match &mut self.state {
            UploadState::Started(session) => Ok(session),
            _ => Err(StateError::new(operation, status)),
        }
    }

    fn part_uploader(&self, file_id: FileID) -> PartUploader {
        PartUploader {
            session: self.session.clone(),
            settings: self.settings.clone(),
            file_id,
        }
    }

    async fn abort(&mut self) -> B2RequestError {
        tracing::warn!("Upload cancelled, releasing large file");
        if let Err(error) = self.cancel().await {
            tracing::error!("Failed to cancel large file: {error}");
        }
        B2RequestError::Cancelled
    }

    /// Start a large file of `total_size` bytes.
    ///
    /// The request is checked before anything is sent: the name must not be
    /// empty, there may be at most 10 file info entries, and the content must
    /// fit in B2's part limit at the configured part size.
    #[tracing::instrument(skip_all, fields(bucket = %request.bucket_id, file_name = %request.file_name))]
    pub async fn start(
        &mut self,
        request: StartLargeFile,
        total_size: u64,
    ) -> Result<&UploadSession, B2RequestError> {
        if !matches!(self.state, UploadState::NotStarted) {
            return Err(StateError::new("start", self.status()).into());
        }

        request.validate()?;

        let minimum_part_size = self.settings.minimum_part_size;
        let parts = part_count(total_size, minimum_part_size)?;
        if total_size == 0 {
            return Err(ValidationError::EmptyFile.into());
        }

        let body = StartLargeFileBody {
            bucket_id: &request.bucket_id,
            file_name: &request.file_name,
            content_type: &request.content_type,
            file_info: &request.file_info,
        };
        let body = &body;
        let session = &self.session;

        let info: FileInfo = retry_transient(&self.settings, "start large file", || {
            session.api_call("b2_start_large_file", body)
        })
        .await
        .map_err(|error| match error {
            B2RequestError::B2(error) if error.is_invalid_file_name() => {
                B2RequestError::InvalidFileName(error)
            }
            error => error,
        })?;

        if info.action() != Action::Start {
            return Err(B2RequestError::Protocol(format!(
                "started large file {} has action {:?}",
                info.id(),
                info.action()
            )));
        }

        tracing::info!(file = %info.id(), parts, "Started large file");

        self.state = UploadState::Started(UploadSession {
            file_id: info.id().clone(),
            bucket_id: request.bucket_id,
            file_name: request.file_name,
            content_type: request.content_type,
            file_info: request.file_info,
            minimum_part_size,
            total_size,
            parts: Vec::new(),
            part_url: None,
        });

        Ok(self.started("start")?)
    }

    /// Upload the next part from `source`.
    ///
    /// Returns `None` once every byte has been uploaded.
    #[tracing::instrument(skip_all)]
    pub async fn upload_next_part(
        &mut self,
        source: &dyn PartSource,
    ) -> Result<Option<PartResult>, B2RequestError> {
        let (file_id, range, cached) = {
            let session = self.started_mut("upload a part")?;
            session.check_source(source)?;

            let Some(range) = session.next_range() else {
                return Ok(None);
            };
            (session.file_id.clone(), range, session.part_url.take())
        };

        if self.cancellation.is_cancelled() {
            return Err(self.abort().await);
        }

        let worker = self.part_uploader(file_id);
        let token = self.cancellation.clone();
        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = worker.upload(source, range, cached) => Some(result),
        };

        let Some(result) = outcome else {
            return Err(self.abort().await);
        };
        let (part, url) = result?;

        let session = self.started_mut("upload a part")?;
        session.part_url = Some(url);
        session.parts.push(part.clone());
        tracing::debug!(
            part = part.part_number,
            sent = session.bytes_sent(),
            total = session.total_size,
            "Uploaded part"
        );

        Ok(Some(part))
    }

    /// Upload every remaining part from `source`.
    ///
    /// Parts are sent one at a time, in order, unless the settings allow
    /// more than one at once.
    #[tracing::instrument(skip_all)]
    pub async fn upload_all(&mut self, source: &dyn PartSource) -> Result<(), B2RequestError> {
        let concurrency = self.settings.concurrency.max(1);
        if concurrency == 1 {
            while self.upload_next_part(source).await?.is_some() {}
            return Ok(());
        }

        let (file_id, remaining) = {
            let session = self.started("upload parts")?;
            session.check_source(source)?;
            (session.file_id.clone(), session.remaining()?)
        };

        if remaining.is_empty() {
            return Ok(());
        }

        if self.cancellation.is_cancelled() {
            return Err(self.abort().await);
        }

        tracing::debug!(parts = remaining.len(), concurrency, "Uploading parts");
        let worker = self.part_uploader(file_id);
        let token = self.cancellation.clone();
        let uploads = futures::stream::iter(remaining)
            .map(|range| worker.upload(source, range, None))
            .buffer_unordered(concurrency)
            .try_collect::<Vec<_>>();

        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = uploads => Some(result),
        };

        let Some(result) = outcome else {
            return Err(self.abort().await);
        };
        let uploaded = result?;

        let session = self.started_mut("upload parts")?;
        session.parts = merge_parts(
            session.parts.clone(),
            uploaded.into_iter().map(|(part, _)| part).collect(),
        )?;
        tracing::debug!(parts = session.parts.len(), "Uploaded parts");

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(file = %file_id))]
    async fn list_parts(&self, file_id: &FileID) -> Result<Vec<ListedPart>, B2RequestError> {
        let mut body = ListPartsBody {
            file_id,
            start_part_number: None,
            max_part_count: B2_LIST_PARTS_PAGE,
        };
        let mut parts = Vec::new();

        loop {
            let page: ListPartsResponse = {
                let body = &body;
                retry_transient(&self.settings, "list parts", || {
                    self.session.api_call("b2_list_parts", body)
                })
                .await?
            };

            let start = body.start_part_number.unwrap_or(1);
            let empty = page.parts.is_empty();
            parts.extend(page.parts);

            match page.next_part_number {
                None => break,
                Some(next) if empty || next <= start => {
                    return Err(B2RequestError::Protocol(format!(
                        "listing parts of {file_id} from part {start} did not advance (next part {next})"
                    )));
                }
                Some(next) => body.start_part_number = Some(next),
            };
        }

        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }

    /// Check that B2 holds exactly the parts uploaded here.
    async fn reconcile(&self, file_id: &FileID, parts: &[PartResult]) -> Result<(), B2RequestError> {
        let listed = self.list_parts(file_id).await?;

        if listed.len() != parts.len() {
            return Err(B2RequestError::Protocol(format!(
                "B2 holds {} parts of {file_id}, {} were uploaded",
                listed.len(),
                parts.len()
            )));
        }

        for (local, remote) in parts.iter().zip(&listed) {
            if local.part_number != remote.part_number || local.sha1 != remote.content_sha1 {
                return Err(B2RequestError::Protocol(format!(
                    "part {} of {file_id} has sha1 {}, B2 holds part {} with sha1 {}",
                    local.part_number, local.sha1, remote.part_number, remote.content_sha1
                )));
            }
        }

        Ok(())
    }

    /// A finish request failed transiently. Ask B2 whether it was committed
    /// before sending it again.
    async fn recover_finish(
        &self,
        body: &FinishLargeFileBody<'_>,
        error: B2RequestError,
    ) -> Result<FileInfo, B2RequestError> {
        tracing::warn!(file = %body.file_id, "Finish failed, checking the large file: {error}");

        let query = FileIdBody {
            file_id: body.file_id,
        };
        match self
            .session
            .api_call::<_, FileInfo>("b2_get_file_info", &query)
            .await
        {
            Ok(info) if info.action() == Action::Upload => {
                tracing::debug!("Finish was committed");
                Ok(info)
            }
            Ok(_) => {
                tracing::debug!("Finish was not committed, sending it again");
                self.session.api_call("b2_finish_large_file", body).await
            }
            Err(query_error) => {
                tracing::warn!("Could not check the large file: {query_error}");
                Err(error)
            }
        }
    }

    /// Finish the large file once every part has been uploaded.
    ///
    /// The parts B2 holds are listed first and must match the parts uploaded
    /// here, otherwise nothing is finished.
    #[tracing::instrument(skip_all)]
    pub async fn finish(&mut self) -> Result<FileInfo, B2RequestError> {
        let (file_id, parts) = {
            let session = self.started("finish")?;
            if !session.is_complete() {
                return Err(ValidationError::IncompleteUpload {
                    sent: session.bytes_sent(),
                    total: session.total_size,
                }
                .into());
            }
            (session.file_id.clone(), session.parts.clone())
        };

        if self.cancellation.is_cancelled() {
            return Err(self.abort().await);
        }

        self.reconcile(&file_id, &parts).await?;

        let shas: Vec<Sha1> = parts.iter().map(|part| part.sha1).collect();
        let body = FinishLargeFileBody {
            file_id: &file_id,
            part_sha1_array: &shas,
        };

        let info = match self
            .session
            .api_call::<_, FileInfo>("b2_finish_large_file", &body)
            .await
        {
            Ok(info) => info,
            Err(error) if error.is_transient() => self.recover_finish(&body, error).await?,
            Err(error) => return Err(error),
        };

        if info.action() != Action::Upload {
            return Err(B2RequestError::Protocol(format!(
                "finished large file {} has action {:?}",
                info.id(),
                info.action()
            )));
        }

        tracing::info!(file = %info.id(), parts = shas.len(), "Finished large file");
        self.state = UploadState::Finished(info.clone());
        Ok(info)
    }

    /// Cancel the large file, discarding any uploaded parts.
    ///
    /// Before start this only marks the uploader cancelled. After finish or
    /// cancel it does nothing. If B2 cannot be reached the upload stays
    /// started, so cancel can be called again.
    #[tracing::instrument(skip_all)]
    pub async fn cancel(&mut self) -> Result<(), B2RequestError> {
        match self.status() {
            UploadStatus::NotStarted => {
                tracing::debug!("Cancelled before start");
                self.state = UploadState::Cancelled;
                return Ok(());
            }
            UploadStatus::Finished | UploadStatus::Cancelled => {
                tracing::debug!(status = %self.status(), "Nothing to cancel");
                return Ok(());
            }
            UploadStatus::Started => {}
        }

        let file_id = self.started("cancel")?.file_id.clone();
        let body = FileIdBody { file_id: &file_id };
        let body = &body;
        let session = &self.session;

        let response: CancelLargeFileResponse =
            retry_transient(&self.settings, "cancel large file", || {
                session.api_call("b2_cancel_large_file", body)
            })
            .await?;

        tracing::info!(file = %response.file_id, file_name = %response.file_name, "Cancelled large file");
        self.state = UploadState::Cancelled;
        Ok(())
    }
}
