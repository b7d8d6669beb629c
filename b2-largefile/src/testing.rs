//! An in-memory B2 API for exercising sessions and uploads.
//!
//! The fake checks account and part tokens, part checksums and finish
//! arrays the way B2 does, and can be told to misbehave.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use api_client::mock::{MockReply, MockRequest, MockResponse, MockService};
use api_client::Backoff;
use http::{StatusCode, Uri};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::application::B2ApplicationKey;
use crate::config::{B2Config, UploadSettings};
use crate::part::Sha1;
use crate::session::B2Session;

pub(crate) const AUTHORIZE: &str = "/b2api/v1/b2_authorize_account";
pub(crate) const START: &str = "/b2api/v1/b2_start_large_file";
pub(crate) const GET_UPLOAD_PART_URL: &str = "/b2api/v1/b2_get_upload_part_url";
pub(crate) const UPLOAD_PART: &str = "/b2api/v1/b2_upload_part";
pub(crate) const LIST_PARTS: &str = "/b2api/v1/b2_list_parts";
pub(crate) const FINISH: &str = "/b2api/v1/b2_finish_large_file";
pub(crate) const CANCEL: &str = "/b2api/v1/b2_cancel_large_file";
pub(crate) const GET_FILE_INFO: &str = "/b2api/v1/b2_get_file_info";

pub(crate) const BUCKET: &str = "bucket-0001";

const API_URL: &str = "https://api001.backblazeb2.test";
const UPLOAD_URL: &str = "https://pod-000-1000-00.backblazeb2.test/b2api/v1/b2_upload_part";
const TIMESTAMP: i64 = 1_700_000_000_000;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Upload settings with small parts and no backoff.
pub(crate) fn settings(minimum_part_size: u64) -> UploadSettings {
    UploadSettings::default()
        .with_minimum_part_size(minimum_part_size)
        .with_backoff(Backoff::none())
}

#[derive(Debug)]
struct LargeFile {
    bucket_id: String,
    file_name: String,
    content_type: String,
    file_info: Value,
    action: &'static str,
    parts: BTreeMap<u32, (String, u64)>,
}

impl LargeFile {
    fn to_json(&self, file_id: &str) -> Value {
        let content_length: u64 = match self.action {
            "upload" => self.parts.values().map(|(_, length)| *length).sum(),
            _ => 0,
        };

        json!({
            "accountId": "account-0001",
            "action": self.action,
            "bucketId": self.bucket_id,
            "contentLength": content_length,
            "contentSha1": "none",
            "contentType": self.content_type,
            "fileId": file_id,
            "fileInfo": self.file_info,
            "fileName": self.file_name,
            "uploadTimestamp": TIMESTAMP,
        })
    }
}

#[derive(Debug, Default)]
struct FakeState {
    authorizations: u32,
    tokens: HashSet<String>,
    part_tokens: HashMap<String, String>,
    issued_part_tokens: u32,
    files: HashMap<String, LargeFile>,
    started: u32,

    reject_authorize: u32,
    expire_always: bool,
    corrupt_parts: u32,
    forget_part: Option<u32>,
    finish_then_timeout: bool,
    list_page_size: Option<u64>,
    delay_part: Option<(u32, Duration)>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeB2 {
    mock: MockService,
    state: Arc<Mutex<FakeState>>,
}

fn reply(status: u16, value: Value) -> MockReply {
    let status = StatusCode::from_u16(status).unwrap();
    MockResponse::json(status, &value).into()
}

fn error(status: u16, code: &str, message: &str) -> MockReply {
    reply(
        status,
        json!({"status": status, "code": code, "message": message}),
    )
}

fn expired() -> MockReply {
    error(401, "expired_auth_token", "Authorization token has expired")
}

impl FakeB2 {
    pub(crate) fn new() -> Self {
        init_tracing();

        let fake = FakeB2 {
            mock: MockService::new(),
            state: Default::default(),
        };

        fake.handle(AUTHORIZE, FakeState::authorize);
        fake.handle(START, FakeState::start);
        fake.handle(GET_UPLOAD_PART_URL, FakeState::get_upload_part_url);
        fake.handle(UPLOAD_PART, FakeState::upload_part);
        fake.handle(LIST_PARTS, FakeState::list_parts);
        fake.handle(FINISH, FakeState::finish);
        fake.handle(CANCEL, FakeState::cancel);
        fake.handle(GET_FILE_INFO, FakeState::get_file_info);
        fake
    }

    fn handle(&self, path: &str, handler: fn(&mut FakeState, &MockRequest) -> MockReply) {
        let state = self.state.clone();
        self.mock.route(path, move |req| handler(&mut state.lock(), req));
    }

    pub(crate) fn config() -> B2Config {
        let mut config = B2Config::new(B2ApplicationKey::test());
        config.authorization_url = "https://api.backblazeb2.test".parse().unwrap();
        config
    }

    pub(crate) fn session(&self) -> B2Session {
        B2Session::with_service(&Self::config(), self.mock.clone())
    }

    pub(crate) fn api_url(&self) -> Uri {
        API_URL.parse().unwrap()
    }

    /// Number of requests sent to an endpoint.
    pub(crate) fn count(&self, path: &str) -> usize {
        self.mock.count(path)
    }

    pub(crate) fn requests_to(&self, path: &str) -> Vec<MockRequest> {
        self.mock.requests_to(path)
    }

    /// Total requests of any kind.
    pub(crate) fn total_requests(&self) -> usize {
        self.mock.requests().len()
    }

    /// Answer the next request to `path` with `reply`, bypassing the fake.
    pub(crate) fn push(&self, path: &str, reply: impl Into<MockReply>) {
        self.mock.push(path, reply);
    }

    pub(crate) fn reject_next_authorize(&self) {
        self.state.lock().reject_authorize += 1;
    }

    /// Expire every account token issued so far.
    pub(crate) fn expire_tokens(&self) {
        self.state.lock().tokens.clear();
    }

    /// Reject every account token, including new ones.
    pub(crate) fn always_expire_tokens(&self) {
        self.state.lock().expire_always = true;
    }

    /// Expire every part upload token issued so far.
    pub(crate) fn expire_part_tokens(&self) {
        self.state.lock().part_tokens.clear();
    }

    /// Report a checksum mismatch for the next `count` part uploads.
    pub(crate) fn corrupt_next_parts(&self, count: u32) {
        self.state.lock().corrupt_parts += count;
    }

    /// Accept a part but never record it.
    pub(crate) fn forget_part(&self, part_number: u32) {
        self.state.lock().forget_part = Some(part_number);
    }

    /// Commit the next finish, then fail as if the response timed out.
    pub(crate) fn finish_then_timeout(&self) {
        self.state.lock().finish_then_timeout = true;
    }

    /// Hold back the response to the first upload of a part.
    pub(crate) fn delay_part(&self, part_number: u32, delay: Duration) {
        self.state.lock().delay_part = Some((part_number, delay));
    }

    pub(crate) fn list_page_size(&self, size: u64) {
        self.state.lock().list_page_size = Some(size);
    }

    /// The server-side action of a file: `start`, `upload` or `cancelled`.
    pub(crate) fn action(&self, file_id: &str) -> Option<&'static str> {
        self.state.lock().files.get(file_id).map(|file| file.action)
    }

    /// Part numbers and SHA1s the server holds for a file.
    pub(crate) fn parts(&self, file_id: &str) -> Vec<(u32, String)> {
        self.state
            .lock()
            .files
            .get(file_id)
            .map(|file| {
                file.parts
                    .iter()
                    .map(|(number, (sha1, _))| (*number, sha1.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl FakeState {
    fn check_token(&self, req: &MockRequest) -> Option<MockReply> {
        let valid = req
            .header("authorization")
            .is_some_and(|token| self.tokens.contains(token));

        if self.expire_always || !valid {
            Some(expired())
        } else {
            None
        }
    }

    fn body(req: &MockRequest) -> Result<Value, MockReply> {
        req.json::<Value>()
            .map_err(|_| error(400, "bad_request", "body is not JSON"))
    }

    fn file_id(body: &Value) -> String {
        body["fileId"].as_str().unwrap_or_default().to_owned()
    }

    fn authorize(&mut self, req: &MockRequest) -> MockReply {
        let key = B2ApplicationKey::test();
        let expected = api_client::basic_auth(key.key_id().revealed(), Some(key.key().revealed()));
        if req.header("authorization") != expected.to_str().ok() {
            return error(401, "bad_auth_token", "Invalid authorization header");
        }

        if self.reject_authorize > 0 {
            self.reject_authorize -= 1;
            return error(401, "unauthorized", "The application key is not valid");
        }

        self.authorizations += 1;
        let token = format!("account-token-{}", self.authorizations);
        self.tokens.insert(token.clone());

        reply(
            200,
            json!({
                "accountId": "account-0001",
                "authorizationToken": token,
                "apiUrl": API_URL,
                "downloadUrl": "https://f001.backblazeb2.test",
                "recommendedPartSize": 100_000_000,
                "absoluteMinimumPartSize": 5_000_000,
            }),
        )
    }

    fn start(&mut self, req: &MockRequest) -> MockReply {
        if let Some(reply) = self.check_token(req) {
            return reply;
        }
        let body = match Self::body(req) {
            Ok(body) => body,
            Err(reply) => return reply,
        };

        if body["bucketId"] != BUCKET {
            return error(400, "bad_request", "Invalid bucketId");
        }

        let file_name = body["fileName"].as_str().unwrap_or_default();
        if file_name.is_empty() || file_name.contains('\u{7f}') {
            return error(400, "bad_request", "Invalid file name");
        }

        self.started += 1;
        let file_id = format!("4_zfile{:04}", self.started);
        let file = LargeFile {
            bucket_id: BUCKET.into(),
            file_name: file_name.into(),
            content_type: body["contentType"].as_str().unwrap_or("b2/x-auto").into(),
            file_info: body.get("fileInfo").cloned().unwrap_or_else(|| json!({})),
            action: "start",
            parts: BTreeMap::new(),
        };
        let response = file.to_json(&file_id);
        self.files.insert(file_id, file);

        reply(200, response)
    }

    fn get_upload_part_url(&mut self, req: &MockRequest) -> MockReply {
        if let Some(reply) = self.check_token(req) {
            return reply;
        }
        let body = match Self::body(req) {
            Ok(body) => body,
            Err(reply) => return reply,
        };

        let file_id = Self::file_id(&body);
        if !self
            .files
            .get(&file_id)
            .is_some_and(|file| file.action == "start")
        {
            return error(400, "bad_request", "No active upload for fileId");
        }

        self.issued_part_tokens += 1;
        let token = format!("part-token-{}", self.issued_part_tokens);
        self.part_tokens.insert(token.clone(), file_id.clone());

        reply(
            200,
            json!({
                "fileId": file_id,
                "uploadUrl": UPLOAD_URL,
                "authorizationToken": token,
            }),
        )
    }

    fn upload_part(&mut self, req: &MockRequest) -> MockReply {
        let Some(file_id) = req
            .header("authorization")
            .and_then(|token| self.part_tokens.get(token))
            .cloned()
        else {
            return expired();
        };

        let part_number: u32 = match req.header("x-bz-part-number").map(str::parse::<u32>) {
            Some(Ok(number)) if (1..=10_000).contains(&number) => number,
            _ => return error(400, "bad_request", "Invalid X-Bz-Part-Number"),
        };

        let length = req.body.len() as u64;
        if req.header("content-length").and_then(|v| v.parse::<u64>().ok()) != Some(length) {
            return error(400, "bad_request", "Content-Length does not match body");
        }

        let sha1 = Sha1::digest(&req.body).to_hex();
        if self.corrupt_parts > 0 {
            self.corrupt_parts -= 1;
            return error(400, "bad_request", "Sha1 did not match data received");
        }
        if req.header("x-bz-content-sha1") != Some(sha1.as_str()) {
            return error(400, "bad_request", "Sha1 did not match data received");
        }

        let Some(file) = self.files.get_mut(&file_id) else {
            return error(400, "bad_request", "No active upload for fileId");
        };
        if self.forget_part != Some(part_number) {
            file.parts.insert(part_number, (sha1.clone(), length));
        }

        let response = MockResponse::json(
            StatusCode::OK,
            &json!({
                "fileId": file_id,
                "partNumber": part_number,
                "contentLength": length,
                "contentSha1": sha1,
                "uploadTimestamp": TIMESTAMP,
            }),
        );

        match self.delay_part {
            Some((number, delay)) if number == part_number => {
                self.delay_part = None;
                MockReply::Delayed(delay, response)
            }
            _ => response.into(),
        }
    }

    fn list_parts(&mut self, req: &MockRequest) -> MockReply {
        if let Some(reply) = self.check_token(req) {
            return reply;
        }
        let body = match Self::body(req) {
            Ok(body) => body,
            Err(reply) => return reply,
        };

        let file_id = Self::file_id(&body);
        let Some(file) = self.files.get(&file_id) else {
            return error(400, "bad_request", "No active upload for fileId");
        };

        let start = body["startPartNumber"].as_u64().unwrap_or(1);
        let mut page = body["maxPartCount"].as_u64().unwrap_or(100);
        if let Some(size) = self.list_page_size {
            page = page.min(size);
        }

        let mut remaining = file
            .parts
            .range(u32::try_from(start).unwrap_or(u32::MAX)..)
            .peekable();
        let mut parts = Vec::new();
        while parts.len() < page as usize {
            let Some((number, (sha1, length))) = remaining.next() else {
                break;
            };
            parts.push(json!({
                "fileId": file_id,
                "partNumber": number,
                "contentLength": length,
                "contentSha1": sha1,
                "uploadTimestamp": TIMESTAMP,
            }));
        }
        let next = remaining.peek().map(|(number, _)| **number);

        reply(200, json!({"parts": parts, "nextPartNumber": next}))
    }

    fn finish(&mut self, req: &MockRequest) -> MockReply {
        if let Some(reply) = self.check_token(req) {
            return reply;
        }
        let body = match Self::body(req) {
            Ok(body) => body,
            Err(reply) => return reply,
        };

        let file_id = Self::file_id(&body);
        let Some(file) = self.files.get_mut(&file_id) else {
            return error(400, "bad_request", "No active upload for fileId");
        };
        if file.action != "start" {
            return error(400, "bad_request", "Large file is not in progress");
        }

        let expected: Vec<Value> = file
            .parts
            .values()
            .map(|(sha1, _)| Value::from(sha1.as_str()))
            .collect();
        if body["partSha1Array"] != Value::Array(expected) {
            return error(400, "bad_request", "partSha1Array does not match the uploaded parts");
        }

        file.action = "upload";
        let response = file.to_json(&file_id);

        if std::mem::take(&mut self.finish_then_timeout) {
            return MockReply::Timeout;
        }
        reply(200, response)
    }

    fn cancel(&mut self, req: &MockRequest) -> MockReply {
        if let Some(reply) = self.check_token(req) {
            return reply;
        }
        let body = match Self::body(req) {
            Ok(body) => body,
            Err(reply) => return reply,
        };

        let file_id = Self::file_id(&body);
        match self.files.get_mut(&file_id) {
            Some(file) if file.action == "start" => {
                file.action = "cancelled";
                reply(
                    200,
                    json!({
                        "accountId": "account-0001",
                        "bucketId": file.bucket_id,
                        "fileId": file_id,
                        "fileName": file.file_name,
                    }),
                )
            }
            _ => error(400, "bad_request", "No active upload for fileId"),
        }
    }

    fn get_file_info(&mut self, req: &MockRequest) -> MockReply {
        if let Some(reply) = self.check_token(req) {
            return reply;
        }
        let body = match Self::body(req) {
            Ok(body) => body,
            Err(reply) => return reply,
        };

        let file_id = Self::file_id(&body);
        match self.files.get(&file_id) {
            Some(file) if file.action != "cancelled" => reply(200, file.to_json(&file_id)),
            _ => error(404, "not_found", "File not present"),
        }
    }
}
