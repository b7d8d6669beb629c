//! A scripted transport for exercising API clients without a network.
//!
//! Replies are looked up by request path. One-shot replies queued with
//! [`MockService::push`] are used first, then the route registered with
//! [`MockService::add`] or [`MockService::route`]. Every request is recorded
//! (including its body) before the reply is produced.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt as _;
use parking_lot::Mutex;

use crate::BoxFuture;

/// A canned HTTP response.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: http::StatusCode,
    headers: http::HeaderMap,
    body: Bytes,
}

impl MockResponse {
    /// Create a response from its parts.
    pub fn new(status: http::StatusCode, headers: http::HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// A response with a JSON body.
    pub fn json(status: http::StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        Self::new(status, headers, value.to_string())
    }

    fn build(&self) -> http::Response<hyperdriver::Body> {
        let mut response = http::Response::new(hyperdriver::Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.version_mut() = http::Version::HTTP_11;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

/// What the mock transport does with one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Respond immediately.
    Respond(MockResponse),

    /// Respond after a delay.
    Delayed(Duration, MockResponse),

    /// Fail as if the request timed out in the transport.
    Timeout,
}

impl From<MockResponse> for MockReply {
    fn from(response: MockResponse) -> Self {
        MockReply::Respond(response)
    }
}

/// A request as seen by the mock transport.
#[derive(Debug, Clone)]
pub struct MockRequest {
    /// The request method.
    pub method: http::Method,

    /// The full request URI.
    pub uri: http::Uri,

    /// The request headers.
    pub headers: http::HeaderMap,

    /// The collected request body.
    pub body: Bytes,
}

impl MockRequest {
    /// The request path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// A header value as a string, if present and valid.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Deserialize the request body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

type Handler = Arc<dyn Fn(&MockRequest) -> MockReply + Send + Sync>;

#[derive(Default)]
struct MockState {
    routes: HashMap<String, Handler>,
    queued: HashMap<String, VecDeque<MockReply>>,
    requests: Vec<MockRequest>,
}

/// A transport which answers requests from a script.
///
/// Clones share the same script and request log.
#[derive(Clone, Default)]
pub struct MockService {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockService")
            .field("routes", &state.routes.keys().collect::<Vec<_>>())
            .field("requests", &state.requests.len())
            .finish()
    }
}

impl MockService {
    /// Create an empty mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `path` with the same response.
    pub fn add(
        &mut self,
        path: &str,
        status: http::StatusCode,
        headers: http::HeaderMap,
        body: Vec<u8>,
    ) {
        let response = MockResponse::new(status, headers, body);
        self.route(path, move |_| MockReply::Respond(response.clone()));
    }

    /// Answer `path` by calling a handler with the recorded request.
    pub fn route<F>(&self, path: &str, handler: F)
    where
        F: Fn(&MockRequest) -> MockReply + Send + Sync + 'static,
    {
        self.state
            .lock()
            .routes
            .insert(path.to_owned(), Arc::new(handler));
    }

    /// Queue a reply for the next request to `path`, ahead of its route.
    pub fn push(&self, path: &str, reply: impl Into<MockReply>) {
        self.state
            .lock()
            .queued
            .entry(path.to_owned())
            .or_default()
            .push_back(reply.into());
    }

    /// All requests received so far, in order.
    pub fn requests(&self) -> Vec<MockRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests received for one path.
    pub fn requests_to(&self, path: &str) -> Vec<MockRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|req| req.path() == path)
            .cloned()
            .collect()
    }

    /// Number of requests received for one path.
    pub fn count(&self, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|req| req.path() == path)
            .count()
    }

    fn reply(&self, request: MockRequest) -> MockReply {
        let path = request.path().to_owned();
        let handler = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());

            if let Some(reply) = state.queued.get_mut(&path).and_then(VecDeque::pop_front) {
                return reply;
            }

            state.routes.get(&path).cloned()
        };

        match handler {
            Some(handler) => handler(&request),
            None => panic!("No response configured for path: {path}"),
        }
    }
}

impl tower::Service<http::Request<hyperdriver::Body>> for MockService {
    type Response = http::Response<hyperdriver::Body>;
    type Error = hyperdriver::client::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();

            let request = MockRequest {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
                body,
            };

            match service.reply(request) {
                MockReply::Respond(response) => Ok(response.build()),
                MockReply::Delayed(delay, response) => {
                    tokio::time::sleep(delay).await;
                    Ok(response.build())
                }
                MockReply::Timeout => Err(hyperdriver::client::Error::RequestTimeout),
            }
        })
    }
}
