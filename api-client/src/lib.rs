//! Shared plumbing for HTTP API clients.
//!
//! An [`ApiClient`] pairs a transport (any tower service speaking
//! `hyperdriver` requests and responses) with an authentication value which
//! can be swapped or cleared at any time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use hyperdriver::service::SharedService;
use tower::ServiceExt;

mod authentication;
pub mod error;
pub mod mock;
pub mod request;
pub mod response;
mod retry;
mod secret;
pub mod timeout;
pub mod uri;

pub use self::authentication::{
    basic_auth, Authentication, AuthenticationLayer, AuthenticationService,
};
pub use self::error::Error;
pub use self::request::RequestExt;
pub use self::response::Response;
pub use self::retry::Backoff;
pub use self::secret::Secret;
use self::timeout::TimeoutLayer;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A client for accessing APIs over HTTP / HTTPS
///
/// Useful inner object to wrap for individual API clients. Clones share the
/// transport and the authentication.
#[derive(Debug)]
pub struct ApiClient<A> {
    inner: hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>,
    authentication: Arc<ArcSwapOption<A>>,
    timeout: Duration,
}

impl<A> Clone for ApiClient<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            authentication: self.authentication.clone(),
            timeout: self.timeout,
        }
    }
}

impl<A> ApiClient<A>
where
    A: Authentication + Send + Sync + 'static,
{
    /// Create a client on the default TCP + TLS transport.
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Self {
        let mut builder = hyperdriver::Client::build_tcp_http();
        let tcp = builder.transport();
        tcp.config_mut().connect_timeout = Some(connect_timeout);

        Self::new_with_inner_service(builder.build_service(), timeout)
    }

    /// Create a client over any transport service.
    ///
    /// Every request sent through the client is bounded by `timeout` and
    /// receives the current authentication unless it already carries an
    /// `Authorization` header.
    pub fn new_with_inner_service<S>(inner: S, timeout: Duration) -> Self
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let authentication = Arc::new(ArcSwapOption::new(None));

        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(TimeoutLayer::new(timeout))
            .layer(AuthenticationLayer::new(authentication.clone()))
            .service(inner);

        ApiClient {
            inner: service,
            authentication,
            timeout,
        }
    }
}

impl<A> ApiClient<A> {
    /// Replace the authentication used for subsequent requests.
    pub fn refresh_auth(&self, authentication: Arc<A>) {
        self.authentication.store(Some(authentication));
    }

    /// Remove the authentication, subsequent requests are sent without it.
    pub fn clear_auth(&self) {
        self.authentication.store(None);
    }

    /// The current authentication, if there is one.
    pub fn auth(&self) -> Option<Arc<A>> {
        self.authentication.load_full()
    }

    /// The timeout applied to every request.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a request, returning the response paired with the request parts.
    pub async fn execute(&self, req: http::Request<hyperdriver::Body>) -> Result<Response, Error> {
        let parts = req.parts();

        let response = self.inner.clone().oneshot(req).await?;
        Ok(Response::new(parts, response))
    }
}
