//! Authentication for API clients.
//!
//! The `Authentication` trait decorates outgoing requests with credentials.
//! `ApiClient` keeps its authentication in an [`ArcSwapOption`], so it can be
//! replaced (or removed) while requests are in flight, and the
//! [`AuthenticationLayer`] applies whichever value is current when a request
//! is sent.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use http::HeaderValue;
use tower::layer::Layer;

/// Create a basic authentication header value, with the password being optional.
///
/// Basic authentication Base64 encodes the username and password, separated by a colon.
///
/// # Example
/// ```rust
/// use api_client::basic_auth;
/// let header = basic_auth("username", Some("password"));
/// assert_eq!(header.to_str().unwrap(), "Basic dXNlcm5hbWU6cGFzc3dvcmQ=");
/// ```
pub fn basic_auth<U, P>(username: U, password: Option<P>) -> HeaderValue
where
    U: std::fmt::Display,
    P: std::fmt::Display,
{
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:", username);
        if let Some(password) = password {
            let _ = write!(encoder, "{}", password);
        }
    }
    let mut header = HeaderValue::from_bytes(&buf).expect("base64 is always valid HeaderValue");
    header.set_sensitive(true);
    header
}

/// Something which can attach credentials to a request.
pub trait Authentication {
    /// Called for every request which does not already carry an
    /// `Authorization` header.
    fn authenticate<B>(&self, req: http::Request<B>) -> http::Request<B>;
}

/// A layer which applies the current value of a swappable authentication.
#[derive(Debug)]
pub struct AuthenticationLayer<A> {
    auth: Arc<ArcSwapOption<A>>,
}

impl<A> Clone for AuthenticationLayer<A> {
    fn clone(&self) -> Self {
        Self {
            auth: self.auth.clone(),
        }
    }
}

impl<A> AuthenticationLayer<A> {
    pub(crate) fn new(auth: Arc<ArcSwapOption<A>>) -> Self {
        Self { auth }
    }
}

impl<A, S> Layer<S> for AuthenticationLayer<A> {
    type Service = AuthenticationService<A, S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthenticationService {
            inner,
            auth: self.auth.clone(),
        }
    }
}

/// Service produced by [`AuthenticationLayer`].
#[derive(Debug)]
pub struct AuthenticationService<A, S> {
    inner: S,
    auth: Arc<ArcSwapOption<A>>,
}

impl<A, S: Clone> Clone for AuthenticationService<A, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            auth: self.auth.clone(),
        }
    }
}

impl<A, S, BIn, BOut> tower::Service<http::Request<BIn>> for AuthenticationService<A, S>
where
    A: Authentication,
    S: tower::Service<http::Request<BIn>, Response = http::Response<BOut>>,
{
    type Response = http::Response<BOut>;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<BIn>) -> Self::Future {
        if req.headers().contains_key(http::header::AUTHORIZATION) {
            return self.inner.call(req);
        }

        let current = self.auth.load();
        let req = match &*current {
            Some(auth) => auth.authenticate(req),
            None => {
                tracing::trace!("no authentication available for {}", req.uri());
                req
            }
        };
        self.inner.call(req)
    }
}
