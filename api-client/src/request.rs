//! Request helpers.

use http::header::HeaderValue;

use crate::basic_auth;

/// Extension methods for building requests.
pub trait RequestExt {
    /// Set HTTP basic authentication for this request.
    fn basic_auth<U, P>(self, username: U, password: Option<P>) -> Self
    where
        U: std::fmt::Display,
        P: std::fmt::Display;

    /// Set a sensitive `Authorization` header from a raw value.
    fn authorization(self, value: HeaderValue) -> Self;

    /// Copy the method, URI and headers of the request, without the body.
    fn parts(&self) -> http::request::Parts;
}

impl<B> RequestExt for http::Request<B> {
    fn basic_auth<U, P>(mut self, username: U, password: Option<P>) -> Self
    where
        U: std::fmt::Display,
        P: std::fmt::Display,
    {
        self.headers_mut()
            .insert(http::header::AUTHORIZATION, basic_auth(username, password));
        self
    }

    fn authorization(mut self, mut value: HeaderValue) -> Self {
        value.set_sensitive(true);
        self.headers_mut()
            .insert(http::header::AUTHORIZATION, value);
        self
    }

    fn parts(&self) -> http::request::Parts {
        let (mut parts, _) = http::Request::new(()).into_parts();
        parts.method = self.method().clone();
        parts.uri = self.uri().clone();
        parts.version = self.version();
        parts.headers = self.headers().clone();
        parts
    }
}

impl RequestExt for http::request::Builder {
    fn basic_auth<U, P>(self, username: U, password: Option<P>) -> Self
    where
        U: std::fmt::Display,
        P: std::fmt::Display,
    {
        self.header(http::header::AUTHORIZATION, basic_auth(username, password))
    }

    fn authorization(self, mut value: HeaderValue) -> Self {
        value.set_sensitive(true);
        self.header(http::header::AUTHORIZATION, value)
    }

    fn parts(&self) -> http::request::Parts {
        let (mut parts, _) = http::Request::new(()).into_parts();
        if let Some(method) = self.method_ref() {
            parts.method = method.clone();
        }
        if let Some(uri) = self.uri_ref() {
            parts.uri = uri.clone();
        }
        if let Some(headers) = self.headers_ref() {
            parts.headers = headers.clone();
        }
        parts
    }
}
