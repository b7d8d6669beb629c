//! One timeout applied to every request sent by a client.

use std::time::Duration;

/// A layer which fails requests that take longer than the configured timeout
/// with [`hyperdriver::client::Error::RequestTimeout`].
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    /// Create a new timeout layer with the given timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S> tower::Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            service: inner,
            timeout: self.timeout,
        }
    }
}

/// A [tower::Service] produced by [`TimeoutLayer`].
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    service: S,
    timeout: Duration,
}

impl<S, R> tower::Service<R> for TimeoutService<S>
where
    S: tower::Service<R, Error = hyperdriver::client::Error>,
{
    type Response = S::Response;
    type Error = hyperdriver::client::Error;
    type Future = self::future::TimeoutFuture<S::Future, S::Response>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        self::future::TimeoutFuture::new(self.service.call(req), self.timeout)
    }
}

mod future {
    use std::future::{Future, IntoFuture};
    use std::marker::PhantomData;
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};
    use std::time::Duration;

    use pin_project::pin_project;
    use tokio::time::Timeout;

    #[pin_project]
    #[derive(Debug)]
    pub struct TimeoutFuture<F, R> {
        #[pin]
        future: Timeout<F>,
        response: PhantomData<fn() -> R>,
    }

    impl<F, R> TimeoutFuture<F, R> {
        pub(super) fn new<I>(future: I, timeout: Duration) -> Self
        where
            I: IntoFuture<IntoFuture = F>,
        {
            Self {
                future: tokio::time::timeout(timeout, future),
                response: PhantomData,
            }
        }
    }

    impl<F, R> Future for TimeoutFuture<F, R>
    where
        F: Future<Output = Result<R, hyperdriver::client::Error>>,
    {
        type Output = Result<R, hyperdriver::client::Error>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            Poll::Ready(match ready!(self.project().future.poll(cx)) {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(error)) => Err(error),
                Err(_) => {
                    tracing::debug!("request timed out");
                    Err(hyperdriver::client::Error::RequestTimeout)
                }
            })
        }
    }
}
