//! Error types for API Clients

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error occured while sending or recieving an HTTP request
#[derive(Debug, Error)]
pub enum Error {
    /// An error occured while sending the request, including timeouts.
    #[error(transparent)]
    Request(#[from] hyperdriver::client::Error),

    /// An error occured while recieving the response body
    #[error("Error reading response body: {0}")]
    ResponseBody(#[source] BoxError),
}

impl Error {
    /// Did the request time out before a response arrived?
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Request(hyperdriver::client::Error::RequestTimeout)
        )
    }
}
