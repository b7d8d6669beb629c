use std::env::VarError;
use std::time::Duration;

use api_client::Backoff;
use http::Uri;
use serde::Deserialize;

use crate::application::B2ApplicationKey;
use crate::{
    B2_AUTHORIZATION_URL, B2_DEFAULT_CONCURRENCY, B2_DEFAULT_CONNECT_TIMEOUT,
    B2_DEFAULT_MINIMUM_PART_SIZE, B2_DEFAULT_TIMEOUT, B2_UPLOAD_RETRIES,
};

/// Configuration for a [`crate::B2Session`].
///
/// Timeouts are given in seconds when deserialized.
#[derive(Debug, Clone, Deserialize)]
pub struct B2Config {
    /// The application key used to authorize the account.
    pub key: B2ApplicationKey,

    /// Where `b2_authorize_account` is sent.
    #[serde(
        default = "default_authorization_url",
        with = "api_client::uri::serde"
    )]
    pub authorization_url: Uri,

    /// Timeout for each request.
    #[serde(default = "default_timeout", with = "seconds")]
    pub timeout: Duration,

    /// Timeout for establishing a connection.
    #[serde(default = "default_connect_timeout", with = "seconds")]
    pub connect_timeout: Duration,

    /// Large file upload settings.
    #[serde(default)]
    pub upload: UploadSettings,
}

fn default_authorization_url() -> Uri {
    Uri::from_static(B2_AUTHORIZATION_URL)
}

fn default_timeout() -> Duration {
    B2_DEFAULT_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    B2_DEFAULT_CONNECT_TIMEOUT
}

impl B2Config {
    /// Default configuration for an application key.
    pub fn new(key: B2ApplicationKey) -> Self {
        Self {
            key,
            authorization_url: default_authorization_url(),
            timeout: B2_DEFAULT_TIMEOUT,
            connect_timeout: B2_DEFAULT_CONNECT_TIMEOUT,
            upload: UploadSettings::default(),
        }
    }

    /// Default configuration, with the application key read from the environment.
    pub fn from_env() -> Result<Self, VarError> {
        Ok(Self::new(B2ApplicationKey::from_env()?))
    }
}

/// Settings for large file uploads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Size of every part except the last, in bytes.
    pub minimum_part_size: u64,

    /// Number of parts uploaded at once. `1` uploads parts in order.
    pub concurrency: usize,

    /// Times a part is retried on a fresh upload URL after a checksum
    /// rejection, a transient failure, or an expired upload token. At least
    /// one retry is always made.
    pub part_retries: u32,

    /// Attempts for start, list, finish and cancel calls which fail transiently.
    pub retries: u32,

    /// Delay between retries.
    pub backoff: Backoff,
}

impl Default for UploadSettings {
    fn default() -> Self {
        UploadSettings {
            minimum_part_size: B2_DEFAULT_MINIMUM_PART_SIZE,
            concurrency: B2_DEFAULT_CONCURRENCY,
            part_retries: B2_UPLOAD_RETRIES,
            retries: B2_UPLOAD_RETRIES,
            backoff: Backoff::default(),
        }
    }
}

impl UploadSettings {
    /// Use a different part size.
    pub fn with_minimum_part_size(mut self, minimum_part_size: u64) -> Self {
        self.minimum_part_size = minimum_part_size;
        self
    }

    /// Upload this many parts at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Retry each part this many times.
    pub fn with_part_retries(mut self, part_retries: u32) -> Self {
        self.part_retries = part_retries;
        self
    }

    /// Use a different backoff between retries.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub(crate) fn part_attempts(&self) -> u32 {
        self.part_retries.max(1) + 1
    }

    pub(crate) fn call_attempts(&self) -> u32 {
        self.retries.max(1)
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}
