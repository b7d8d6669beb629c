use std::sync::Arc;
use std::{fmt, ops::Deref};

use serde::{Deserialize, Serialize};

/// The identifier B2 assigns to a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BucketID(Arc<str>);

impl BucketID {
    /// Wrap a bucket id.
    pub fn new<S>(id: S) -> Self
    where
        S: Into<String>,
    {
        BucketID(Arc::from(id.into()))
    }

    /// The bucket id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BucketID {
    fn from(value: String) -> Self {
        BucketID(value.into())
    }
}

impl From<&str> for BucketID {
    fn from(value: &str) -> Self {
        BucketID(value.into())
    }
}

impl From<BucketID> for String {
    fn from(value: BucketID) -> Self {
        value.0.deref().to_owned()
    }
}

impl fmt::Display for BucketID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<BucketID> for BucketID {
    fn as_ref(&self) -> &BucketID {
        self
    }
}
