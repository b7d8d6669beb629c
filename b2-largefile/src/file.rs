use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use api_client::Secret;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::bucket::BucketID;
use crate::errors::ValidationError;
use crate::B2_MAX_FILE_INFO;

pub use self::mime::{BzMime, Invalid as InvalidMime};

/// Custom `X-Bz-Info-*` metadata stored with a file.
pub type FileInfoMap = BTreeMap<String, String>;

const B2_MAX_FILE_INFO_NAME: usize = 50;

/// The identifier B2 assigns to a file version, or to an unfinished large file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub struct FileID(Arc<str>);

impl FileID {
    /// The file id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for FileID {
    fn from(value: String) -> Self {
        FileID(value.into())
    }
}

impl From<&str> for FileID {
    fn from(value: &str) -> Self {
        FileID(value.into())
    }
}

impl From<FileID> for String {
    fn from(value: FileID) -> Self {
        value.0.deref().to_owned()
    }
}

/// What a file version represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// A large file which has been started but not finished or cancelled.
    Start,
    /// A file which has been uploaded.
    Upload,
    /// A hide marker.
    Hide,
    /// A virtual folder.
    Folder,
}

/// The file record returned by start, finish and get-file-info calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    account_id: Secret,
    action: Action,
    bucket_id: BucketID,
    content_length: u64,
    #[serde(default)]
    content_sha1: Option<String>,
    content_type: BzMime,
    file_id: FileID,
    file_name: Utf8PathBuf,
    #[serde(default)]
    file_info: FileInfoMap,
    upload_timestamp: i64,
}

impl FileInfo {
    /// The name of the file.
    pub fn path(&self) -> &Utf8Path {
        &self.file_name
    }

    /// The id of this file version.
    pub fn id(&self) -> &FileID {
        &self.file_id
    }

    /// The bucket holding the file.
    pub fn bucket_id(&self) -> &BucketID {
        &self.bucket_id
    }

    /// The account owning the file.
    pub fn account_id(&self) -> &Secret {
        &self.account_id
    }

    /// Whether the file is started, uploaded, hidden, or a folder.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Size of the file in bytes. Zero for a large file which is not finished.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// SHA1 of the whole file. Large files report `none` unless the
    /// `large_file_sha1` file info was set at start.
    pub fn content_sha1(&self) -> Option<&str> {
        self.content_sha1.as_deref()
    }

    /// The content type of the file.
    pub fn content_type(&self) -> &BzMime {
        &self.content_type
    }

    /// Custom metadata stored with the file.
    pub fn file_info(&self) -> &FileInfoMap {
        &self.file_info
    }

    /// Raw upload timestamp, in milliseconds since the epoch.
    pub fn upload_timestamp(&self) -> i64 {
        self.upload_timestamp
    }

    /// The upload time, when the timestamp is representable.
    pub fn uploaded_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.upload_timestamp).single()
    }
}

/// Check custom file info against the limits B2 places on it.
pub(crate) fn validate_file_info(info: &FileInfoMap) -> Result<(), ValidationError> {
    if info.len() > B2_MAX_FILE_INFO {
        return Err(ValidationError::TooManyFileInfo {
            count: info.len(),
            max: B2_MAX_FILE_INFO,
        });
    }

    for name in info.keys() {
        let valid = !name.is_empty()
            && name.len() <= B2_MAX_FILE_INFO_NAME
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ValidationError::FileInfoName(name.clone()));
        }
    }

    Ok(())
}

mod mime {

    use std::fmt;
    use std::str::FromStr;

    use serde::{de, ser};
    use thiserror::Error;

    /// A content type string which is not a MIME type.
    #[derive(Debug, Clone, Error)]
    #[error("Invalid MIME type: {0}")]
    pub struct Invalid(String);

    /// The content type of a file, including the special values B2 understands.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub enum BzMime {
        /// Let B2 pick the content type from the file name.
        #[default]
        Auto,
        /// The content type of a hide marker.
        Hide,
        /// A parsed MIME type.
        Mime(mime::Mime),
        /// A content type B2 accepted which does not parse as a MIME type.
        Custom(String),
    }

    impl fmt::Display for BzMime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                BzMime::Auto => write!(f, "b2/x-auto"),
                BzMime::Hide => write!(f, "application/x-bz-hide-marker"),
                BzMime::Mime(mime) => write!(f, "{}", mime),
                BzMime::Custom(s) => write!(f, "{}", s),
            }
        }
    }

    impl From<mime::Mime> for BzMime {
        fn from(value: mime::Mime) -> Self {
            BzMime::Mime(value)
        }
    }

    impl FromStr for BzMime {
        type Err = Invalid;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "application/x-bz-hide-marker" => return Ok(BzMime::Hide),
                "b2/x-auto" => return Ok(BzMime::Auto),
                _ => {}
            }

            if let Ok(mime) = mime::Mime::from_str(s) {
                return Ok(BzMime::Mime(mime));
            }

            if s.contains('/') {
                return Ok(BzMime::Custom(s.into()));
            }

            Err(Invalid(s.into()))
        }
    }

    impl ser::Serialize for BzMime {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            serializer.collect_str(self)
        }
    }

    impl<'de> de::Deserialize<'de> for BzMime {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            struct Visitor;

            impl de::Visitor<'_> for Visitor {
                type Value = BzMime;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("a content type")
                }

                fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    BzMime::from_str(v).map_err(de::Error::custom)
                }
            }

            deserializer.deserialize_str(Visitor)
        }
    }
}
