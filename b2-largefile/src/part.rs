//! Splitting content into parts, and the record of each uploaded part.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de, ser};
use sha1::Digest as _;
use tracing::Instrument as _;

use crate::errors::{B2RequestError, ValidationError};
use crate::B2_MAX_PARTS;

/// The byte range covered by one part of a large file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// The 1-based part number.
    pub part_number: u32,

    /// Offset of the first byte of the part in the content.
    pub offset: u64,

    /// Number of bytes in the part.
    pub length: u64,
}

impl PartRange {
    /// Offset one past the last byte of the part.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Number of parts needed for `total_size` bytes.
///
/// Fails when the part size is zero, or when the content needs more parts
/// than B2 allows in one large file.
pub(crate) fn part_count(
    total_size: u64,
    minimum_part_size: u64,
) -> Result<u32, ValidationError> {
    if minimum_part_size == 0 {
        return Err(ValidationError::PartSize);
    }

    let parts = total_size.div_ceil(minimum_part_size);
    match u32::try_from(parts) {
        Ok(count) if parts <= B2_MAX_PARTS => Ok(count),
        _ => Err(ValidationError::TooManyParts {
            parts,
            max: B2_MAX_PARTS,
        }),
    }
}

/// Split `total_size` bytes into parts of `minimum_part_size` bytes.
///
/// Parts are numbered from 1 and cover the content contiguously. Only the last
/// part may be smaller than `minimum_part_size`. Content smaller than one part
/// becomes a single part, and empty content has no parts.
pub fn plan_parts(
    total_size: u64,
    minimum_part_size: u64,
) -> Result<Vec<PartRange>, ValidationError> {
    let count = part_count(total_size, minimum_part_size)?;

    let parts = (1..=count)
        .scan(0u64, |offset, part_number| {
            let length = minimum_part_size.min(total_size - *offset);
            let range = PartRange {
                part_number,
                offset: *offset,
                length,
            };
            *offset += length;
            Some(range)
        })
        .collect();

    Ok(parts)
}

/// A SHA1 digest, written as 40 lowercase hex characters on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1([u8; 20]);

impl Sha1 {
    /// Digest a buffer.
    pub fn digest(data: &[u8]) -> Self {
        let mut digest = sha1::Sha1::new();
        digest.update(data);
        Sha1(digest.finalize().into())
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The digest as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Digest a part on the blocking thread pool.
pub(crate) async fn digest_part(data: Bytes) -> Result<Sha1, B2RequestError> {
    let digest = tokio::task::spawn_blocking(move || Sha1::digest(&data))
        .in_current_span()
        .await
        .map_err(std::io::Error::other)?;
    Ok(digest)
}

impl fmt::Display for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1({})", self.to_hex())
    }
}

/// A string which is not a hex SHA1 digest.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid sha1 digest: {0:?}")]
pub struct InvalidSha1(String);

impl FromStr for Sha1 {
    type Err = InvalidSha1;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digest = [0u8; 20];
        hex::decode_to_slice(s, &mut digest).map_err(|_| InvalidSha1(s.to_owned()))?;
        Ok(Sha1(digest))
    }
}

impl ser::Serialize for Sha1 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> de::Deserialize<'de> for Sha1 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = Sha1;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a sha1 hex digest")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Sha1::from_str(v).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

/// A part which B2 has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    /// The 1-based part number.
    pub part_number: u32,

    /// The SHA1 of the part content.
    pub sha1: Sha1,

    /// Number of bytes in the part.
    pub content_length: u64,

    /// When B2 recorded the part.
    pub upload_timestamp: DateTime<Utc>,
}

/// Combine parts uploaded out of order with parts already recorded.
///
/// The result is ordered by part number, and must number the parts
/// `1..=n` without gaps or duplicates.
pub(crate) fn merge_parts(
    mut existing: Vec<PartResult>,
    uploaded: Vec<PartResult>,
) -> Result<Vec<PartResult>, B2RequestError> {
    existing.extend(uploaded);
    existing.sort_by_key(|part| part.part_number);

    for (expected, part) in (1..).zip(existing.iter()) {
        if part.part_number != expected {
            return Err(B2RequestError::Protocol(format!(
                "expected part {expected}, found part {}",
                part.part_number
            )));
        }
    }

    Ok(existing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(part_number: u32) -> PartResult {
        PartResult {
            part_number,
            sha1: Sha1::digest(&part_number.to_be_bytes()),
            content_length: 10,
            upload_timestamp: Utc::now(),
        }
    }

    #[test]
    fn plan_exact_multiple() {
        let parts = plan_parts(250_000_000, 100_000_000).unwrap();
        assert_eq!(
            parts,
            vec![
                PartRange {
                    part_number: 1,
                    offset: 0,
                    length: 100_000_000
                },
                PartRange {
                    part_number: 2,
                    offset: 100_000_000,
                    length: 100_000_000
                },
                PartRange {
                    part_number: 3,
                    offset: 200_000_000,
                    length: 50_000_000
                },
            ]
        );

        let parts = plan_parts(200, 100).unwrap();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.length == 100));
    }

    #[test]
    fn plan_covers_content() {
        for (total, min) in [(1, 1), (1, 100), (99, 10), (1000, 7), (12345, 1000)] {
            let parts = plan_parts(total, min).unwrap();
            assert_eq!(parts.iter().map(|p| p.length).sum::<u64>(), total);
            assert_eq!(parts.last().map(|p| p.end()), Some(total));

            for (index, pair) in parts.windows(2).enumerate() {
                assert_eq!(pair[0].end(), pair[1].offset);
                assert_eq!(pair[0].part_number as usize, index + 1);
                assert!(pair[0].length >= min);
            }
        }
    }

    #[test]
    fn plan_small_and_empty() {
        let parts = plan_parts(10, 100).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].length, 10);

        assert!(plan_parts(0, 100).unwrap().is_empty());
        assert!(matches!(plan_parts(100, 0), Err(ValidationError::PartSize)));
    }

    #[test]
    fn plan_respects_part_limit() {
        let parts = plan_parts(10_000 * 100, 100).unwrap();
        assert_eq!(parts.len(), 10_000);
        assert_eq!(parts.last().map(|p| p.part_number), Some(10_000));
        assert_eq!(parts.last().map(|p| p.end()), Some(1_000_000));

        assert!(matches!(
            plan_parts(10_000 * 100 + 1, 100),
            Err(ValidationError::TooManyParts {
                parts: 10_001,
                max: 10_000
            })
        ));
        assert!(matches!(
            plan_parts(u64::MAX, 1),
            Err(ValidationError::TooManyParts {
                parts: u64::MAX,
                ..
            })
        ));
        assert!(matches!(
            plan_parts(u64::MAX, u64::MAX),
            Ok(parts) if parts.len() == 1 && parts[0].length == u64::MAX
        ));
    }

    #[test]
    fn sha1_hex_on_the_wire() {
        let sha = Sha1::digest(b"hello world");
        assert_eq!(sha.to_hex(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert_eq!(
            serde_json::to_string(&[sha]).unwrap(),
            r#"["2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"]"#
        );

        let parsed: Sha1 =
            serde_json::from_str(r#""2aae6c35c94fcfb415dbe95f408b9ce91ee846ed""#).unwrap();
        assert_eq!(parsed, sha);
        assert!(serde_json::from_str::<Sha1>(r#""none""#).is_err());
    }

    #[test]
    fn merge_orders_parts() {
        let merged = merge_parts(vec![part(1)], vec![part(4), part(2), part(3)]).unwrap();
        let numbers: Vec<_> = merged.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn merge_rejects_gaps_and_duplicates() {
        assert!(merge_parts(vec![], vec![part(1), part(3)]).is_err());
        assert!(merge_parts(vec![part(1)], vec![part(1), part(2)]).is_err());
    }

    #[tokio::test]
    async fn digest_on_blocking_pool() {
        let sha = digest_part(Bytes::from_static(b"hello world")).await.unwrap();
        assert_eq!(sha, Sha1::digest(b"hello world"));
    }
}
