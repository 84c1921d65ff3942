//! On-disk layout of one cached image.
//!
//! ```text
//! [u32 BE header length][JSON header][payload bytes]
//! ```
//!
//! Writes go to a uniquely named temporary file in the key directory that is
//! then renamed over [`RECORD_FILE`], so readers see the old or the new
//! record and never a partial one. A sweep may remove the key directory
//! between those steps; the write then recreates it and tries once more.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::error::{FetchError, FetchResult};

/// Name of the record file inside a key directory.
pub const RECORD_FILE: &str = "entry";

const LEN_PREFIX: usize = 4;

const TMP_SUFFIX: &str = ".tmp";

/// Headers larger than this are treated as corruption.
const MAX_HEADER_LEN: usize = 64 * 1024;

/// Cache metadata stored ahead of the image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Freshness lifetime in seconds.
    pub max_age: u64,
    /// Absolute expiry, Unix epoch milliseconds.
    pub expires_at: i64,
    /// Upstream ETag without quotes.
    pub etag: String,
    /// File extension derived from the content type.
    pub extension: String,
}

impl ImageRecord {
    #[must_use]
    pub const fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at
    }

    pub fn encode(&self, payload: &[u8]) -> FetchResult<Vec<u8>> {
        let header = serde_json::to_vec(self)?;
        let len = u32::try_from(header.len())
            .map_err(|_| FetchError::record("header too large"))?;

        let mut out = Vec::with_capacity(LEN_PREFIX + header.len() + payload.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        Ok(out)
    }

    pub fn decode(bytes: Bytes) -> FetchResult<(Self, Bytes)> {
        let header_len = header_len(&bytes)?;
        let end = LEN_PREFIX + header_len;
        if bytes.len() < end {
            return Err(FetchError::record("truncated header"));
        }

        let record: Self = serde_json::from_slice(&bytes[LEN_PREFIX..end])
            .map_err(|e| FetchError::record(e.to_string()))?;
        Ok((record, bytes.slice(end..)))
    }

    /// Read a whole record. A missing file or directory is `None`.
    pub async fn read(path: &Path) -> FetchResult<Option<(Self, Bytes)>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Self::decode(Bytes::from(bytes)).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read only the header, for sweeps.
    pub async fn read_header(path: &Path) -> FetchResult<Option<Self>> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut prefix = [0_u8; LEN_PREFIX];
        file.read_exact(&mut prefix).await.map_err(truncated)?;
        let header_len = header_len(&prefix)?;

        let mut header = vec![0_u8; header_len];
        file.read_exact(&mut header).await.map_err(truncated)?;

        serde_json::from_slice(&header).map(Some).map_err(|e| FetchError::record(e.to_string()))
    }

    /// Atomically replace the record in `dir`.
    pub async fn write(&self, dir: &Path, payload: &[u8]) -> FetchResult<()> {
        let encoded = self.encode(payload)?;

        match write_once(dir, &encoded).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %dir.display(), "Key directory removed mid-write, retrying");
                Ok(write_once(dir, &encoded).await?)
            }
            other => Ok(other?),
        }
    }
}

/// Whether `dir` holds a temp file modified within `grace`.
pub(crate) async fn has_pending_write(dir: &Path, grace: Duration) -> FetchResult<bool> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().ends_with(TMP_SUFFIX) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // renamed into place since the listing
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .unwrap_or_default();
        if age < grace {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn write_once(dir: &Path, encoded: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!("{RECORD_FILE}.{}{TMP_SUFFIX}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, encoded).await?;

    if let Err(e) = tokio::fs::rename(&tmp, dir.join(RECORD_FILE)).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

fn header_len(bytes: &[u8]) -> FetchResult<usize> {
    let prefix: [u8; LEN_PREFIX] = bytes
        .get(..LEN_PREFIX)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| FetchError::record("missing length prefix"))?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_HEADER_LEN {
        return Err(FetchError::record(format!("header length {len} out of range")));
    }
    Ok(len)
}

fn truncated(e: std::io::Error) -> FetchError {
    if e.kind() == ErrorKind::UnexpectedEof {
        FetchError::record("truncated header")
    } else {
        e.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ImageRecord {
        ImageRecord {
            max_age: 86_400,
            expires_at: 1_700_000_000_000,
            etag: "5f1c.2a.v1".to_string(),
            extension: "webp".to_string(),
        }
    }

    #[test]
    fn test_etag_with_dots_survives() {
        let encoded = record().encode(b"RIFF....WEBP").unwrap();
        let (decoded, payload) = ImageRecord::decode(Bytes::from(encoded)).unwrap();
        assert_eq!(decoded, record());
        assert_eq!(&payload[..], b"RIFF....WEBP");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ImageRecord::decode(Bytes::from_static(b"ab")),
            Err(FetchError::Record(_))
        ));
        assert!(matches!(
            ImageRecord::decode(Bytes::from_static(&[0, 0, 0, 9, b'{'])),
            Err(FetchError::Record(_))
        ));
        assert!(matches!(
            ImageRecord::decode(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff])),
            Err(FetchError::Record(_))
        ));
    }

    #[test]
    fn test_expiry_comparison() {
        let r = record();
        assert!(!r.is_expired_at(r.expires_at));
        assert!(r.is_expired_at(r.expires_at + 1));
    }

    #[tokio::test]
    async fn test_write_replaces_and_leaves_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_dir = dir.path().join("key");

        record().write(&key_dir, b"first").await.unwrap();
        let mut second = record();
        second.etag = "v2".to_string();
        second.write(&key_dir, b"second").await.unwrap();

        let (read, payload) = ImageRecord::read(&key_dir.join(RECORD_FILE)).await.unwrap().unwrap();
        assert_eq!(read.etag, "v2");
        assert_eq!(&payload[..], b"second");

        let header = ImageRecord::read_header(&key_dir.join(RECORD_FILE)).await.unwrap().unwrap();
        assert_eq!(header, second);

        let files = std::fs::read_dir(&key_dir).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn test_pending_write_detects_fresh_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let grace = Duration::from_secs(60);
        assert!(!has_pending_write(dir.path(), grace).await.unwrap());
        assert!(!has_pending_write(&dir.path().join("gone"), grace).await.unwrap());

        let tmp = dir.path().join("entry.x.tmp");
        std::fs::write(&tmp, b"partial").unwrap();
        assert!(has_pending_write(dir.path(), grace).await.unwrap());

        let old = std::time::SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options().write(true).open(&tmp).unwrap().set_modified(old).unwrap();
        assert!(!has_pending_write(dir.path(), grace).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope").join(RECORD_FILE);
        assert!(ImageRecord::read(&missing).await.unwrap().is_none());
        assert!(ImageRecord::read_header(&missing).await.unwrap().is_none());
    }
}
