//! Artifact file IO shared by the disk and cloud tiers
//!
//! Artifacts are newline-delimited JSON. Reads go through a streaming line
//! scanner with a per-record ceiling, because a single record (an event info
//! map in particular) can be very large.

use crate::{Error, Result};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::debug;

/// Largest single event-info record accepted (250MB)
pub const MAX_EVENT_INFO_RECORD_BYTES: usize = 250 * 1024 * 1024;

/// Largest single pattern record accepted (10MB)
pub const MAX_PATTERN_RECORD_BYTES: usize = 10 * 1024 * 1024;

/// Largest metadata snapshot record accepted
pub const MAX_METADATA_RECORD_BYTES: usize = 1024 * 1024;

/// Encode records as newline-delimited JSON
pub fn encode_records<T: Serialize>(records: &[T]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    for record in records {
        let line = serde_json::to_vec(record)?;
        buf.reserve(line.len() + 1);
        buf.put_slice(&line);
        buf.put_u8(b'\n');
    }
    Ok(buf.freeze())
}

/// Encode a single record as one JSON line
pub fn encode_record<T: Serialize>(record: &T) -> Result<Bytes> {
    encode_records(std::slice::from_ref(record))
}

/// Stream every record of a newline-delimited JSON object.
///
/// A missing object surfaces as [`Error::NotFound`] so callers can tell a
/// tier miss apart from a failing tier.
pub async fn read_records<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    path: &Path,
    max_record_bytes: usize,
) -> Result<Vec<T>> {
    let result = store.get(path).await?;
    let body = result.into_stream().map_err(std::io::Error::other);
    decode_records(StreamReader::new(body), path, max_record_bytes).await
}

/// Fetch the raw bytes of an object
pub async fn fetch(store: &dyn ObjectStore, path: &Path) -> Result<Bytes> {
    Ok(store.get(path).await?.bytes().await?)
}

/// Decode newline-delimited JSON records from `reader`. `path` only labels
/// errors.
pub async fn decode_records<T, R>(reader: R, path: &Path, max_record_bytes: usize) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_record_bytes));

    let mut records = Vec::new();
    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => Error::RecordTooLarge {
                path: path.to_string(),
                limit: max_record_bytes,
            },
            LinesCodecError::Io(e) => Error::Io(e),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }

    Ok(records)
}

/// The record of a single-record file. When several lines are present the
/// last one wins; a file without any record is rejected as truncated.
pub fn last_record<T>(records: Vec<T>, path: &Path) -> Result<T> {
    records
        .into_iter()
        .last()
        .ok_or_else(|| Error::Serialization(format!("{} holds no record", path)))
}

/// Write `payload` at `path` unless an object already exists there.
///
/// Returns `true` when this call created the object. Artifacts are immutable
/// once published, so an existing object is left untouched.
pub async fn put_if_absent(store: &dyn ObjectStore, path: &Path, payload: Bytes) -> Result<bool> {
    let opts = PutOptions {
        mode: PutMode::Create,
        ..Default::default()
    };

    match store
        .put_opts(path, PutPayload::from(payload.clone()), opts)
        .await
    {
        Ok(_) => Ok(true),
        Err(object_store::Error::AlreadyExists { .. }) => {
            debug!(path = %path, "Artifact already present, keeping existing object");
            Ok(false)
        }
        Err(object_store::Error::NotImplemented)
        | Err(object_store::Error::NotSupported { .. }) => {
            // Backends without conditional create: check, then write.
            match store.head(path).await {
                Ok(_) => Ok(false),
                Err(object_store::Error::NotFound { .. }) => {
                    store.put(path, PutPayload::from(payload)).await?;
                    Ok(true)
                }
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}
