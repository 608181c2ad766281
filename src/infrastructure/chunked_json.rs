// Chunked snapshot streaming - length-prefixed JSON frames, one per published snapshot
use crate::domain::snapshot::Snapshot;
use crate::infrastructure::http_response::brotli_compress;
use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Stream the current snapshot and every later one as a chunked response.
///
/// Each frame is a 4-byte big-endian length followed by the JSON payload,
/// Brotli-compressed per frame when `compress` is set. No `Content-Encoding`
/// header is sent because the HTTP body itself is not compressed.
pub fn snapshot_stream(
    snapshots: watch::Receiver<Arc<Snapshot>>,
    compress: bool,
) -> Result<Response<Body>, StatusCode> {
    let frames = async_stream::stream! {
        let mut updates = WatchStream::new(snapshots);
        while let Some(snapshot) = updates.next().await {
            match encode_frame(&snapshot, compress).await {
                Ok(frame) => yield Ok::<Bytes, std::io::Error>(frame),
                Err(e) => tracing::warn!(
                    sequence = snapshot.sequence,
                    error = %e,
                    "Skipping snapshot frame"
                ),
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson-framed")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(frames))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn encode_frame(snapshot: &Snapshot, compress: bool) -> std::io::Result<Bytes> {
    let json = serde_json::to_vec(snapshot)?;
    let payload = if compress {
        brotli_compress(&json).await?
    } else {
        json
    };

    let length = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(length);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use chrono::{TimeZone, Utc};

    fn decode(mut frame: Bytes) -> Snapshot {
        let length = frame.get_u32() as usize;
        assert_eq!(frame.len(), length);
        serde_json::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_frame_is_length_prefixed() {
        let snapshot = Snapshot::empty(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        let frame = encode_frame(&snapshot, false).await.unwrap();
        assert_eq!(decode(frame), snapshot);
    }

    #[tokio::test]
    async fn test_stream_emits_current_then_updates() {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let (tx, rx) = watch::channel(Arc::new(Snapshot::empty(start)));
        let response = snapshot_stream(rx, false).unwrap();
        let mut frames = response.into_body().into_data_stream();

        let first = decode(frames.next().await.unwrap().unwrap());
        assert_eq!(first.sequence, 0);

        let mut next = Snapshot::empty(start + chrono::Duration::seconds(1));
        next.sequence = 1;
        tx.send_replace(Arc::new(next));
        let second = decode(frames.next().await.unwrap().unwrap());
        assert_eq!(second.sequence, 1);
    }
}
