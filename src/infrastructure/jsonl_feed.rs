// JSON-lines feed - tails an append-only file of raw production records
use crate::application::observation_feed::ObservationFeed;
use crate::domain::observation::RawRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::Mutex;

/// Reads complete lines past a remembered byte offset. A trailing line
/// without a newline is left for the next call.
///
/// The offset only moves once a batch is fully read, so a caller that drops
/// `next_batch` midway (a timeout) gets the same lines again next time.
#[derive(Debug)]
pub struct JsonLinesFeed {
    path: PathBuf,
    max_batch: usize,
    offset: Mutex<u64>,
}

impl JsonLinesFeed {
    pub fn new(path: impl Into<PathBuf>, max_batch: usize) -> Self {
        Self {
            path: path.into(),
            max_batch,
            offset: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ObservationFeed for JsonLinesFeed {
    async fn next_batch(&self) -> Result<Vec<RawRecord>> {
        let mut offset = self.offset.lock().await;

        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open feed {}", self.path.display()))
            }
        };

        let len = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat feed {}", self.path.display()))?
            .len();
        let mut next = *offset;
        if len < next {
            tracing::warn!(
                path = %self.path.display(),
                offset = next,
                len,
                "Feed file shrank; reading from the start"
            );
            next = 0;
        }
        file.seek(SeekFrom::Start(next))
            .await
            .context("Failed to seek feed file")?;

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut line = Vec::new();
        while records.len() < self.max_batch {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .context("Failed to read feed file")?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            next += read as u64;

            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                records.push(RawRecord::from_json_line(text));
            }
        }

        *offset = next;
        tracing::debug!(count = records.len(), offset = next, "Read feed batch");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LINE_A: &str = r#"{"timestamp":"2023-01-01T08:00:00Z","defect_count":4,"lot_size":400,"cycle_time":45.0,"downtime":30,"planned_time":480}"#;
    const LINE_B: &str = r#"{"Date":"2023-01-02","Defects_Total":6,"Production_Volume":380,"Average_Cycle_Time":46.5,"Downtime_Total":42,"Planned_Time":480}"#;

    fn append(path: &std::path::Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let feed = JsonLinesFeed::new(dir.path().join("absent.jsonl"), 10);
        assert!(feed.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let (head, tail) = LINE_B.split_at(20);
        append(&path, &format!("{LINE_A}\n\n{head}"));

        let feed = JsonLinesFeed::new(&path, 10);
        let first = feed.next_batch().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].lot_size, Some(400.0));

        assert!(feed.next_batch().await.unwrap().is_empty());

        append(&path, &format!("{tail}\n"));
        let second = feed.next_batch().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].timestamp.as_deref(), Some("2023-01-02"));
        assert_eq!(second[0].defect_count, Some(6.0));
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        append(&path, &format!("{LINE_A}\n").repeat(5));

        let feed = JsonLinesFeed::new(&path, 2);
        let sizes = [
            feed.next_batch().await.unwrap().len(),
            feed.next_batch().await.unwrap().len(),
            feed.next_batch().await.unwrap().len(),
            feed.next_batch().await.unwrap().len(),
        ];
        assert_eq!(sizes, [2, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_cancelled_reads_lose_no_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        let total = 20_000;
        append(&path, &format!("{LINE_A}\n").repeat(total));

        let feed = JsonLinesFeed::new(&path, 500);
        let mut delivered = 0;
        for wait in 0..200u64 {
            let budget = std::time::Duration::from_micros(wait * 25);
            if let Ok(batch) = tokio::time::timeout(budget, feed.next_batch()).await {
                delivered += batch.unwrap().len();
            }
        }
        loop {
            let batch = feed.next_batch().await.unwrap();
            if batch.is_empty() {
                break;
            }
            delivered += batch.len();
        }
        assert_eq!(delivered, total);
    }

    #[tokio::test]
    async fn test_garbage_line_becomes_unparseable_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        append(&path, "not json\n");

        let feed = JsonLinesFeed::new(&path, 10);
        let batch = feed.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].parse_error.is_some());
    }

    #[tokio::test]
    async fn test_truncated_file_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        append(&path, &format!("{LINE_A}\n{LINE_A}\n"));

        let feed = JsonLinesFeed::new(&path, 10);
        assert_eq!(feed.next_batch().await.unwrap().len(), 2);

        std::fs::write(&path, format!("{LINE_B}\n")).unwrap();
        let batch = feed.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].lot_size, Some(380.0));
    }
}
