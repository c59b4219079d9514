// A single channel's append-only log and its read cursor.
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use millrace_wire::Document;
use tokio::sync::{Mutex, watch};

use crate::framing::{encode_record_frame, read_record_frame};
use crate::layout::{
    HEADER_SIZE, check_and_get_last_file, coord_of_record, create_and_fill_file, file_name,
    file_path, read_header, skip_record, write_header,
};
use crate::{LogError, Result};

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub logs_dir: PathBuf,
    pub max_log_chunk_size: u64,
    /// fsync after every append; turn off for throughput over durability.
    pub fsync_on_append: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("./millrace-logs"),
            max_log_chunk_size: 4 * 1024 * 1024,
            fsync_on_append: true,
        }
    }
}

/// One record read back from a log.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub number: i64,
    pub file_number: u64,
    pub file_pos: u64,
    pub document: Document,
}

#[derive(Debug)]
struct LogInner {
    head_file: File,
    head_number: u64,
    next_record: i64,
    write_pos: u64,
}

/// An open channel log.
///
/// Appends are serialized on a fair async mutex, so record numbers are
/// assigned in call order. The tail watch carries the next record number to
/// be assigned and wakes cursors waiting for new records.
#[derive(Debug)]
pub struct Log {
    channel: String,
    config: LogConfig,
    inner: Mutex<LogInner>,
    tail: watch::Sender<i64>,
}

impl Log {
    /// Open a channel: validate the file layout, discover the tail, and
    /// resume appending after the last record. An empty channel gets its
    /// first pre-allocated chunk.
    pub async fn open(config: LogConfig, channel: &str) -> Result<Arc<Log>> {
        let channel = channel.to_string();
        let open_config = config.clone();
        let open_channel = channel.clone();
        let inner = tokio::task::spawn_blocking(move || -> Result<LogInner> {
            std::fs::create_dir_all(&open_config.logs_dir)?;
            let head = check_and_get_last_file(
                &open_config.logs_dir,
                &open_channel,
                open_config.max_log_chunk_size,
            )?;
            let path = file_path(&open_config.logs_dir, &open_channel, head);
            if !path.exists() {
                let file = new_chunk(&path, open_config.max_log_chunk_size, 0)?;
                return Ok(LogInner {
                    head_file: file,
                    head_number: 0,
                    next_record: 0,
                    write_pos: HEADER_SIZE,
                });
            }
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let size = file.metadata()?.len();
            let first_record = read_header(&file, &file_name(&open_channel, head))?;
            let mut record = first_record - 1;
            let mut pos = HEADER_SIZE;
            loop {
                let next = skip_record(&file, size, pos)?;
                if next == 0 {
                    break;
                }
                record += 1;
                pos = next;
            }
            Ok(LogInner {
                head_file: file,
                head_number: head,
                next_record: record + 1,
                write_pos: pos,
            })
        })
        .await
        .map_err(|err| LogError::Io(std::io::Error::other(err)))??;

        tracing::debug!(
            channel = %channel,
            head = inner.head_number,
            next_record = inner.next_record,
            "channel log opened"
        );
        let (tail, _) = watch::channel(inner.next_record);
        Ok(Arc::new(Log {
            channel,
            config,
            inner: Mutex::new(inner),
            tail,
        }))
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next record number to be assigned.
    pub fn tail(&self) -> i64 {
        *self.tail.borrow()
    }

    /// Append a record, rolling to a new chunk when the head is full.
    /// Resolves with the assigned record number once the record is on disk.
    pub async fn append(&self, record: &Document) -> Result<i64> {
        let payload = record.to_bytes();
        let framed = encode_record_frame(&payload);
        if HEADER_SIZE + framed.len() as u64 > self.config.max_log_chunk_size {
            return Err(LogError::RecordTooLarge {
                size: framed.len() as u64,
                chunk: self.config.max_log_chunk_size,
            });
        }

        let mut inner = self.inner.lock().await;
        if inner.write_pos + framed.len() as u64 > self.config.max_log_chunk_size {
            self.roll_head(&mut inner).await?;
        }

        let file = inner.head_file.try_clone()?;
        let pos = inner.write_pos;
        let fsync = self.config.fsync_on_append;
        let frame_len = framed.len() as u64;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            file.write_all_at(&framed, pos)?;
            if fsync {
                file.sync_data()?;
            }
            Ok(())
        })
        .await
        .map_err(|err| LogError::Io(std::io::Error::other(err)))??;

        let number = inner.next_record;
        inner.write_pos += frame_len;
        inner.next_record += 1;
        // Publish the new tail before releasing the lock so concurrent
        // appends can never move the watch backwards.
        self.tail.send_replace(inner.next_record);
        drop(inner);

        metrics::counter!("millrace_log_appends_total").increment(1);
        metrics::counter!("millrace_log_append_bytes_total").increment(frame_len);
        Ok(number)
    }

    async fn roll_head(&self, inner: &mut LogInner) -> Result<()> {
        let new_number = inner.head_number + 1;
        let path = file_path(&self.config.logs_dir, &self.channel, new_number);
        let size = self.config.max_log_chunk_size;
        let first_record = inner.next_record;
        let file =
            tokio::task::spawn_blocking(move || new_chunk(&path, size, first_record))
                .await
                .map_err(|err| LogError::Io(std::io::Error::other(err)))??;
        tracing::debug!(channel = %self.channel, file_number = new_number, "rolled log chunk");
        inner.head_file = file;
        inner.head_number = new_number;
        inner.write_pos = HEADER_SIZE;
        Ok(())
    }

    /// Open a cursor positioned to read record `start` next. Starts past the
    /// tail position after the last record, where the cursor waits for new
    /// appends.
    pub async fn cursor_at(&self, start: i64) -> Result<LogCursor> {
        let start = start.max(0);
        let logs_dir = self.config.logs_dir.clone();
        let channel = self.channel.clone();
        let (file_number, pos, next_record) =
            tokio::task::spawn_blocking(move || -> Result<(u64, u64, i64)> {
                let coord = coord_of_record(&logs_dir, &channel, start)?;
                if coord.record_number == start && coord.is_valid() {
                    return Ok((coord.file_number, coord.file_pos, start));
                }
                if !coord.is_valid() || coord.record_number < 0 {
                    // Empty channel: read from the front once records appear.
                    return Ok((0, HEADER_SIZE, 0));
                }
                // Clamped to the last record: position just after it.
                let path = file_path(&logs_dir, &channel, coord.file_number);
                let file = File::open(&path)?;
                let size = file.metadata()?.len();
                let end = skip_record(&file, size, coord.file_pos)?;
                Ok((coord.file_number, end, coord.record_number + 1))
            })
            .await
            .map_err(|err| LogError::Io(std::io::Error::other(err)))??;

        let path = file_path(&self.config.logs_dir, &self.channel, file_number);
        let file = if path.exists() {
            Some(File::open(&path)?)
        } else {
            None
        };
        Ok(LogCursor {
            logs_dir: self.config.logs_dir.clone(),
            channel: self.channel.clone(),
            file,
            file_number,
            pos,
            next_record,
            tail_rx: self.tail.subscribe(),
        })
    }
}

fn new_chunk(path: &Path, size: u64, first_record: i64) -> Result<File> {
    create_and_fill_file(path, size)?;
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    write_header(&file, first_record)?;
    Ok(file)
}

/// A read cursor over one channel, following chunk boundaries.
pub struct LogCursor {
    logs_dir: PathBuf,
    channel: String,
    file: Option<File>,
    file_number: u64,
    pos: u64,
    next_record: i64,
    tail_rx: watch::Receiver<i64>,
}

impl LogCursor {
    /// Number of the record `next` will yield.
    pub fn next_record(&self) -> i64 {
        self.next_record
    }

    /// Read the next record, or `None` at the tail.
    pub fn next(&mut self) -> Result<Option<LogRecord>> {
        loop {
            let Some(file) = &self.file else {
                if !self.try_open_current()? {
                    return Ok(None);
                }
                continue;
            };
            let size = file.metadata()?.len();
            let label = file_name(&self.channel, self.file_number);
            match read_record_frame(file, &label, size, self.pos)? {
                Some((payload, next_pos)) => {
                    let mut bytes = payload;
                    let document = Document::decode(&mut bytes)?;
                    let record = LogRecord {
                        number: self.next_record,
                        file_number: self.file_number,
                        file_pos: self.pos,
                        document,
                    };
                    self.pos = next_pos;
                    self.next_record += 1;
                    return Ok(Some(record));
                }
                None => {
                    // End of this chunk; follow to the next one if the log
                    // has rolled past it.
                    let next_path =
                        file_path(&self.logs_dir, &self.channel, self.file_number + 1);
                    if !next_path.exists() {
                        return Ok(None);
                    }
                    let file = File::open(&next_path)?;
                    read_header(&file, &file_name(&self.channel, self.file_number + 1))?;
                    self.file = Some(file);
                    self.file_number += 1;
                    self.pos = HEADER_SIZE;
                }
            }
        }
    }

    /// Wait until the log holds a record this cursor has not yielded.
    pub async fn wait_for_record(&mut self) -> Result<()> {
        while *self.tail_rx.borrow_and_update() <= self.next_record {
            self.tail_rx.changed().await.map_err(|_| LogError::Closed)?;
        }
        Ok(())
    }

    fn try_open_current(&mut self) -> Result<bool> {
        let path = file_path(&self.logs_dir, &self.channel, self.file_number);
        if !path.exists() {
            return Ok(false);
        }
        self.file = Some(File::open(&path)?);
        Ok(true)
    }
}

impl std::fmt::Debug for LogCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCursor")
            .field("channel", &self.channel)
            .field("file_number", &self.file_number)
            .field("pos", &self.pos)
            .field("next_record", &self.next_record)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_wire::Document;

    fn config(dir: &Path, chunk: u64) -> LogConfig {
        LogConfig {
            logs_dir: dir.to_path_buf(),
            max_log_chunk_size: chunk,
            fsync_on_append: false,
        }
    }

    fn event(n: i32) -> Document {
        Document::new().put("id", n)
    }

    #[tokio::test]
    async fn append_assigns_sequential_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Log::open(config(dir.path(), 64 * 1024), "orders")
            .await
            .expect("open");
        for expected in 0..5 {
            let number = log.append(&event(expected as i32)).await.expect("append");
            assert_eq!(number, expected);
        }
        assert_eq!(log.tail(), 5);
    }

    #[tokio::test]
    async fn cursor_reads_back_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Log::open(config(dir.path(), 64 * 1024), "orders")
            .await
            .expect("open");
        for n in 0..10 {
            log.append(&event(n)).await.expect("append");
        }
        let mut cursor = log.cursor_at(0).await.expect("cursor");
        for n in 0..10 {
            let record = cursor.next().expect("read").expect("record");
            assert_eq!(record.number, i64::from(n));
            assert_eq!(record.document.get_i32("id"), Some(n));
        }
        assert!(cursor.next().expect("read").is_none());
    }

    #[tokio::test]
    async fn cursor_follows_chunk_roll() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Small chunks so a handful of records spans several files.
        let log = Log::open(config(dir.path(), 256), "orders")
            .await
            .expect("open");
        for n in 0..20 {
            log.append(&event(n)).await.expect("append");
        }
        let mut cursor = log.cursor_at(0).await.expect("cursor");
        let mut seen = Vec::new();
        while let Some(record) = cursor.next().expect("read") {
            seen.push(record.document.get_i32("id").expect("id"));
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cursor_at_tail_waits_for_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Log::open(config(dir.path(), 64 * 1024), "orders")
            .await
            .expect("open");
        log.append(&event(0)).await.expect("append");
        let mut cursor = log.cursor_at(log.tail()).await.expect("cursor");
        assert!(cursor.next().expect("read").is_none());
        log.append(&event(1)).await.expect("append");
        cursor.wait_for_record().await.expect("wait");
        let record = cursor.next().expect("read").expect("record");
        assert_eq!(record.number, 1);
    }

    #[tokio::test]
    async fn oversized_record_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = Log::open(config(dir.path(), 256), "orders")
            .await
            .expect("open");
        let big = Document::new().put("blob", "x".repeat(512));
        let err = log.append(&big).await.expect_err("too large");
        assert!(matches!(err, LogError::RecordTooLarge { .. }));
    }
}
