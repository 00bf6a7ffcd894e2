// src/stream_log.rs
// Stream Logger: a buffered, size-rotating, periodically-flushed append-only
// sink for one side (stdout/stderr) of a supervised process.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::errors::{Result, SupervisorError};
use crate::terminal;

const BUFFER_CAPACITY: usize = 4 * 1024;
const FLUSH_LOW_WATERMARK: usize = 2 * 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const ROTATE_AT_BYTES: u64 = 100 * 1024 * 1024;

pub struct StreamLogger {
    agent: String,
    stream: String,
    logs_root: PathBuf,
    file: File,
    path: PathBuf,
    buffer: Vec<u8>,
    bytes_written: u64,
    last_flush: Instant,
    closed: bool,
}

impl StreamLogger {
    pub fn new(agent: &str, stream: &str, logs_root: &Path) -> Result<Self> {
        let dir = logs_root.join(agent);
        fs::create_dir_all(&dir)?;
        let path = dir.join(Self::filename(stream));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let header = format!(
            "# {} log - {}\n# Agent: {}\n\n",
            stream,
            Utc::now().to_rfc3339(),
            agent
        );
        file.write_all(header.as_bytes())?;
        file.flush()?;

        Ok(StreamLogger {
            agent: agent.to_string(),
            stream: stream.to_string(),
            logs_root: logs_root.to_path_buf(),
            file,
            path,
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
            bytes_written: header.len() as u64,
            last_flush: Instant::now(),
            closed: false,
        })
    }

    fn filename(stream: &str) -> String {
        format!("{}-{}.log", Utc::now().format("%Y-%m-%d-%H-%M-%S"), stream)
    }

    /// Like `filename`, but disambiguated with a numeric suffix if the
    /// second-resolution timestamp collides with an existing file (e.g. a
    /// forced rotation within the same second).
    fn unique_path(dir: &Path, stream: &str) -> PathBuf {
        let base = Self::filename(stream);
        let candidate = dir.join(&base);
        if !candidate.exists() {
            return candidate;
        }
        let stem = base.trim_end_matches(".log");
        for n in 1.. {
            let candidate = dir.join(format!("{stem}-{n}.log"));
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `bytes`, cleaning terminal escapes before they hit disk.
    /// Returns the *original* (pre-clean) byte count, per the stream's
    /// "bytes observed" accounting contract.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(SupervisorError::ClosedSink);
        }

        let cleaned = terminal::clean(bytes);
        self.buffer.extend_from_slice(&cleaned);

        let remaining_capacity = BUFFER_CAPACITY.saturating_sub(self.buffer.len());
        let due_to_time = self.last_flush.elapsed() >= FLUSH_INTERVAL;
        if remaining_capacity < FLUSH_LOW_WATERMARK || due_to_time {
            self.flush()?;
        }

        Ok(bytes.len())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(SupervisorError::ClosedSink);
        }
        if !self.buffer.is_empty() {
            self.file.write_all(&self.buffer)?;
            self.bytes_written += self.buffer.len() as u64;
            self.buffer.clear();
        }
        self.file.flush()?;
        self.last_flush = Instant::now();

        if self.bytes_written > ROTATE_AT_BYTES {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        let dir = self.logs_root.join(&self.agent);
        let new_path = Self::unique_path(&dir, &self.stream);
        let mut new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&new_path)?;
        let header = format!(
            "# {} log - {}\n# Agent: {}\n\n",
            self.stream,
            Utc::now().to_rfc3339(),
            self.agent
        );
        new_file.write_all(header.as_bytes())?;
        new_file.flush()?;

        self.file = new_file;
        self.path = new_path;
        self.bytes_written = header.len() as u64;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }

    /// Best-effort read of the last `n` bytes from the current on-disk log.
    pub fn tail(&self, n: usize) -> String {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let start = bytes.len().saturating_sub(n);
                String::from_utf8_lossy(&bytes[start..]).into_owned()
            }
            Err(_) => String::new(),
        }
    }
}

impl Drop for StreamLogger {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_header_and_returns_preclean_len() {
        let dir = tempdir().unwrap();
        let mut logger = StreamLogger::new("agent-a", "stdout", dir.path()).unwrap();
        let n = logger.write(b"\x1b[31mred\x1b[0m").unwrap();
        assert_eq!(n, b"\x1b[31mred\x1b[0m".len());
        logger.flush().unwrap();

        let contents = fs::read_to_string(logger.path()).unwrap();
        assert!(contents.contains("# stdout log"));
        assert!(contents.contains("red"));
        assert!(!contents.contains("\x1b"));
    }

    #[test]
    fn fails_after_close() {
        let dir = tempdir().unwrap();
        let mut logger = StreamLogger::new("agent-b", "stderr", dir.path()).unwrap();
        logger.close().unwrap();
        assert!(matches!(logger.write(b"x"), Err(SupervisorError::ClosedSink)));
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut logger = StreamLogger::new("agent-c", "stdout", dir.path()).unwrap();
        logger.close().unwrap();
        logger.close().unwrap();
    }

    #[test]
    fn rotation_creates_new_distinct_file() {
        let dir = tempdir().unwrap();
        let mut logger = StreamLogger::new("agent-d", "stdout", dir.path()).unwrap();
        let first_path = logger.path().to_path_buf();

        // Force past the rotation threshold without actually writing 100MiB.
        logger.bytes_written = 101 * 1024 * 1024;
        logger.write(b"trigger").unwrap();
        logger.flush().unwrap();

        let second_path = logger.path().to_path_buf();
        assert_ne!(first_path, second_path);
    }
}
