//! Streaming output for spec execution.
//!
//! Every spec's output is fanned out to two sinks: the shared terminal,
//! where each line is prefixed with `[<spec-id>] `, and a per-spec log
//! file, where each line is prefixed with a `[HH:MM:SS] ` timestamp from
//! a replaceable clock. Both sinks buffer partial writes until a newline
//! arrives; an explicit flush drains whatever is left. The file sink
//! enforces a size cap by rewriting itself down to the newest tail.

use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// How many bytes may be written between on-disk size checks.
const TRUNCATE_CHECK_INTERVAL: u64 = 1024 * 1024;

/// Fraction of the file dropped when the cap is exceeded (oldest 20%).
const TRUNCATE_DROP_DIVISOR: u64 = 5;

/// Replaceable time source for log timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A terminal (or test buffer) shared by every spec's prefix writer.
pub type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Shared sink over stdout.
pub fn stdout_sink() -> SharedSink {
    Arc::new(Mutex::new(Box::new(io::stdout())))
}

/// Shared sink over an arbitrary writer.
pub fn shared_sink<W: Write + Send + 'static>(writer: W) -> SharedSink {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Handle handed to the agent so concurrent readers can interleave writes.
pub type OutputHandle = Arc<Mutex<dyn Write + Send>>;

/// Terminal sink: prepends `[<spec-id>] ` to the start of every line.
///
/// Partial writes buffer until a newline arrives; flush emits a
/// terminating newline for any buffered remainder.
pub struct PrefixWriter {
    prefix: String,
    target: SharedSink,
    buf: Vec<u8>,
}

impl std::fmt::Debug for PrefixWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixWriter")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl PrefixWriter {
    pub fn new(spec_id: &str, target: SharedSink) -> Self {
        Self {
            prefix: format!("[{spec_id}] "),
            target,
            buf: Vec::new(),
        }
    }

    fn emit_line(&self, line: &[u8]) -> io::Result<()> {
        if let Ok(mut target) = self.target.lock() {
            target.write_all(self.prefix.as_bytes())?;
            target.write_all(line)?;
            if !line.ends_with(b"\n") {
                target.write_all(b"\n")?;
            }
        }
        Ok(())
    }
}

impl Write for PrefixWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit_line(&line)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.emit_line(&line)?;
        }
        if let Ok(mut target) = self.target.lock() {
            target.flush()?;
        }
        Ok(())
    }
}

/// File sink: timestamps each complete line and enforces the size cap.
pub struct SpecLogWriter {
    path: PathBuf,
    file: File,
    clock: Arc<dyn Clock>,
    max_size: u64,
    buf: Vec<u8>,
    since_check: u64,
}

impl std::fmt::Debug for SpecLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecLogWriter")
            .field("path", &self.path)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl SpecLogWriter {
    pub fn create(path: &Path, max_size: u64, clock: Arc<dyn Clock>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            clock,
            max_size,
            buf: Vec::new(),
            since_check: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stamp(&self) -> String {
        format!("[{}] ", self.clock.now().format("%H:%M:%S"))
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let stamp = self.stamp();
        self.file.write_all(stamp.as_bytes())?;
        self.file.write_all(line)?;
        if !line.ends_with(b"\n") {
            self.file.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Rewrite the file down to its newest tail when the cap is exceeded.
    ///
    /// The tail starts at the first line break past the oldest 20% of the
    /// current size and is preceded by a single `[TRUNCATED at HH:MM:SS]`
    /// marker line. The file is then reopened in append mode.
    fn maybe_truncate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let size = std::fs::metadata(&self.path)?.len();
        if size <= self.max_size {
            return Ok(());
        }

        let content = std::fs::read(&self.path)?;
        let cut = (size / TRUNCATE_DROP_DIVISOR) as usize;
        let tail_start = content
            .iter()
            .skip(cut)
            .position(|&b| b == b'\n')
            .map_or(content.len(), |pos| cut + pos + 1);

        let marker = format!("[TRUNCATED at {}]\n", self.clock.now().format("%H:%M:%S"));
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(marker.as_bytes())?;
            out.write_all(&content[tail_start..])?;
            out.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

impl Write for SpecLogWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.write_line(&line)?;
        }

        self.since_check += data.len() as u64;
        if self.since_check >= TRUNCATE_CHECK_INTERVAL {
            self.since_check = 0;
            self.maybe_truncate()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            self.write_line(&line)?;
        }
        self.file.flush()
    }
}

/// Combined per-spec output: terminal prefix sink plus timestamped file.
#[derive(Debug)]
pub struct SpecOutput {
    term: PrefixWriter,
    file: SpecLogWriter,
}

impl SpecOutput {
    pub fn create(
        spec_id: &str,
        term: SharedSink,
        log_path: &Path,
        max_log_size: u64,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        Ok(Self {
            term: PrefixWriter::new(spec_id, term),
            file: SpecLogWriter::create(log_path, max_log_size, clock)?,
        })
    }

    /// Wrap into the shared handle the agent writes through.
    pub fn into_handle(self) -> OutputHandle {
        Arc::new(Mutex::new(self))
    }
}

impl Write for SpecOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.term.write_all(data)?;
        self.file.write_all(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.term.flush()?;
        self.file.flush()
    }
}

/// Flush an output handle, swallowing poisoning.
pub fn flush_handle(handle: &OutputHandle) {
    if let Ok(mut writer) = handle.lock() {
        if let Err(err) = writer.flush() {
            tracing::warn!(%err, "failed to flush spec output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Clock pinned to a fixed time for deterministic stamps.
    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn fixed_clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 34, 56).unwrap(),
        ))
    }

    /// Writer that appends into a shared byte buffer.
    struct TestSink(Arc<Mutex<Vec<u8>>>);

    impl Write for TestSink {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_sink() -> (SharedSink, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = shared_sink(TestSink(Arc::clone(&buffer)));
        (sink, buffer)
    }

    #[test]
    fn prefix_writer_prefixes_every_line() {
        let (sink, buffer) = test_sink();
        let mut writer = PrefixWriter::new("f1", sink);

        writer.write_all(b"hello\nworld\n").unwrap();
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "[f1] hello\n[f1] world\n");
    }

    #[test]
    fn prefix_writer_buffers_partial_lines() {
        let (sink, buffer) = test_sink();
        let mut writer = PrefixWriter::new("f1", sink);

        writer.write_all(b"par").unwrap();
        assert!(buffer.lock().unwrap().is_empty());
        writer.write_all(b"tial\nrest").unwrap();
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "[f1] partial\n");

        // Flush emits the remainder with a terminating newline.
        writer.flush().unwrap();
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "[f1] partial\n[f1] rest\n");
    }

    #[test]
    fn file_sink_timestamps_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1.log");
        let mut writer = SpecLogWriter::create(&path, 1024 * 1024, fixed_clock()).unwrap();

        writer.write_all(b"first\nsecond\n").unwrap();
        writer.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "[12:34:56] first\n[12:34:56] second\n");
    }

    #[test]
    fn file_sink_flush_stamps_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1.log");
        let mut writer = SpecLogWriter::create(&path, 1024 * 1024, fixed_clock()).unwrap();

        writer.write_all(b"no newline").unwrap();
        writer.flush().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "[12:34:56] no newline\n");
    }

    #[test]
    fn truncation_keeps_tail_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1.log");
        // Small cap so a handful of lines trips it.
        let mut writer = SpecLogWriter::create(&path, 4096, fixed_clock()).unwrap();

        let line = "x".repeat(100);
        for i in 0..100 {
            writer.write_all(format!("{i:03} {line}\n").as_bytes()).unwrap();
        }
        writer.flush().unwrap();
        let before = std::fs::metadata(&path).unwrap().len();
        writer.maybe_truncate().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[TRUNCATED at 12:34:56]\n"), "{text}");
        // Exactly one marker.
        assert_eq!(text.matches("[TRUNCATED at").count(), 1);
        // The tail survived and the head did not.
        assert!(text.contains("099"));
        assert!(!text.contains("000"));
        // The oldest fifth of the file was dropped.
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before - before / 5 + 64, "before={before} after={after}");
        // No temp file left behind.
        assert!(!path.with_extension("log.tmp").exists());
        // Tail begins at a line boundary: first content line is intact.
        let second_line = text.lines().nth(1).unwrap();
        assert!(second_line.starts_with('['), "{second_line}");

        // The sink keeps appending after truncation.
        writer.write_all(b"after\n").unwrap();
        writer.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("[12:34:56] after\n"));
    }

    #[test]
    fn spec_output_fans_out_to_both_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1.log");
        let (sink, buffer) = test_sink();

        let mut output =
            SpecOutput::create("f1", sink, &path, 1024 * 1024, fixed_clock()).unwrap();
        output.write_all(b"both\n").unwrap();
        output.flush().unwrap();

        let term = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(term, "[f1] both\n");
        let file = std::fs::read_to_string(&path).unwrap();
        assert_eq!(file, "[12:34:56] both\n");
    }
}
