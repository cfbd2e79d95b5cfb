// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Best-effort diagnostics for fork streams: dump files, raw stream capture and handling of bytes
//! written outside of frames.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use debug_ignore::DebugIgnore;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
};
use tracing::{debug, error, info, warn};

/// Forks print this when waiting for a debugger to attach.
const PRINTABLE_JVM_NATIVE_STREAM: &str = "Listening for transport dt_socket at address:";

const JVM_ERROR_PATTERNS: &[&str] = &[
    "could not create the java virtual machine",
    "error occurred during initialization",
    "error:",
    "could not reserve enough space",
    "could not allocate",
    "unable to allocate",
    "java.lang.module.findexception",
];

/// A per-fork dump file for stream corruption and decoding failures.
///
/// The file is created on first use. Failing to write it is logged and otherwise ignored.
#[derive(Debug)]
pub struct DumpStream {
    path: Option<Utf8PathBuf>,
    file: Option<DebugIgnore<File>>,
    open_failed: bool,
}

impl DumpStream {
    /// Creates a dump stream for the given fork. If `dir` is `None`, nothing is written.
    pub fn new(dir: Option<&Utf8Path>, run_start: DateTime<Local>, fork_number: u32) -> Self {
        let path = dir.map(|dir| {
            dir.join(format!(
                "{}-jvmRun{fork_number}.dumpstream",
                run_start.format("%Y-%m-%dT%H-%M-%S_%3f"),
            ))
        });
        Self {
            path,
            file: None,
            open_failed: false,
        }
    }

    /// Creates a dump stream that discards everything.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
            open_failed: false,
        }
    }

    /// Returns the path to the dump file, if dumping is enabled.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Appends a line of text to the dump file.
    pub fn dump_text(&mut self, text: &str) {
        let Some(file) = self.file() else {
            return;
        };
        if let Err(error) = writeln!(file, "{text}") {
            debug!("failed to write to dump file: {error}");
        }
    }

    fn file(&mut self) -> Option<&mut File> {
        if self.file.is_none() && !self.open_failed {
            let path = self.path.as_ref()?;
            let opened = path
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| OpenOptions::new().create(true).append(true).open(path));
            match opened {
                Ok(file) => self.file = Some(DebugIgnore(file)),
                Err(error) => {
                    debug!("failed to open dump file {path}: {error}");
                    self.open_failed = true;
                }
            }
        }
        self.file.as_mut().map(|file| &mut file.0)
    }
}

/// An optional sink that receives every raw byte read from a fork.
///
/// Write failures never interrupt decoding: they are counted and otherwise dropped.
#[derive(Debug)]
pub struct DebugSink {
    writer: DebugIgnore<Box<dyn Write + Send>>,
    failed_writes: u64,
}

impl DebugSink {
    /// Creates a sink writing to the given writer.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: DebugIgnore(Box::new(writer)),
            failed_writes: 0,
        }
    }

    /// Creates (or truncates) a file to write to.
    pub fn create(path: &Utf8Path) -> io::Result<Self> {
        Ok(Self::new(File::create(path)?))
    }

    /// Writes raw bytes to the sink.
    pub fn write(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self
            .writer
            .write_all(bytes)
            .and_then(|()| self.writer.flush())
            .is_err()
        {
            self.failed_writes += 1;
        }
    }

    /// Returns the number of writes that failed.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes
    }
}

/// Accumulates bytes a fork wrote outside of frames into lines, and reports them.
#[derive(Debug)]
pub(crate) struct NativeStreamLines {
    fork_number: u32,
    line: Vec<u8>,
    after_new_line: bool,
    corrupted_lines: usize,
    dump: DumpStream,
}

impl NativeStreamLines {
    pub(crate) fn new(fork_number: u32, dump: DumpStream) -> Self {
        Self {
            fork_number,
            line: Vec::new(),
            after_new_line: false,
            corrupted_lines: 0,
            dump,
        }
    }

    pub(crate) fn corrupted_lines(&self) -> usize {
        self.corrupted_lines
    }

    pub(crate) fn dump(&mut self) -> &mut DumpStream {
        &mut self.dump
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if !self.after_new_line {
                    self.finish_line();
                }
                self.after_new_line = true;
            } else {
                self.line.push(b);
                self.after_new_line = false;
            }
        }
    }

    /// Reports a final line that wasn't terminated by a new line.
    pub(crate) fn flush(&mut self) {
        self.finish_line();
    }

    fn finish_line(&mut self) {
        if self.line.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        if line.trim().is_empty() {
            return;
        }

        if line.contains(PRINTABLE_JVM_NATIVE_STREAM) {
            info!("{line}");
            return;
        }

        if is_jvm_error(&line) {
            error!("{line}");
        } else {
            debug!("{line}");
        }

        let msg = format!(
            "Corrupted channel by directly writing to native stream in forked JVM {}.",
            self.fork_number,
        );
        self.dump.dump_text(&format!("{msg} Stream '{line}'."));
        self.corrupted_lines += 1;
        if self.corrupted_lines == 1 {
            match self.dump.path() {
                Some(path) => warn!("{msg} See the dump file {path}"),
                None => warn!("{msg}"),
            }
        }
    }
}

fn is_jvm_error(line: &str) -> bool {
    let lower = line.to_lowercase();
    JVM_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use std::sync::{Arc, Mutex};

    #[test]
    fn lines_are_dumped() {
        let dir = Utf8TempDir::new().unwrap();
        let dump = DumpStream::new(Some(dir.path()), Local::now(), 3);
        let path = dump.path().unwrap().to_owned();
        assert!(path.as_str().ends_with("-jvmRun3.dumpstream"));

        let mut lines = NativeStreamLines::new(3, dump);
        lines.write(b"hello\r\n\n  \nListening for transport dt_socket at address: 5005\nwor");
        lines.write(b"ld");
        assert_eq!(lines.corrupted_lines(), 1);
        lines.flush();
        assert_eq!(lines.corrupted_lines(), 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "Corrupted channel by directly writing to native stream in forked JVM 3. Stream 'hello'.\n\
             Corrupted channel by directly writing to native stream in forked JVM 3. Stream 'world'.\n"
        );
    }

    #[test]
    fn jvm_errors() {
        assert!(is_jvm_error("Error: Could not find or load main class"));
        assert!(is_jvm_error(
            "Error occurred during initialization of boot layer"
        ));
        assert!(!is_jvm_error("all good"));
    }

    #[test]
    fn disabled_dump_stream() {
        let mut dump = DumpStream::disabled();
        dump.dump_text("ignored");
        assert_eq!(dump.path(), None);
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn debug_sink_swallows_failures() {
        let mut sink = DebugSink::new(FailingWriter);
        sink.write(b"abc");
        sink.write(b"");
        sink.write(b"def");
        assert_eq!(sink.failed_writes(), 2);

        let shared = SharedWriter::default();
        let mut sink = DebugSink::new(shared.clone());
        sink.write(b"abc");
        sink.write(b"def");
        assert_eq!(sink.failed_writes(), 0);
        assert_eq!(&*shared.0.lock().unwrap(), b"abcdef");
    }
}
