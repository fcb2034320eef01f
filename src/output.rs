//! Per-frame fan-out of child stdout/stderr to logfiles and live
//! subscribers.
//!
//! Output is accumulated per stream until a newline is seen; complete lines
//! are then delivered to every sink with the newline included. A sink that
//! fails a write is dropped and its siblings are unaffected.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutStream {
    Stdout,
    Stderr,
}

impl OutStream {
    fn index(self) -> usize {
        match self {
            OutStream::Stdout => 0,
            OutStream::Stderr => 1,
        }
    }
}

/// Opaque sink handle. Handles start at 1000 and are never reused within a
/// multiplexer's lifetime.
pub type SinkHandle = u32;

const FIRST_HANDLE: SinkHandle = 1000;

enum Sink {
    /// Logfile owned by the multiplexer, opened append and unbuffered.
    File { path: PathBuf, file: File },
    /// Externally provided live subscriber. The receiving side stays open
    /// when the multiplexer closes.
    Channel(UnboundedSender<Vec<u8>>),
}

impl Sink {
    fn write(&mut self, line: &[u8]) -> Result<(), String> {
        match self {
            Sink::File { file, .. } => file
                .write_all(line)
                .and_then(|()| file.flush())
                .map_err(|e| e.to_string()),
            Sink::Channel(tx) => tx.send(line.to_vec()).map_err(|_| "subscriber gone".into()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Sink::File { path, .. } => path.display().to_string(),
            Sink::Channel(_) => "live subscriber".to_string(),
        }
    }
}

pub struct OutputMux {
    sinks: HashMap<SinkHandle, Sink>,
    next_handle: SinkHandle,
    buffers: [Vec<u8>; 2],
}

impl Default for OutputMux {
    fn default() -> Self {
        OutputMux::new()
    }
}

impl OutputMux {
    pub fn new() -> OutputMux {
        OutputMux {
            sinks: HashMap::new(),
            next_handle: FIRST_HANDLE,
            buffers: [Vec::new(), Vec::new()],
        }
    }

    fn register(&mut self, sink: Sink) -> SinkHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.sinks.insert(handle, sink);
        handle
    }

    /// Open a logfile sink in append mode, creating parent directories as
    /// needed. The multiplexer owns the file and closes it on `close`.
    pub fn connect_file(&mut self, path: &Path) -> std::io::Result<SinkHandle> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(self.register(Sink::File {
            path: path.to_path_buf(),
            file,
        }))
    }

    /// Register a live subscriber. Each complete line is delivered as one
    /// message.
    pub fn connect_channel(&mut self, tx: UnboundedSender<Vec<u8>>) -> SinkHandle {
        self.register(Sink::Channel(tx))
    }

    pub fn disconnect(&mut self, handle: SinkHandle) -> bool {
        self.sinks.remove(&handle).is_some()
    }

    /// Consume a chunk of child output. Complete lines are fanned out now;
    /// a trailing partial line is retained for the next chunk.
    pub fn write(&mut self, stream: OutStream, data: &[u8]) {
        let mut lines = Vec::new();
        {
            let buf = &mut self.buffers[stream.index()];
            buf.extend_from_slice(data);

            let mut start = 0;
            while let Some(pos) = memchr::memchr(b'\n', &buf[start..]) {
                let end = start + pos + 1;
                lines.push(buf[start..end].to_vec());
                start = end;
            }
            if start > 0 {
                buf.drain(..start);
            }
        }
        for line in lines {
            self.fan_out(&line);
        }
    }

    /// Emit any retained partial lines. Called once when the child exits.
    pub fn flush(&mut self) {
        for index in 0..self.buffers.len() {
            if self.buffers[index].is_empty() {
                continue;
            }
            let residual = std::mem::take(&mut self.buffers[index]);
            self.fan_out(&residual);
        }
    }

    /// Flush residual output and drop every sink. Owned logfiles are closed
    /// here; channel subscribers only lose this sender.
    pub fn close(&mut self) {
        self.flush();
        self.sinks.clear();
    }

    fn fan_out(&mut self, line: &[u8]) {
        let mut dead: Vec<SinkHandle> = Vec::new();
        for (handle, sink) in self.sinks.iter_mut() {
            if let Err(reason) = sink.write(line) {
                warn!(sink = %sink.describe(), %reason, "dropping failed output sink");
                dead.push(*handle);
            }
        }
        for handle in dead {
            self.sinks.remove(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn lines(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(String::from_utf8(line).unwrap());
        }
        out
    }

    #[test]
    fn complete_lines_are_emitted_per_line() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mux = OutputMux::new();
        mux.connect_channel(tx);

        mux.write(OutStream::Stdout, b"one\ntwo\n");
        assert_eq!(lines(&mut rx), vec!["one\n", "two\n"]);
    }

    #[test]
    fn partial_line_is_retained_across_chunks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mux = OutputMux::new();
        mux.connect_channel(tx);

        mux.write(OutStream::Stdout, b"hel");
        assert!(lines(&mut rx).is_empty());
        mux.write(OutStream::Stdout, b"lo\nwor");
        assert_eq!(lines(&mut rx), vec!["hello\n"]);
        mux.flush();
        assert_eq!(lines(&mut rx), vec!["wor"]);
    }

    #[test]
    fn streams_buffer_independently() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mux = OutputMux::new();
        mux.connect_channel(tx);

        mux.write(OutStream::Stdout, b"out");
        mux.write(OutStream::Stderr, b"err\n");
        assert_eq!(lines(&mut rx), vec!["err\n"]);
        mux.write(OutStream::Stdout, b"put\n");
        assert_eq!(lines(&mut rx), vec!["output\n"]);
    }

    #[test]
    fn failing_sink_is_dropped_not_fatal() {
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();

        let mut mux = OutputMux::new();
        mux.connect_channel(dead_tx);
        mux.connect_channel(live_tx);

        mux.write(OutStream::Stdout, b"a\nb\n");
        assert_eq!(lines(&mut live_rx), vec!["a\n", "b\n"]);
    }

    #[test]
    fn logfile_receives_bytes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.rqlog");

        let mut mux = OutputMux::new();
        mux.connect_file(&path).unwrap();
        mux.write(OutStream::Stdout, b"1\n");
        mux.write(OutStream::Stderr, b"2\n");
        mux.write(OutStream::Stdout, b"3");
        mux.close();

        assert_eq!(std::fs::read(&path).unwrap(), b"1\n2\n3");
    }

    #[test]
    fn handles_start_at_1000_and_increment() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mux = OutputMux::new();
        let a = mux.connect_channel(tx.clone());
        let b = mux.connect_channel(tx);
        assert_eq!(a, 1000);
        assert_eq!(b, 1001);
        assert!(mux.disconnect(a));
        assert!(!mux.disconnect(a));
    }
}
