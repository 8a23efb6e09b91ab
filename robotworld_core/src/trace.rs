//! Process-wide pluggable trace sink.
//!
//! Free-text trace lines (the world dump after every change, protocol
//! messages seen by response handlers) go to exactly one active sink. The
//! sink can be swapped at runtime; the swap is atomic with respect to
//! concurrent `trace` calls.

use crate::sync::{lock, read, write};

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Destination for trace lines.
pub trait TraceSink: Send + Sync {
    fn trace(&self, line: &str);

    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Drops every line.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl TraceSink for DiscardSink {
    fn trace(&self, _line: &str) {}

    fn name(&self) -> &'static str {
        "discard"
    }
}

/// Forwards lines to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl TraceSink for ConsoleSink {
    fn trace(&self, line: &str) {
        info!(target: "robotworld::trace", "{}", line);
    }

    fn name(&self) -> &'static str {
        "console"
    }
}

/// Appends lines to a file.
pub struct FileSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    /// Opens (or creates) the file in append mode.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSink for FileSink {
    fn trace(&self, line: &str) {
        let mut writer = lock(&self.writer);
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!("Failed to write trace line to {}: {}", self.path.display(), e);
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Sends lines over a channel, for a UI log widget to consume.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    /// Creates the sink together with the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TraceSink for ChannelSink {
    fn trace(&self, line: &str) {
        // A closed widget just stops receiving
        let _ = self.tx.send(line.to_string());
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Holder of the single active sink.
pub struct Trace {
    sink: RwLock<Arc<dyn TraceSink>>,
}

impl Trace {
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self {
            sink: RwLock::new(sink),
        }
    }

    /// Creates an Arc-wrapped trace writing to the console.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Writes one line to the active sink.
    pub fn trace(&self, line: &str) {
        let sink = Arc::clone(&read(&self.sink));
        sink.trace(line);
    }

    /// Replaces the active sink and returns the previous one.
    pub fn set_sink(&self, sink: Arc<dyn TraceSink>) -> Arc<dyn TraceSink> {
        let mut active = write(&self.sink);
        std::mem::replace(&mut *active, sink)
    }

    /// Name of the active sink.
    pub fn sink_name(&self) -> &'static str {
        read(&self.sink).name()
    }

    /// Switches to the sink described by `target`.
    ///
    /// A file that cannot be opened leaves the active sink in place.
    pub fn select(&self, target: &TraceTarget) -> std::io::Result<()> {
        let sink: Arc<dyn TraceSink> = match target {
            TraceTarget::Discard => Arc::new(DiscardSink),
            TraceTarget::Console => Arc::new(ConsoleSink),
            TraceTarget::File(path) => Arc::new(FileSink::open(path)?),
        };
        self.set_sink(sink);
        Ok(())
    }
}

impl Default for Trace {
    fn default() -> Self {
        Self::new(Arc::new(ConsoleSink))
    }
}

/// Sink choice as written on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceTarget {
    Discard,
    Console,
    File(PathBuf),
}

impl FromStr for TraceTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discard" | "none" => Ok(TraceTarget::Discard),
            "console" | "stdout" => Ok(TraceTarget::Console),
            _ => match s.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(TraceTarget::File(PathBuf::from(path))),
                _ => Err(format!("Unknown trace destination: {}", s)),
            },
        }
    }
}
