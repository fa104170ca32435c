//! Per-invocation execution parameters and output sinks.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use berth_core::api::InputSource;

/// Shared destination for command output.
pub type OutputSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Wraps any writer as an [`OutputSink`].
pub fn sink(writer: impl Write + Send + 'static) -> OutputSink {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// In-memory writer whose contents stay readable after it is handed out.
#[derive(Debug, Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        let buf = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Owned writer forwarding to a shared sink.
struct SinkWriter(OutputSink);

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

/// Writer that starts every line with a fixed prefix.
pub struct PrefixWriter<W> {
    prefix: String,
    inner: W,
    at_line_start: bool,
}

impl<W: Write> PrefixWriter<W> {
    /// Wraps `inner`, prefixing each line with `prefix`.
    pub fn new(prefix: impl Into<String>, inner: W) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
            at_line_start: true,
        }
    }
}

impl<W: Write> Write for PrefixWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = Vec::with_capacity(buf.len() + self.prefix.len());
        for &byte in buf {
            if self.at_line_start {
                out.extend_from_slice(self.prefix.as_bytes());
            }
            out.push(byte);
            self.at_line_start = byte == b'\n';
        }
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Execution parameters of one run invocation.
///
/// Cloning shares the output sinks and input; identity overrides such as
/// [`RunContext::as_root`] produce a modified clone.
#[derive(Clone)]
pub struct RunContext {
    /// Prefix written before every output line when not in tty mode.
    pub prefix: String,
    /// User commands run as, provisioned inside the container first.
    pub user: Option<String>,
    /// Working directory of executed commands.
    pub workdir: Option<String>,
    /// Run the container and its execs privileged.
    pub privileged: bool,
    /// Give the container access to the host's runtime socket.
    pub docker_in_docker: bool,
    /// Destination of command standard output and progress text.
    pub stdout: OutputSink,
    /// Destination of command standard error.
    pub stderr: OutputSink,
    /// Fed to each command's standard input.
    pub stdin: Option<InputSource>,
    /// Suppress progress and echo output.
    pub silent: bool,
    /// Echo every command and copy before it runs.
    pub debug: bool,
    /// Allocate a pseudo terminal for commands.
    pub tty: bool,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("prefix", &self.prefix)
            .field("user", &self.user)
            .field("workdir", &self.workdir)
            .field("privileged", &self.privileged)
            .field("docker_in_docker", &self.docker_in_docker)
            .field("silent", &self.silent)
            .field("debug", &self.debug)
            .field("tty", &self.tty)
            .finish_non_exhaustive()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::with_sinks(sink(io::stdout()), sink(io::stderr()))
    }
}

impl RunContext {
    /// Context writing to the given sinks, with every flag off.
    pub fn with_sinks(stdout: OutputSink, stderr: OutputSink) -> Self {
        Self {
            prefix: String::new(),
            user: None,
            workdir: None,
            privileged: false,
            docker_in_docker: false,
            stdout,
            stderr,
            stdin: None,
            silent: false,
            debug: false,
            tty: false,
        }
    }

    /// Clone running as `root` in `/`, without input or terminal.
    #[must_use]
    pub fn as_root(&self) -> Self {
        Self {
            user: Some("root".into()),
            workdir: Some("/".into()),
            stdin: None,
            tty: false,
            ..self.clone()
        }
    }

    /// Whether commands and copies are echoed.
    pub const fn is_debug(&self) -> bool {
        self.debug && !self.silent
    }

    /// Writer for command standard output.
    pub fn stdout_writer(&self) -> Box<dyn Write + Send> {
        self.writer(&self.stdout)
    }

    /// Writer for command standard error.
    pub fn stderr_writer(&self) -> Box<dyn Write + Send> {
        self.writer(&self.stderr)
    }

    fn writer(&self, target: &OutputSink) -> Box<dyn Write + Send> {
        let raw = SinkWriter(Arc::clone(target));
        if self.tty || self.prefix.is_empty() {
            Box::new(raw)
        } else {
            Box::new(PrefixWriter::new(self.prefix.clone(), raw))
        }
    }

    /// Writes `text` to stdout with the line prefix, unless silent.
    pub fn say(&self, text: &str) {
        if self.silent {
            return;
        }
        let mut writer = PrefixWriter::new(self.prefix.clone(), SinkWriter(Arc::clone(&self.stdout)));
        if let Err(e) = writer.write_all(text.as_bytes()).and_then(|()| writer.flush()) {
            tracing::warn!(error = %e, "writing to run output failed");
        }
    }

    /// Writes raw bytes to stdout, bypassing the prefix.
    ///
    /// # Errors
    ///
    /// Returns the sink's write error.
    pub fn write_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut out = self.stdout.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(bytes)?;
        out.flush()
    }
}
