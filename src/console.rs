#![forbid(unsafe_code)]

//! User-facing output handle. Everything the tool prints for humans goes
//! through a [`Console`] that callers pass around, so tests can capture the
//! output instead of scraping stdout.

use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;

#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Console writing into memory; the returned handle reads it back.
    pub fn capture() -> (Self, CapturedOutput) {
        let buffer = CapturedOutput::default();
        (Self::new(buffer.clone()), buffer)
    }

    /// Writes one line. Output errors (closed pipe, full disk) are not worth
    /// aborting a download over, so they are only logged.
    pub fn line(&self, text: impl AsRef<str>) {
        let mut out = self.out.lock();
        if let Err(err) = writeln!(out, "{}", text.as_ref()).and_then(|()| out.flush()) {
            tracing::debug!("console write failed: {err}");
        }
    }

    pub fn blank(&self) {
        self.line("");
    }

    /// Writes `text` without a newline, for prompts.
    pub fn prompt(&self, text: &str) {
        let mut out = self.out.lock();
        if let Err(err) = write!(out, "{text}").and_then(|()| out.flush()) {
            tracing::debug!("console write failed: {err}");
        }
    }
}

#[derive(Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
