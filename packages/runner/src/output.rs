// ABOUTME: Shared append-only text buffer between channel readers and the status reporter
// ABOUTME: Supports concurrent writers with atomic drain-and-clear semantics

use std::sync::{Arc, Mutex};

/// Collects decoded output from a job's stdout/stderr channels.
///
/// Both channel reader tasks write into the same buffer, so fragments are
/// interleaved in arrival order. The status reporter drains it with [`pop`],
/// which transfers everything appended since the previous drain.
///
/// [`pop`]: OutputBuffer::pop
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<String>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decoded chunk of output.
    pub fn handle_chunk(&self, chunk: &str) {
        let mut inner = self.inner.lock().expect("output buffer lock poisoned");
        inner.push_str(chunk);
    }

    /// Drain the buffer, returning everything appended since the last call.
    pub fn pop(&self) -> String {
        let mut inner = self.inner.lock().expect("output buffer lock poisoned");
        std::mem::take(&mut *inner)
    }
}
