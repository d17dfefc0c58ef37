//! Console capture for a single run.

use std::sync::{Mutex, MutexGuard, PoisonError};

use codemode_primitives::ExecutionOutcome;
use codemode_script::{OutputSink, Stream};

/// Ordered log lines written by one snippet run.
///
/// Each write is split into lines with trailing whitespace removed; a write
/// that is blank once trimmed adds nothing. Diagnostic-stream lines carry the
/// [`ExecutionOutcome::ERROR_PREFIX`].
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: Mutex<Vec<String>>,
}

impl LogBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the lines captured so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.guard().clone()
    }

    /// Removes and returns every captured line.
    #[must_use]
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.guard())
    }

    /// Number of captured lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    /// Returns `true` when nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self) -> MutexGuard<'_, Vec<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputSink for LogBuffer {
    fn write(&self, stream: Stream, text: &str) {
        let text = text.trim_end();
        if text.is_empty() {
            return;
        }
        let prefix = match stream {
            Stream::Stdout => "",
            Stream::Stderr => ExecutionOutcome::ERROR_PREFIX,
        };
        let mut lines = self.guard();
        lines.extend(text.lines().map(|line| format!("{prefix}{}", line.trim_end())));
    }
}
