//! CRLF line framing for the inbound byte stream.
//!
//! The radio writes one JSON document per line, terminated by `\r\n`. Reads
//! from the port return arbitrary chunks, so [`LineFramer`] keeps the
//! unterminated tail between calls and only hands out complete lines.
//!
//! No upper bound is placed on the pending fragment: a peer that never sends
//! a delimiter grows it without limit.

/// The exact byte sequence that terminates a line.
pub const DELIMITER: &[u8] = b"\r\n";

/// A complete line, without its delimiter.
pub type Line = String;

/// Stateful CRLF splitter.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
    /// Offset up to which `pending` is known to contain no delimiter.
    scanned: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completes, in order.
    ///
    /// Lines are decoded as UTF-8; invalid sequences are replaced rather
    /// than rejected, so framing itself never fails.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Line> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        // A delimiter may straddle the previous scan boundary.
        let mut from = self.scanned.saturating_sub(DELIMITER.len() - 1);

        while let Some(pos) = find_delimiter(&self.pending[from..]) {
            let end = from + pos;
            lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            start = end + DELIMITER.len();
            from = start;
        }

        self.pending.drain(..start);
        self.scanned = self.pending.len();
        lines
    }

    /// Emit whatever is pending as a final line and reset.
    ///
    /// Called at end of stream. Returns `None` when nothing is pending.
    pub fn flush(&mut self) -> Option<Line> {
        self.scanned = 0;
        if self.pending.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Number of buffered bytes not yet terminated by a delimiter.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}
