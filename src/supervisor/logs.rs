//! Bounded buffer of drained worker output

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio_util::codec::Decoder;

/// Longest line kept from worker output; longer runs are split
pub const MAX_LINE_BYTES: usize = 4096;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of worker output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub stream: OutputStream,
    pub line: String,
}

/// Ring buffer keeping the most recent `capacity` lines
///
/// Cloning shares the buffer.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<LogLine>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a line, evicting the oldest when full
    pub fn push(&self, stream: OutputStream, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }

        let mut lines = self.lines.lock();
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            at: Utc::now(),
            stream,
            line: line.into(),
        });
    }

    /// The last `count` lines, oldest first
    pub fn tail(&self, count: usize) -> Vec<LogLine> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(count);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

/// Splits a worker pipe into lines of at most `max_length` bytes
///
/// Output without a newline is cut into `max_length` chunks, so the read
/// buffer never holds more than one chunk plus a single read. Invalid UTF-8
/// is replaced rather than rejected.
#[derive(Debug, Clone, Copy)]
pub struct OutputLineCodec {
    max_length: usize,
}

impl OutputLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
        }
    }
}

impl Default for OutputLineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

fn to_line(bytes: &[u8]) -> String {
    let line = String::from_utf8_lossy(bytes);
    line.trim_end_matches('\r').to_string()
}

impl Decoder for OutputLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        // A newline right after a full chunk still belongs to that chunk
        let window = src.len().min(self.max_length + 1);
        if let Some(pos) = src[..window].iter().position(|b| *b == b'\n') {
            let line = src.split_to(pos + 1);
            return Ok(Some(to_line(&line[..pos])));
        }

        if src.len() > self.max_length {
            let chunk = src.split_to(self.max_length);
            return Ok(Some(to_line(&chunk)));
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(to_line(&rest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut OutputLineCodec, input: &[u8]) -> Vec<String> {
        let mut src = BytesMut::from(input);
        let mut lines = Vec::new();
        while let Some(line) = codec.decode_eof(&mut src).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_codec_splits_on_newlines() {
        let mut codec = OutputLineCodec::default();
        let lines = decode_all(&mut codec, b"speed 10s/60s/15m\r\nnew job\npartial");
        assert_eq!(lines, vec!["speed 10s/60s/15m", "new job", "partial"]);
    }

    #[test]
    fn test_codec_caps_unterminated_output() {
        let mut codec = OutputLineCodec::new(8);
        let mut src = BytesMut::from(&[b'a'; 20][..]);

        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), "aaaaaaaa");
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), "aaaaaaaa");
        // Four bytes left, waiting for more input or a newline
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert_eq!(src.len(), 4);
        assert_eq!(codec.decode_eof(&mut src).unwrap().unwrap(), "aaaa");
    }

    #[test]
    fn test_codec_newline_after_full_chunk() {
        let mut codec = OutputLineCodec::new(4);
        let lines = decode_all(&mut codec, b"abcd\nef\n");
        assert_eq!(lines, vec!["abcd", "ef"]);
    }

    #[test]
    fn test_codec_replaces_invalid_utf8() {
        let mut codec = OutputLineCodec::default();
        let lines = decode_all(&mut codec, b"hash\xffrate\n");
        assert_eq!(lines, vec!["hash\u{fffd}rate"]);
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(OutputStream::Stdout, format!("line {}", i));
        }

        let tail = buffer.tail(10);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].line, "line 2");
        assert_eq!(tail[2].line, "line 4");
    }

    #[test]
    fn test_tail_returns_most_recent() {
        let buffer = LogBuffer::new(10);
        buffer.push(OutputStream::Stdout, "a");
        buffer.push(OutputStream::Stderr, "b");
        buffer.push(OutputStream::Stdout, "c");

        let tail = buffer.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].line, "b");
        assert_eq!(tail[0].stream, OutputStream::Stderr);
        assert_eq!(tail[1].line, "c");
    }

    #[test]
    fn test_zero_capacity_discards() {
        let buffer = LogBuffer::new(0);
        buffer.push(OutputStream::Stdout, "ignored");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clones_share_lines() {
        let buffer = LogBuffer::new(4);
        let other = buffer.clone();
        other.push(OutputStream::Stdout, "shared");
        assert_eq!(buffer.len(), 1);

        buffer.clear();
        assert!(other.is_empty());
    }
}
