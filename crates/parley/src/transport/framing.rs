//! Delimiter framing for byte-stream connections.

use bytes::{Buf, BytesMut};

use crate::error::{ParleyError, ParleyResult};

/// Default message delimiter.
pub const DEFAULT_DELIMITER: &str = "\n";

/// Default cap on one inbound message, in bytes.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Splits an unbounded byte stream into messages on a delimiter.
///
/// Partial segments stay buffered across reads and the delimiter search
/// resumes where the previous read stopped. Segments are decoded as UTF-8
/// only once complete, so a character split across reads survives.
#[derive(Debug)]
pub struct MessageFramer {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    scanned: usize,
    max_frame: usize,
}

impl MessageFramer {
    pub fn new(delimiter: &str) -> Self {
        let delimiter = if delimiter.is_empty() {
            DEFAULT_DELIMITER
        } else {
            delimiter
        };
        Self {
            delimiter: delimiter.as_bytes().to_vec(),
            buffer: BytesMut::new(),
            scanned: 0,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    /// Reject messages longer than `max_frame` bytes.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.max(1);
        self
    }

    /// Feed one read. Returns the complete, non-blank messages it finished,
    /// or an error once a message outgrows the frame cap.
    pub fn push(&mut self, data: &[u8]) -> ParleyResult<Vec<String>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(pos) = find(&self.buffer[self.scanned..], &self.delimiter) {
            let end = self.scanned + pos;
            if end > self.max_frame {
                if messages.is_empty() {
                    return Err(self.oversized(end));
                }
                // deliver what was framed; the next push reports the overflow
                break;
            }
            let segment = self.buffer.split_to(end);
            self.buffer.advance(self.delimiter.len());
            self.scanned = 0;

            let text = String::from_utf8_lossy(&segment);
            if !text.trim().is_empty() {
                messages.push(text.into_owned());
            }
        }

        // a delimiter may straddle this read and the next
        self.scanned = self
            .buffer
            .len()
            .saturating_sub(self.delimiter.len().saturating_sub(1));
        if messages.is_empty() && self.buffer.len() > self.max_frame {
            return Err(self.oversized(self.buffer.len()));
        }
        Ok(messages)
    }

    fn oversized(&self, len: usize) -> ParleyError {
        ParleyError::Transport(format!(
            "message of {len}+ bytes exceeds the {} byte frame limit",
            self.max_frame
        ))
    }

    /// Bytes waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassembles_across_reads() {
        let mut framer = MessageFramer::default();
        assert!(framer.push(b"abc").unwrap().is_empty());
        assert_eq!(framer.push(b"def\n").unwrap(), vec!["abcdef"]);
        assert_eq!(framer.push(b"ghi\n").unwrap(), vec!["ghi"]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_several_messages_in_one_read() {
        let mut framer = MessageFramer::default();
        assert_eq!(framer.push(b"a\nb\nc").unwrap(), vec!["a", "b"]);
        assert_eq!(framer.buffered(), 1);
        assert_eq!(framer.push(b"\n").unwrap(), vec!["c"]);
    }

    #[test]
    fn test_blank_segments_are_skipped() {
        let mut framer = MessageFramer::default();
        assert_eq!(framer.push(b"\n  \none\n\t\n").unwrap(), vec!["one"]);
    }

    #[test]
    fn test_multibyte_delimiter_split_across_reads() {
        let mut framer = MessageFramer::new("\r\n");
        assert!(framer.push(b"first\r").unwrap().is_empty());
        assert_eq!(framer.push(b"\nsecond\r\n").unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_utf8_split_across_reads() {
        let mut framer = MessageFramer::default();
        let bytes = "héllo\n".as_bytes();
        assert!(framer.push(&bytes[..2]).unwrap().is_empty());
        assert_eq!(framer.push(&bytes[2..]).unwrap(), vec!["héllo"]);
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let mut framer = MessageFramer::default().with_max_frame(8);
        assert_eq!(framer.push(b"short\n").unwrap(), vec!["short"]);
        assert!(framer.push(b"12345").unwrap().is_empty());
        let err = framer.push(b"6789").unwrap_err();
        assert_eq!(err.key(), "TransportError");

        let mut framer = MessageFramer::default().with_max_frame(4);
        assert!(framer.push(b"toolong\nok\n").is_err());

        // earlier messages in the same read are still delivered
        let mut framer = MessageFramer::default().with_max_frame(4);
        assert_eq!(framer.push(b"ok\ntoolong").unwrap(), vec!["ok"]);
        assert!(framer.push(b"!").is_err());
    }

    #[test]
    fn test_empty_delimiter_falls_back_to_newline() {
        let mut framer = MessageFramer::new("");
        assert_eq!(framer.push(b"x\n").unwrap(), vec!["x"]);
    }
}
