//! UTF-8 reassembly for terminal output
//!
//! PTY reads split the byte stream wherever the OS pleases, which can cut a
//! multi-byte character in half. Outbound WebSocket text frames must be valid
//! UTF-8, so an incomplete trailing sequence is held back until the next read
//! completes it.

/// Turns arbitrarily chunked bytes into boundary-safe text
#[derive(Debug, Default)]
pub struct Utf8Reassembler {
    /// Incomplete trailing sequence, at most 3 bytes
    pending: Vec<u8>,
}

impl Utf8Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back from the previous chunk
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Decode a chunk, returning all text that is complete so far
    ///
    /// Invalid sequences are replaced with U+FFFD; only a trailing prefix that
    /// may still become a valid character is kept for the next call.
    pub fn process(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut text = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                    }
                }
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "dir C:\\ é € 😀 done\r\n";

    #[test]
    fn test_ascii_passthrough() {
        let mut buffer = Utf8Reassembler::new();
        assert_eq!(buffer.process(b"hello\r\n"), "hello\r\n");
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn test_empty_chunk() {
        let mut buffer = Utf8Reassembler::new();
        assert_eq!(buffer.process(b""), "");
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn test_three_byte_char_split_across_reads() {
        let euro = "€".as_bytes();
        assert_eq!(euro.len(), 3);

        let mut buffer = Utf8Reassembler::new();
        assert_eq!(buffer.process(&euro[..1]), "");
        assert_eq!(buffer.pending(), &euro[..1]);

        assert_eq!(buffer.process(&euro[1..]), "€");
        assert!(buffer.pending().is_empty());

        assert_eq!(buffer.process(b" rest"), " rest");
    }

    #[test]
    fn test_four_byte_char_fed_byte_by_byte() {
        let mut buffer = Utf8Reassembler::new();
        let bytes = "😀".as_bytes();

        for (i, byte) in bytes[..3].iter().enumerate() {
            assert_eq!(buffer.process(&[*byte]), "");
            assert_eq!(buffer.pending().len(), i + 1);
        }
        assert_eq!(buffer.process(&bytes[3..]), "😀");
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn test_every_three_way_split_reconstructs_text() {
        let bytes = SAMPLE.as_bytes();
        for i in 0..=bytes.len() {
            for j in i..=bytes.len() {
                let mut buffer = Utf8Reassembler::new();
                let mut output = String::new();
                for chunk in [&bytes[..i], &bytes[i..j], &bytes[j..]] {
                    let unit = buffer.process(chunk);
                    assert!(!unit.contains(char::REPLACEMENT_CHARACTER));
                    assert!(buffer.pending().len() <= 3);
                    output.push_str(&unit);
                }
                assert_eq!(output, SAMPLE, "split at {} and {}", i, j);
                assert!(buffer.pending().is_empty());
            }
        }
    }

    #[test]
    fn test_invalid_byte_mid_stream_is_replaced() {
        let mut buffer = Utf8Reassembler::new();
        assert_eq!(buffer.process(b"ab\xFFcd"), "ab\u{FFFD}cd");
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn test_truncated_prefix_followed_by_invalid_byte() {
        let mut buffer = Utf8Reassembler::new();
        assert_eq!(buffer.process(b"x\xC3"), "x");
        assert_eq!(buffer.pending(), b"\xC3");

        // 0xC3 0x28 is not a valid pair; the stream keeps flowing.
        assert_eq!(buffer.process(b"(y"), "\u{FFFD}(y");
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn test_invalid_then_truncated_tail() {
        let mut buffer = Utf8Reassembler::new();
        let euro = "€".as_bytes();
        let mut chunk = b"\xFFok".to_vec();
        chunk.extend_from_slice(&euro[..2]);

        assert_eq!(buffer.process(&chunk), "\u{FFFD}ok");
        assert_eq!(buffer.pending(), &euro[..2]);
        assert_eq!(buffer.process(&euro[2..]), "€");
    }
}
