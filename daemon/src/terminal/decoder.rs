const UTF8_MAX: usize = 4;

/// Incremental UTF-8 decoder for the web terminal's output path.
///
/// WebSocket text frames must carry whole characters, but the PTY hands out
/// arbitrary byte chunks that can split a multi-byte sequence. Up to three
/// trailing bytes are carried over to the next write so no character is ever
/// emitted in halves.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    buffer: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(UTF8_MAX),
        }
    }

    /// Decodes `data` together with any carried-over bytes and returns the
    /// complete characters. Incomplete trailing sequences are buffered;
    /// bytes that can never start a valid sequence become U+FFFD.
    pub fn write(&mut self, data: &[u8]) -> String {
        if data.is_empty() && self.buffer.is_empty() {
            return String::new();
        }

        let full: Vec<u8> = if self.buffer.is_empty() {
            data.to_vec()
        } else {
            let mut combined = std::mem::take(&mut self.buffer);
            combined.extend_from_slice(data);
            combined
        };

        // Fast path: the whole chunk decodes cleanly.
        match String::from_utf8(full) {
            Ok(text) => {
                self.buffer.clear();
                text
            }
            Err(err) => self.write_slow(err.into_bytes()),
        }
    }

    fn write_slow(&mut self, full: Vec<u8>) -> String {
        let mut out = String::with_capacity(full.len());
        let mut i = 0;

        while i < full.len() {
            match std::str::from_utf8(&full[i..]) {
                Ok(tail) => {
                    out.push_str(tail);
                    i = full.len();
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&full[i..i + valid]) {
                        out.push_str(text);
                    }
                    i += valid;

                    // Short tails may still be the prefix of a rune that the
                    // next chunk completes; hold them back.
                    if full.len() - i < UTF8_MAX {
                        break;
                    }
                    out.push(char::REPLACEMENT_CHARACTER);
                    i += 1;
                }
            }
        }

        self.buffer.clear();
        if i < full.len() {
            self.buffer.extend_from_slice(&full[i..]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ascii_passes_through() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.write(b"hello"), "hello");
        assert_eq!(decoder.write(b""), "");
    }

    #[test]
    fn cjk_split_across_two_writes_yields_one_codepoint() {
        let mut decoder = Utf8Decoder::new();
        // U+4E2D split after its first byte.
        assert_eq!(decoder.write(&[0xE4]), "");
        assert_eq!(decoder.write(&[0xB8, 0xAD]), "中");
    }

    #[test]
    fn four_byte_sequence_split_three_ways() {
        let mut decoder = Utf8Decoder::new();
        let emoji = "🦀".as_bytes();
        assert_eq!(decoder.write(&emoji[..1]), "");
        assert_eq!(decoder.write(&emoji[1..3]), "");
        assert_eq!(decoder.write(&emoji[3..]), "🦀");
    }

    #[test]
    fn invalid_byte_with_enough_lookahead_becomes_replacement() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.write(&[0xFF, b'a', b'b', b'c', b'd']), "\u{FFFD}abcd");
    }

    #[test]
    fn mixed_text_around_a_split_sequence() {
        let mut decoder = Utf8Decoder::new();
        let mut input = b"ab".to_vec();
        input.push(0xE4);
        assert_eq!(decoder.write(&input), "ab");
        assert_eq!(decoder.write(&[0xB8, 0xAD, b'c']), "中c");
    }

    // Concatenation of the outputs equals the decode of the concatenated
    // input, regardless of where the chunk boundaries fall.
    #[test]
    fn arbitrary_splits_reassemble_exactly() {
        let text = "a中é🦀~\u{00df}中b";
        let bytes = text.as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = Utf8Decoder::new();
            let mut out = String::new();
            out.push_str(&decoder.write(&bytes[..split]));
            out.push_str(&decoder.write(&bytes[split..]));
            assert_eq!(out, text, "split at {split}");
        }
    }

    #[test]
    fn three_way_splits_reassemble_exactly() {
        let text = "中中中";
        let bytes = text.as_bytes();
        for first in 0..=bytes.len() {
            for second in first..=bytes.len() {
                let mut decoder = Utf8Decoder::new();
                let mut out = String::new();
                out.push_str(&decoder.write(&bytes[..first]));
                out.push_str(&decoder.write(&bytes[first..second]));
                out.push_str(&decoder.write(&bytes[second..]));
                assert_eq!(out, text, "splits at {first}/{second}");
            }
        }
    }
}
