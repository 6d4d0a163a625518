use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::serial::error::SerialPortError;

/// Lines longer than this are dropped unless the codec is told otherwise.
pub const MAX_LINE_LENGTH: usize = 4096;

/// This codec splits incoming bytes on a delimiter and yields lossy utf8 lines,
/// with any trailing carriage return removed.
/// Encoded lines get the write delimiter appended unless they already end with it.
///
/// A line longer than the max length is discarded, up to and including its delimiter,
/// so a device streaming garbage without delimiters can not grow the buffer without bound.
#[derive(Debug, Clone)]
pub struct LinesCodec {
    /// How far we have looked for a newline into the buffer
    cursor: usize,

    /// How to delimit incoming byte streams.
    /// This delimiter is not included in the yielded frames.
    read_delimiter: u8,

    /// Which byte to append when writing (encoding) lines.
    write_delimiter: u8,

    max_length: usize,

    /// Throwing bytes away until the next delimiter.
    discarding: bool,
}

impl LinesCodec {
    /// Create a new codec.
    pub fn new(read_delimiter: u8, write_delimiter: u8) -> Self {
        Self {
            cursor: 0,
            read_delimiter,
            write_delimiter,
            max_length: MAX_LINE_LENGTH,
            discarding: false,
        }
    }

    /// Drop lines longer than `max_length` bytes.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    fn into_line(bytes: &[u8]) -> String {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);

        String::from_utf8_lossy(bytes).to_string()
    }

    fn start_discarding(&mut self, src: &mut BytesMut) {
        if !self.discarding {
            warn!(max_length = self.max_length, "Line too long, discarding it");
        }

        self.discarding = true;
        self.cursor = 0;
        src.clear();
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', b'\n')
    }
}

impl Decoder for LinesCodec {
    type Item = String;
    type Error = SerialPortError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let look_at = &src[self.cursor..];

            let Some(position) = look_at.iter().position(|&byte| byte == self.read_delimiter) else {
                if self.discarding || src.len() > self.max_length {
                    self.start_discarding(src);
                } else {
                    // We did not find a full frame.
                    // The same buffer comes back next time, possibly with more data,
                    // so there is no need to look at these bytes again.
                    self.cursor = src.len();
                }

                return Ok(None);
            };

            // Since we might "start late" in the buffer (from the cursor),
            // the "global" position within the buffer has to be calculated.
            let actual_position = self.cursor + position;

            // Next time we need to start over.
            self.cursor = 0;

            if self.discarding || actual_position > self.max_length {
                if !self.discarding {
                    warn!(max_length = self.max_length, "Line too long, discarding it");
                }

                // The tail of the long line, and its delimiter.
                src.advance(actual_position + 1);
                self.discarding = false;
                continue;
            }

            // Split at the delimiter, getting a slice of the bytes before it.
            let line = src.split_to(actual_position);

            // Discard the newline by advancing the source buffer beyond it.
            src.advance(1);

            return Ok(Some(Self::into_line(&line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => {
                self.discarding = false;
                Ok(None)
            }
            None => {
                // An unterminated last line is still a line.
                self.cursor = 0;
                let rest = src.split_to(src.len());
                Ok(Some(Self::into_line(&rest)))
            }
        }
    }
}

impl Encoder<String> for LinesCodec {
    type Error = SerialPortError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.as_bytes());

        if !item.as_bytes().ends_with(&[self.write_delimiter]) {
            dst.extend_from_slice(&[self.write_delimiter]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut LinesCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = vec![];
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn splits_and_strips_carriage_returns() {
        let mut codec = LinesCodec::default();
        let mut buf = BytesMut::from(&b"Done\r\nError: no route\nHELLO"[..]);

        assert_eq!(decode_all(&mut codec, &mut buf), vec!["Done", "Error: no route"]);

        // The partial line waits for more bytes.
        assert_eq!(&buf[..], b"HELLO");
        buf.extend_from_slice(b" AA:BB:CC:DD:EE:FF\n");
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec!["HELLO AA:BB:CC:DD:EE:FF"]
        );
    }

    #[test]
    fn unterminated_line_at_eof() {
        let mut codec = LinesCodec::default();
        let mut buf = BytesMut::from(&b"BLINK-OK"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some("BLINK-OK".to_string())
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn long_lines_are_discarded_up_to_the_next_delimiter() {
        let mut codec = LinesCodec::default().with_max_length(8);
        let mut buf = BytesMut::new();

        // Garbage without any delimiter does not pile up.
        buf.extend_from_slice(&[b'x'; 20]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(&[b'x'; 20]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        // The rest of the long line goes too, then lines come through again.
        buf.extend_from_slice(b"xxx\nDone\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["Done"]);

        // A long line arriving in one go is dropped by itself.
        buf.extend_from_slice(b"0123456789abcdef\nREADY\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["READY"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn lines_at_the_max_length_are_kept() {
        let mut codec = LinesCodec::default().with_max_length(8);
        let mut buf = BytesMut::from(&b"12345678\n"[..]);

        assert_eq!(decode_all(&mut codec, &mut buf), vec!["12345678"]);
    }

    #[test]
    fn encode_appends_delimiter_once() {
        let mut codec = LinesCodec::default();
        let mut buf = BytesMut::new();

        codec.encode("PING".to_string(), &mut buf).unwrap();
        codec.encode("WELCOME\n".to_string(), &mut buf).unwrap();

        assert_eq!(&buf[..], b"PING\nWELCOME\n");
    }
}
