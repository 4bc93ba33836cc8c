//! Line codec for the control channel
//!
//! TCP delivers a byte stream, so a line is only acted on once its `\n`
//! has arrived; partial lines stay buffered across reads.

use crate::messages::ControlLine;
use crate::MAX_LINE_LENGTH;
use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Codec errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Newline-delimited control line codec
#[derive(Debug, Clone)]
pub struct ControlCodec {
    max_length: usize,
    /// Set while skipping the tail of an over-long line
    discarding: bool,
    /// Offset already scanned for a newline
    next_index: usize,
}

impl ControlCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            discarding: false,
            next_index: 0,
        }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlLine;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlLine>, ProtocolError> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    // Drop the rest of the over-long line and resume normal framing
                    let _ = src.split_to(end + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) if end > self.max_length => {
                    debug!(
                        "Control line exceeds {} bytes, discarding it",
                        self.max_length
                    );
                    let _ = src.split_to(end + 1);
                    self.next_index = 0;
                    return Ok(Some(ControlLine::Unknown(String::new())));
                }
                (false, Some(end)) => {
                    let line = src.split_to(end + 1);
                    self.next_index = 0;
                    let text = String::from_utf8_lossy(&line[..end]);
                    return Ok(Some(ControlLine::parse(&text)));
                }
                (false, None) if src.len() > self.max_length => {
                    debug!(
                        "Control line exceeds {} bytes, discarding until newline",
                        self.max_length
                    );
                    src.clear();
                    self.discarding = true;
                    self.next_index = 0;
                    return Ok(Some(ControlLine::Unknown(String::new())));
                }
                (false, None) => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ControlLine>, ProtocolError> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                // An unterminated trailing line is never interpreted
                src.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<ControlLine> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: ControlLine, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let line = item.to_string();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Target;

    #[test]
    fn test_decode_partial_line_is_retained() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from("TUNNEL:abcd:127.0.0.1:90");

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), "TUNNEL:abcd:127.0.0.1:90".len());

        buf.extend_from_slice(b"01\n");
        let line = codec.decode(&mut buf).unwrap();
        assert_eq!(
            line,
            Some(ControlLine::register("abcd", Target::new("127.0.0.1", 9001)))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_lines_in_one_read() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from("PONG\r\nnoise\nTUNNEL:abcd:h:1\nPI");

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ControlLine::Pong));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlLine::Unknown("noise".to_string()))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlLine::register("abcd", Target::new("h", 1)))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"PI");
    }

    #[test]
    fn test_decode_overlong_line_is_skipped() {
        let mut codec = ControlCodec::with_max_length(8);
        let mut buf = BytesMut::from("0123456789abc");

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlLine::Unknown(String::new()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"still-junk\nPING\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ControlLine::Ping));
    }

    #[test]
    fn test_decode_overlong_line_in_one_read_is_skipped() {
        let mut codec = ControlCodec::with_max_length(16);
        let mut buf = BytesMut::from("TUNNEL:abcd:averyveryverylonghost:9000\nPING\n");

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlLine::Unknown(String::new()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ControlLine::Ping));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_line_at_limit_is_accepted() {
        let mut codec = ControlCodec::with_max_length(15);
        let mut buf = BytesMut::from("TUNNEL:abcd:h:1\n");

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlLine::register("abcd", Target::new("h", 1)))
        );
    }

    #[test]
    fn test_decode_eof_drops_unterminated_line() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from("OK\nTUNNEL:abcd:h");

        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(ControlLine::Ok));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(ControlLine::Ping, &mut buf).unwrap();
        codec
            .encode(ControlLine::register("abcd", Target::new("h", 1)), &mut buf)
            .unwrap();

        assert_eq!(&buf[..], b"PING\nTUNNEL:abcd:h:1\n");
    }
}
