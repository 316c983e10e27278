use crate::traits::ByteStream;
use crate::types::{AggregatorError, Clip, Result, StreamConfig};
use bytes::BytesMut;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::codec::Decoder;
use tracing::debug;

/// How much of a bad line to keep in the error message.
const LINE_PREVIEW_CHARS: usize = 120;

/// Splits the newline-delimited clip stream into batches.
///
/// Each complete line must be a JSON array of clips. Blank lines are skipped.
/// A trailing line without `\n` is only parsed at end of stream.
#[derive(Debug, Clone)]
pub struct ClipLineCodec {
    max_line_bytes: usize,
    /// Bytes already scanned for `\n`, so a long line isn't rescanned on every read.
    scanned: usize,
}

impl ClipLineCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            scanned: 0,
        }
    }

    fn parse_line(line: &[u8]) -> Result<Option<Vec<Clip>>> {
        let line = trim_ascii(line);
        if line.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice::<Vec<Clip>>(line)
            .map(Some)
            .map_err(|source| AggregatorError::StreamParse {
                line: String::from_utf8_lossy(line).chars().take(LINE_PREVIEW_CHARS).collect(),
                source,
            })
    }
}

impl Default for ClipLineCodec {
    fn default() -> Self {
        Self::new(StreamConfig::default().max_line_bytes)
    }
}

impl Decoder for ClipLineCodec {
    type Item = Vec<Clip>;
    type Error = AggregatorError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let newline = src[self.scanned..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                self.scanned = src.len();
                if src.len() > self.max_line_bytes {
                    return Err(AggregatorError::LineTooLong {
                        limit: self.max_line_bytes,
                    });
                }
                return Ok(None);
            };

            let line_len = self.scanned + offset;
            if line_len > self.max_line_bytes {
                return Err(AggregatorError::LineTooLong {
                    limit: self.max_line_bytes,
                });
            }

            let line = src.split_to(line_len + 1);
            self.scanned = 0;
            if let Some(batch) = Self::parse_line(&line)? {
                return Ok(Some(batch));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(batch) = self.decode(src)? {
            return Ok(Some(batch));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        self.scanned = 0;
        Self::parse_line(&rest)
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

struct DecodeState {
    bytes: ByteStream,
    codec: ClipLineCodec,
    buffer: BytesMut,
    done: bool,
}

/// Turn a raw byte stream into clip batches as lines complete.
///
/// Partial lines are carried across reads. The stream ends after the first
/// error.
pub fn decode_batches(bytes: ByteStream, max_line_bytes: usize) -> BoxStream<'static, Result<Vec<Clip>>> {
    let state = DecodeState {
        bytes,
        codec: ClipLineCodec::new(max_line_bytes),
        buffer: BytesMut::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.codec.decode(&mut state.buffer) {
                Ok(Some(batch)) => return Some((Ok(batch), state)),
                Ok(None) => {}
                Err(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    debug!("Read {} bytes from clip stream", chunk.len());
                    state.buffer.extend_from_slice(&chunk);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    return match state.codec.decode_eof(&mut state.buffer) {
                        Ok(Some(batch)) => Some((Ok(batch), state)),
                        Ok(None) => None,
                        Err(e) => Some((Err(e), state)),
                    };
                }
            }
        }
    })
    .boxed()
}
