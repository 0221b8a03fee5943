//! Line codecs for worker communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization.
//! Every frame is one UTF-8 line terminated by `\n`. Decoding never ends the
//! stream on a bad line: the line is surfaced as [`MalformedLine`] so the
//! caller can still consume exactly one pending request per reply line.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Default upper bound for a single line (1 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// A reply line that could not be turned into a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedLine {
    #[error("invalid JSON ({error}): {line}")]
    InvalidJson { line: String, error: String },
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("line exceeds {max} bytes")]
    TooLong { max: usize },
}

/// Codec that frames messages as newline-delimited JSON.
///
/// Wraps LinesCodec and adds serde_json serialization.
pub struct JsonLineCodec<T> {
    inner: LinesCodec,
    max_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
            _phantom: PhantomData,
        }
    }

    fn parse(&self, decoded: Result<Option<String>, LinesCodecError>) -> DecodeStep<T>
    where
        T: DeserializeOwned,
    {
        match decoded {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    return DecodeStep::Skip;
                }
                match serde_json::from_str(&line) {
                    Ok(item) => DecodeStep::Frame(Ok(item)),
                    Err(e) => DecodeStep::Frame(Err(MalformedLine::InvalidJson {
                        line,
                        error: e.to_string(),
                    })),
                }
            }
            Ok(None) => DecodeStep::NeedMore,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                DecodeStep::Frame(Err(MalformedLine::TooLong {
                    max: self.max_length,
                }))
            }
            // LinesCodec splits the line off the buffer before checking UTF-8,
            // so the stream stays aligned on the next line.
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                DecodeStep::Frame(Err(MalformedLine::InvalidUtf8))
            }
            Err(LinesCodecError::Io(e)) => DecodeStep::Fail(e),
        }
    }
}

enum DecodeStep<T> {
    Frame(Result<T, MalformedLine>),
    Skip,
    NeedMore,
    Fail(io::Error),
}

impl<T: DeserializeOwned> Decoder for JsonLineCodec<T> {
    type Item = Result<T, MalformedLine>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let decoded = self.inner.decode(src);
            match self.parse(decoded) {
                DecodeStep::Frame(frame) => return Ok(Some(frame)),
                DecodeStep::Skip => continue,
                DecodeStep::NeedMore => return Ok(None),
                DecodeStep::Fail(e) => return Err(e),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let decoded = self.inner.decode_eof(src);
            match self.parse(decoded) {
                DecodeStep::Frame(frame) => return Ok(Some(frame)),
                DecodeStep::Skip => continue,
                DecodeStep::NeedMore => return Ok(None),
                DecodeStep::Fail(e) => return Err(e),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Compact serde_json output never contains a raw newline, so one
        // value is always exactly one line.
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding line");
        if json_len > 100_000 {
            tracing::debug!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large line being encoded"
            );
        }
        dst.reserve(json_len + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Codec for free-form diagnostic lines (worker stderr).
///
/// Overlong lines are truncated instead of ending the stream, and invalid
/// UTF-8 is replaced lossily.
pub struct LogLineCodec {
    max_length: usize,
}

impl Default for LogLineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LogLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    fn take_line(&self, src: &mut BytesMut, eof: bool) -> Option<String> {
        match src.iter().position(|b| *b == b'\n') {
            Some(idx) => {
                let line = src.split_to(idx + 1);
                Some(self.render(&line[..idx]))
            }
            None if eof && !src.is_empty() => {
                let line = src.split_to(src.len());
                Some(self.render(&line))
            }
            None if src.len() > self.max_length => {
                let line = src.split_to(self.max_length);
                Some(self.render(&line))
            }
            None => None,
        }
    }

    fn render(&self, bytes: &[u8]) -> String {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        let bytes = &bytes[..bytes.len().min(self.max_length)];
        String::from_utf8_lossy(bytes).into_owned()
    }
}

impl Decoder for LogLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.take_line(src, false))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.take_line(src, true))
    }
}
