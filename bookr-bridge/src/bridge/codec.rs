//! Framed codec for the nested line protocol.
//!
//! Works over any AsyncRead/AsyncWrite (child pipes, in-memory duplex streams).
//! The same codec serves both ends of the pipe: the parent encodes
//! [`ControlRequest`]s and decodes response [`Record`]s, a child does the reverse.
//!
//! Decoding is incremental. The codec remembers how much of the read buffer it
//! has already parsed, so a large frame arriving over many reads is parsed
//! line by line exactly once.

use std::io;
use std::marker::PhantomData;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{
    CLOSE_LIST, CLOSE_RECORD, ControlRequest, END_OF_FRAME, OPEN_LIST, OPEN_RECORD,
    ProtocolError, QUIT, validate_response,
};
use crate::value::{Record, Value};

/// Longest line accepted from the peer, terminator excluded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;
/// Deepest `{`/`[` nesting accepted from the peer.
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_line_length: usize,
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// First complete line of `buf`, with its `\n` (and any trailing `\r`)
/// stripped, plus its length on the wire.
///
/// `scanned` bytes are already known to hold no `\n`.
fn next_line(buf: &[u8], scanned: usize, limits: Limits) -> io::Result<Option<(&str, usize)>> {
    let Some(len) = buf[scanned..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| scanned + i)
    else {
        if buf.len() > limits.max_line_length {
            return Err(line_too_long(limits));
        }
        return Ok(None);
    };
    if len > limits.max_line_length {
        return Err(line_too_long(limits));
    }

    let line = std::str::from_utf8(&buf[..len]).map_err(|e| invalid(e.to_string()))?;
    Ok(Some((line.trim_end_matches('\r'), len + 1)))
}

fn line_too_long(limits: Limits) -> io::Error {
    invalid(format!("line exceeds {} bytes", limits.max_line_length))
}

/// Container still waiting for its closing line.
#[derive(Debug)]
enum Open {
    Record {
        record: Record,
        end: &'static str,
        field: Option<String>,
    },
    List(Vec<Value>),
}

impl Open {
    fn record(end: &'static str) -> Self {
        Self::Record {
            record: Record::new(),
            end,
            field: None,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Self::Record { record, .. } => Value::Record(record),
            Self::List(items) => Value::List(items),
        }
    }
}

/// Push parser for nested values, fed one line at a time.
///
/// Inside a record, lines alternate between a field name and its value until
/// the record's end line. Inside a list, values repeat until the `]` scalar.
/// A value line of `{` or `[` opens a container; anything else is a scalar.
#[derive(Debug)]
pub struct ValueParser {
    stack: Vec<Open>,
    /// Containers that were open before the first line (not counted as depth).
    base: usize,
    max_depth: usize,
}

impl ValueParser {
    /// Parser for one value: a bare scalar, `{...}` or `[...]`.
    pub fn value(max_depth: usize) -> Self {
        Self {
            stack: Vec::new(),
            base: 0,
            max_depth,
        }
    }

    /// Parser for a record body with no opening marker, closed by `end`.
    pub fn record(end: &'static str, max_depth: usize) -> Self {
        Self {
            stack: vec![Open::record(end)],
            base: 1,
            max_depth,
        }
    }

    /// Feed the next line. Returns the value once its last line is seen.
    pub fn push_line(&mut self, line: &str) -> io::Result<Option<Value>> {
        let closes = match self.stack.last_mut() {
            Some(Open::Record { end, field, .. }) if field.is_none() => {
                if line != *end {
                    *field = Some(line.to_string());
                    return Ok(None);
                }
                true
            }
            Some(Open::List(_)) => line == CLOSE_LIST,
            _ => false,
        };
        if closes && let Some(open) = self.stack.pop() {
            return Ok(self.complete(open.into_value()));
        }

        match line {
            OPEN_RECORD => self.open(Open::record(CLOSE_RECORD)),
            OPEN_LIST => self.open(Open::List(Vec::new())),
            scalar => Ok(self.complete(Value::Scalar(scalar.to_string()))),
        }
    }

    fn open(&mut self, container: Open) -> io::Result<Option<Value>> {
        if self.stack.len() - self.base >= self.max_depth {
            return Err(invalid(format!(
                "nesting deeper than {} levels",
                self.max_depth
            )));
        }
        self.stack.push(container);
        Ok(None)
    }

    /// Attach a finished value to its parent, or hand it out at the root.
    fn complete(&mut self, value: Value) -> Option<Value> {
        match self.stack.last_mut() {
            None => Some(value),
            Some(Open::Record { record, field, .. }) => {
                if let Some(field) = field.take() {
                    record.insert(field, value);
                }
                None
            }
            Some(Open::List(items)) => {
                items.push(value);
                None
            }
        }
    }
}

/// A complete message on the wire: an optional id line, then a record body
/// closed by an empty line.
pub trait Frame: Sized {
    /// Whether the body is preceded by an id line.
    const HAS_ID: bool;

    fn from_parts(id: Option<String>, body: Record) -> Self;
    fn write_frame(&self, dst: &mut BytesMut) -> Result<(), ProtocolError>;
}

/// Response envelope: a record closed by an empty line.
impl Frame for Record {
    const HAS_ID: bool = false;

    fn from_parts(_id: Option<String>, body: Record) -> Self {
        body
    }

    fn write_frame(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        validate_response(self)?;
        put_record_body(dst, self);
        put_line(dst, END_OF_FRAME);
        Ok(())
    }
}

impl Frame for ControlRequest {
    const HAS_ID: bool = true;

    fn from_parts(id: Option<String>, body: Record) -> Self {
        match id {
            Some(id) if id == QUIT => ControlRequest::Quit,
            id => ControlRequest::call(id.unwrap_or_default(), body),
        }
    }

    fn write_frame(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.validate()?;
        put_line(dst, self.id());
        if let ControlRequest::Call { payload, .. } = self {
            put_record_body(dst, payload);
        }
        put_line(dst, END_OF_FRAME);
        Ok(())
    }
}

/// Frame being assembled across `decode` calls.
#[derive(Debug)]
struct PartialFrame {
    wants_id: bool,
    id: Option<String>,
    body: ValueParser,
}

impl PartialFrame {
    fn new<T: Frame>(limits: Limits) -> Self {
        Self {
            wants_id: T::HAS_ID,
            id: None,
            body: ValueParser::record(END_OF_FRAME, limits.max_depth),
        }
    }

    fn push_line(&mut self, line: &str) -> io::Result<Option<(Option<String>, Record)>> {
        if self.wants_id && self.id.is_none() {
            self.id = Some(line.to_string());
            return Ok(None);
        }
        let body = self.body.push_line(line)?.and_then(Value::into_record);
        Ok(body.map(|body| (self.id.take(), body)))
    }
}

fn put_line(dst: &mut BytesMut, line: &str) {
    dst.reserve(line.len() + 1);
    dst.put_slice(line.as_bytes());
    dst.put_u8(b'\n');
}

fn put_record_body(dst: &mut BytesMut, record: &Record) {
    for (field, value) in record {
        put_line(dst, field);
        put_value(dst, value);
    }
}

fn put_value(dst: &mut BytesMut, value: &Value) {
    match value {
        Value::Scalar(s) => put_line(dst, s),
        Value::Record(record) => {
            put_line(dst, OPEN_RECORD);
            put_record_body(dst, record);
            put_line(dst, CLOSE_RECORD);
        }
        Value::List(items) => {
            put_line(dst, OPEN_LIST);
            for item in items {
                put_value(dst, item);
            }
            put_line(dst, CLOSE_LIST);
        }
    }
}

/// Codec that frames [`Frame`] messages as nested lines.
///
/// Bytes stay in the read buffer until a whole frame has been parsed, so the
/// codec must keep seeing the same growing buffer (as `FramedRead` provides).
pub struct LineCodec<T> {
    limits: Limits,
    partial: Option<PartialFrame>,
    /// Buffered bytes already fed to `partial`.
    parsed: usize,
    /// Bytes past `parsed` already searched for `\n`.
    scanned: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for LineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LineCodec<T> {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            limits,
            partial: None,
            parsed: 0,
            scanned: 0,
            _phantom: PhantomData,
        }
    }

    fn reset(&mut self) {
        self.partial = None;
        self.parsed = 0;
        self.scanned = 0;
    }
}

impl<T: Frame> LineCodec<T> {
    fn decode_frame(&mut self, src: &mut BytesMut) -> io::Result<Option<T>> {
        if self.parsed + self.scanned > src.len() {
            // Not the buffer we were parsing; start over.
            self.reset();
        }

        let limits = self.limits;
        let partial = self
            .partial
            .get_or_insert_with(|| PartialFrame::new::<T>(limits));

        loop {
            let Some((line, len)) = next_line(&src[self.parsed..], self.scanned, limits)? else {
                self.scanned = src.len() - self.parsed;
                return Ok(None);
            };
            self.parsed += len;
            self.scanned = 0;

            if let Some((id, body)) = partial.push_line(line)? {
                let used = self.parsed;
                self.reset();
                tracing::trace!(frame_size_bytes = used, "Decoded frame");
                src.advance(used);
                return Ok(Some(T::from_parts(id, body)));
            }
        }
    }
}

impl<T: Frame> Decoder for LineCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let result = self.decode_frame(src);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                self.reset();
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a frame ({} bytes pending)", src.len()),
                ))
            }
        }
    }
}

impl<T: Frame> Encoder<T> for LineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        item.write_frame(dst)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        tracing::trace!(frame_size_bytes = dst.len() - start, "Encoding frame");
        Ok(())
    }
}

/// Decode exactly one value from a complete buffer.
pub fn decode_value(buf: &[u8]) -> io::Result<Value> {
    decode_complete(buf, ValueParser::value(DEFAULT_MAX_DEPTH))
}

/// Decode exactly one response envelope from a complete buffer.
pub fn decode_response(buf: &[u8]) -> io::Result<Record> {
    decode_complete(buf, ValueParser::record(END_OF_FRAME, DEFAULT_MAX_DEPTH))?
        .into_record()
        .ok_or_else(|| invalid("response is not a record"))
}

pub fn encode_request(request: &ControlRequest, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    request.write_frame(dst)
}

fn decode_complete(buf: &[u8], mut parser: ValueParser) -> io::Result<Value> {
    let limits = Limits::default();
    let mut pos = 0;
    while let Some((line, len)) = next_line(&buf[pos..], 0, limits)? {
        pos += len;
        if let Some(value) = parser.push_line(line)? {
            if pos < buf.len() {
                return Err(invalid(format!("{} trailing bytes", buf.len() - pos)));
            }
            return Ok(value);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "input ended inside a value",
    ))
}
