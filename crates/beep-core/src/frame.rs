//! Frame encoding and decoding for the BEEP wire protocol (RFC 3080 §2.2,
//! RFC 3081 §3).
//!
//! A data frame is an ASCII header line, exactly `size` payload octets and the
//! fixed trailer:
//!
//! ```text
//! MSG 1 7 . 4096 12\r\n
//! <12 payload octets>END\r\n
//! ```
//!
//! Header fields always appear in the order type, channel, msgno, more,
//! seqno, size and, for `ANS` only, ansno. Flow-control updates use the
//! trailer-less `SEQ channel ackno window\r\n` line.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, FrameError};

/// Fixed frame trailer
pub const TRAILER: &[u8] = b"END\r\n";

/// Longest legal header line, CRLF included
pub const MAX_HEADER_LEN: usize = 64;

/// Largest channel number, msgno, ansno and size (2^31 - 1)
pub const MAX_NUMBER: u32 = 2_147_483_647;

/// Default cap on a single frame's payload accepted by [`FrameCodec`]
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// BEEP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Request
    Msg,
    /// Positive reply
    Rpy,
    /// Negative reply
    Err,
    /// One of many answers
    Ans,
    /// Terminates a series of answers
    Nul,
}

impl MessageType {
    /// Wire keyword
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Msg => "MSG",
            Self::Rpy => "RPY",
            Self::Err => "ERR",
            Self::Ans => "ANS",
            Self::Nul => "NUL",
        }
    }

    /// True for every type other than MSG
    #[must_use]
    pub fn is_reply(self) -> bool {
        !matches!(self, Self::Msg)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, FrameError> {
        match s {
            "MSG" => Ok(Self::Msg),
            "RPY" => Ok(Self::Rpy),
            "ERR" => Ok(Self::Err),
            "ANS" => Ok(Self::Ans),
            "NUL" => Ok(Self::Nul),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

/// Decoded data-frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message type
    pub message_type: MessageType,
    /// Channel number
    pub channel: u32,
    /// Message number
    pub msgno: u32,
    /// True when more frames of this message follow (`*`)
    pub more: bool,
    /// Sequence number of the first payload octet
    pub seqno: u32,
    /// Payload size
    pub size: u32,
    /// Answer number, present for ANS only
    pub ansno: Option<u32>,
}

impl FrameHeader {
    /// Encode the header line, CRLF included
    #[must_use]
    pub fn build(&self) -> String {
        build_header(self)
    }

    /// Decode a header line (without its CRLF)
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] on wrong token count, unknown type,
    /// non-numeric fields or out-of-range values.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        parse_header(line)
    }
}

/// Encode a header line, CRLF included
#[must_use]
pub fn build_header(header: &FrameHeader) -> String {
    let more = if header.more { '*' } else { '.' };
    match header.ansno {
        Some(ansno) => format!(
            "{} {} {} {} {} {} {}\r\n",
            header.message_type,
            header.channel,
            header.msgno,
            more,
            header.seqno,
            header.size,
            ansno
        ),
        None => format!(
            "{} {} {} {} {} {}\r\n",
            header.message_type, header.channel, header.msgno, more, header.seqno, header.size
        ),
    }
}

/// Decode a header line (without its CRLF)
///
/// # Errors
///
/// Returns a [`FrameError`] describing the first problem found.
pub fn parse_header(line: &str) -> Result<FrameHeader, FrameError> {
    let line = line.strip_suffix("\r\n").unwrap_or(line);
    if !line.is_ascii() {
        return Err(FrameError::NotAscii);
    }

    let tokens: Vec<&str> = line.split(' ').collect();
    let message_type: MessageType = tokens[0].parse()?;

    let expected = if message_type == MessageType::Ans { 7 } else { 6 };
    if tokens.len() != expected {
        return Err(FrameError::TokenCount {
            expected: if expected == 7 { "7" } else { "6" },
            actual: tokens.len(),
        });
    }

    let channel = parse_number("channel", tokens[1], u64::from(MAX_NUMBER))?;
    let msgno = parse_number("msgno", tokens[2], u64::from(MAX_NUMBER))?;
    let more = match tokens[3] {
        "." => false,
        "*" => true,
        other => return Err(FrameError::InvalidMore(other.to_string())),
    };
    let seqno = parse_number("seqno", tokens[4], u64::from(u32::MAX))?;
    let size = parse_number("size", tokens[5], u64::from(MAX_NUMBER))?;
    let ansno = if message_type == MessageType::Ans {
        Some(parse_number("ansno", tokens[6], u64::from(MAX_NUMBER))?)
    } else {
        None
    };

    Ok(FrameHeader {
        message_type,
        channel,
        msgno,
        more,
        seqno,
        size,
        ansno,
    })
}

fn parse_number(field: &'static str, token: &str, max: u64) -> Result<u32, FrameError> {
    // at most 10 digits keeps the u64 accumulation from overflowing
    if token.is_empty() || token.len() > 10 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::NotNumeric {
            field,
            value: token.to_string(),
        });
    }
    let value: u64 = token.bytes().fold(0, |acc, b| acc * 10 + u64::from(b - b'0'));
    if value > max {
        return Err(FrameError::OutOfRange { field, value });
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(value as u32)
}

/// One wire-level transfer unit of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    message_type: MessageType,
    channel: u32,
    msgno: u32,
    ansno: Option<u32>,
    seqno: u32,
    last: bool,
    payload: Vec<Bytes>,
    size: usize,
}

impl Frame {
    /// Create an empty, last frame
    #[must_use]
    pub fn new(message_type: MessageType, channel: u32, msgno: u32, seqno: u32) -> Self {
        Self {
            message_type,
            channel,
            msgno,
            ansno: None,
            seqno,
            last: true,
            payload: Vec::new(),
            size: 0,
        }
    }

    /// Rebuild a frame from a decoded header and its payload
    #[must_use]
    pub fn from_parts(header: FrameHeader, payload: Bytes) -> Self {
        let mut frame = Self::new(header.message_type, header.channel, header.msgno, header.seqno);
        frame.ansno = header.ansno;
        frame.last = !header.more;
        frame.add_payload(payload);
        frame
    }

    /// Append a payload chunk
    pub fn add_payload(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.size += chunk.len();
        self.payload.push(chunk);
    }

    /// Message type
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Channel number
    #[must_use]
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Message number
    #[must_use]
    pub fn msgno(&self) -> u32 {
        self.msgno
    }

    /// Answer number (ANS only)
    #[must_use]
    pub fn ansno(&self) -> Option<u32> {
        self.ansno
    }

    /// Sequence number of the first payload octet
    #[must_use]
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    /// True when this is the final frame of its message
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Mark the frame as final (or not)
    pub fn set_last(&mut self, last: bool) {
        self.last = last;
    }

    /// Set the answer number
    pub fn set_ansno(&mut self, ansno: Option<u32>) {
        self.ansno = ansno;
    }

    /// Sum of the payload chunk lengths
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Payload chunks in order
    #[must_use]
    pub fn payload(&self) -> &[Bytes] {
        &self.payload
    }

    /// Take the payload chunks out of the frame
    #[must_use]
    pub fn into_payload(self) -> Vec<Bytes> {
        self.payload
    }

    /// Payload as one contiguous buffer
    #[must_use]
    pub fn payload_bytes(&self) -> Bytes {
        match self.payload.as_slice() {
            [] => Bytes::new(),
            [one] => one.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(self.size);
                for chunk in many {
                    buf.extend_from_slice(chunk);
                }
                buf.freeze()
            }
        }
    }

    /// Header describing this frame
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            message_type: self.message_type,
            channel: self.channel,
            msgno: self.msgno,
            more: !self.last,
            seqno: self.seqno,
            size: self.size as u32,
            ansno: self.ansno,
        }
    }

    /// Append header, payload and trailer to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        let header = self.header().build();
        dst.reserve(header.len() + self.size + TRAILER.len());
        dst.put_slice(header.as_bytes());
        for chunk in &self.payload {
            dst.put_slice(chunk);
        }
        dst.put_slice(TRAILER);
    }
}

/// Builder for outbound data frames
#[derive(Debug, Default)]
pub struct FrameBuilder {
    message_type: Option<MessageType>,
    channel: u32,
    msgno: u32,
    ansno: Option<u32>,
    seqno: u32,
    more: bool,
    payload: Vec<Bytes>,
}

impl FrameBuilder {
    /// Create a new frame builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message type
    #[must_use]
    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    /// Set the channel number
    #[must_use]
    pub fn channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    /// Set the message number
    #[must_use]
    pub fn msgno(mut self, msgno: u32) -> Self {
        self.msgno = msgno;
        self
    }

    /// Set the answer number
    #[must_use]
    pub fn ansno(mut self, ansno: u32) -> Self {
        self.ansno = Some(ansno);
        self
    }

    /// Set the sequence number
    #[must_use]
    pub fn seqno(mut self, seqno: u32) -> Self {
        self.seqno = seqno;
        self
    }

    /// Mark that more frames follow
    #[must_use]
    pub fn more(mut self, more: bool) -> Self {
        self.more = more;
        self
    }

    /// Append a payload chunk
    #[must_use]
    pub fn payload(mut self, data: impl Into<Bytes>) -> Self {
        self.payload.push(data.into());
        self
    }

    /// Build the frame
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::OutOfRange`] if a number exceeds its wire range,
    /// or [`FrameError::TokenCount`] if the answer number does not match the type.
    pub fn build(self) -> Result<Frame, FrameError> {
        let message_type = self.message_type.unwrap_or(MessageType::Msg);
        for (field, value) in [("channel", self.channel), ("msgno", self.msgno)] {
            if value > MAX_NUMBER {
                return Err(FrameError::OutOfRange {
                    field,
                    value: u64::from(value),
                });
            }
        }
        match (message_type, self.ansno) {
            (MessageType::Ans, None) => {
                return Err(FrameError::TokenCount {
                    expected: "7",
                    actual: 6,
                });
            }
            (MessageType::Ans, Some(ansno)) if ansno > MAX_NUMBER => {
                return Err(FrameError::OutOfRange {
                    field: "ansno",
                    value: u64::from(ansno),
                });
            }
            (MessageType::Ans, _) => {}
            (_, Some(_)) => {
                return Err(FrameError::TokenCount {
                    expected: "6",
                    actual: 7,
                });
            }
            (_, None) => {}
        }

        let mut frame = Frame::new(message_type, self.channel, self.msgno, self.seqno);
        frame.ansno = self.ansno;
        frame.last = !self.more;
        for chunk in self.payload {
            frame.add_payload(chunk);
        }
        if frame.size > MAX_NUMBER as usize {
            return Err(FrameError::OutOfRange {
                field: "size",
                value: frame.size as u64,
            });
        }
        Ok(frame)
    }
}

/// RFC 3081 window update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqFrame {
    /// Channel number
    pub channel: u32,
    /// Next sequence number the receiver expects to consume
    pub ackno: u32,
    /// Receive buffer size starting at `ackno`
    pub window: u32,
}

impl SeqFrame {
    /// Encode the SEQ line, CRLF included
    #[must_use]
    pub fn build(&self) -> String {
        format!("SEQ {} {} {}\r\n", self.channel, self.ackno, self.window)
    }

    /// Decode a SEQ line (without its CRLF)
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] if the line is malformed.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let line = line.strip_suffix("\r\n").unwrap_or(line);
        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens[0] != "SEQ" {
            return Err(FrameError::UnknownType(tokens[0].to_string()));
        }
        if tokens.len() != 4 {
            return Err(FrameError::TokenCount {
                expected: "4",
                actual: tokens.len(),
            });
        }
        Ok(Self {
            channel: parse_number("channel", tokens[1], u64::from(MAX_NUMBER))?,
            ackno: parse_number("ackno", tokens[2], u64::from(u32::MAX))?,
            window: parse_number("window", tokens[3], u64::from(MAX_NUMBER))?,
        })
    }
}

/// Anything that travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// MSG/RPY/ERR/ANS/NUL frame
    Data(Frame),
    /// Window update
    Seq(SeqFrame),
}

impl From<Frame> for WireFrame {
    fn from(frame: Frame) -> Self {
        Self::Data(frame)
    }
}

impl From<SeqFrame> for WireFrame {
    fn from(seq: SeqFrame) -> Self {
        Self::Seq(seq)
    }
}

/// Incremental codec for [`WireFrame`]s
///
/// Decoding is strict: any malformed header or trailer is an error and the
/// caller is expected to terminate the session.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default payload limit
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom payload limit
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = WireFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(eol) = src.windows(2).position(|w| w == b"\r\n") else {
            if src.len() >= MAX_HEADER_LEN {
                return Err(FrameError::HeaderTooLong.into());
            }
            return Ok(None);
        };
        if eol + 2 > MAX_HEADER_LEN {
            return Err(FrameError::HeaderTooLong.into());
        }

        let line = std::str::from_utf8(&src[..eol]).map_err(|_| FrameError::NotAscii)?;
        if line.starts_with("SEQ ") {
            let seq = SeqFrame::parse(line)?;
            src.advance(eol + 2);
            return Ok(Some(WireFrame::Seq(seq)));
        }

        let header = parse_header(line)?;
        let size = header.size as usize;
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                max: self.max_frame_size,
            }
            .into());
        }

        let total = eol + 2 + size + TRAILER.len();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(eol + 2);
        let payload = src.split_to(size).freeze();
        if &src[..TRAILER.len()] != TRAILER {
            return Err(FrameError::MissingTrailer.into());
        }
        src.advance(TRAILER.len());

        Ok(Some(WireFrame::Data(Frame::from_parts(header, payload))))
    }
}

impl Encoder<WireFrame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            WireFrame::Data(frame) => frame.encode(dst),
            WireFrame::Seq(seq) => dst.put_slice(seq.build().as_bytes()),
        }
        Ok(())
    }
}
