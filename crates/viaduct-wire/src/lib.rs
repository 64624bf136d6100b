// Wire format for the gateway's client streams: framing plus the tagged
// message unions carried on each stream direction.
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const MAGIC: u32 = 0x56494131;
pub const VERSION: u16 = 1;

// Frame tags carried in the header flags field.
pub const FLAG_START_CONSUME: u16 = 0x01;
pub const FLAG_CONFIRMATION: u16 = 0x02;
pub const FLAG_START_PUBLISH: u16 = 0x03;
pub const FLAG_MESSAGE: u16 = 0x04;
pub const FLAG_ERROR: u16 = 0x05;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("unrecognized frame tag {0:#06x}")]
    UnknownTag(u16),
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    // Create a header with the current protocol constants.
    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Always encode in network byte order for portability.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..6].copy_from_slice(&self.version.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags.to_be_bytes());
        out[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use viaduct_wire::{FLAG_MESSAGE, Frame};
///
/// let frame = Frame::new(FLAG_MESSAGE, Bytes::from_static(b"hello")).expect("frame");
/// let encoded = frame.encode();
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if payload.len() > u32::MAX as usize {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        // Pre-allocate the exact size to avoid reallocation.
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        // Split header and payload based on the declared length.
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }
}

// Length-prefixed field helpers shared by the message codecs. Strings and
// byte fields carry a u32 length; optional fields carry a presence byte.

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| Error::FrameTooLarge)?;
    buf.put_u32(len);
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    put_len(buf, value.len())?;
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<()> {
    put_len(buf, value.len())?;
    buf.put_slice(value);
    Ok(())
}

fn put_opt_str(buf: &mut BytesMut, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_str(buf, value)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_opt_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            buf.put_u64(value);
        }
        None => buf.put_u8(0),
    }
}

fn get_bytes(buf: &mut Bytes, what: &'static str) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(Error::MalformedPayload(what));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::MalformedPayload(what));
    }
    Ok(buf.split_to(len))
}

fn get_str(buf: &mut Bytes, what: &'static str) -> Result<String> {
    let raw = get_bytes(buf, what)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::MalformedPayload(what))
}

fn get_opt_str(buf: &mut Bytes, what: &'static str) -> Result<Option<String>> {
    if buf.remaining() < 1 {
        return Err(Error::MalformedPayload(what));
    }
    match buf.get_u8() {
        0 => Ok(None),
        1 => get_str(buf, what).map(Some),
        _ => Err(Error::MalformedPayload(what)),
    }
}

fn get_opt_u64(buf: &mut Bytes, what: &'static str) -> Result<Option<u64>> {
    if buf.remaining() < 1 {
        return Err(Error::MalformedPayload(what));
    }
    match buf.get_u8() {
        0 => Ok(None),
        1 => {
            if buf.remaining() < 8 {
                return Err(Error::MalformedPayload(what));
            }
            Ok(Some(buf.get_u64()))
        }
        _ => Err(Error::MalformedPayload(what)),
    }
}

fn expect_drained(buf: &Bytes, what: &'static str) -> Result<()> {
    if buf.has_remaining() {
        return Err(Error::MalformedPayload(what));
    }
    Ok(())
}

/// A broker message: an opaque payload plus the broker-assigned id. The
/// remaining metadata fields are forwarded verbatim and never interpreted by
/// the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub data: Bytes,
    pub key: Option<String>,
    pub timestamp_ms: Option<u64>,
    pub topic: Option<String>,
}

impl Message {
    pub fn new(id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
            key: None,
            timestamp_ms: None,
            topic: None,
        }
    }

    pub fn encode(&self) -> Result<Frame> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.id)?;
        put_bytes(&mut buf, &self.data)?;
        put_opt_str(&mut buf, self.key.as_deref())?;
        put_opt_u64(&mut buf, self.timestamp_ms);
        put_opt_str(&mut buf, self.topic.as_deref())?;
        Frame::new(FLAG_MESSAGE, buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let id = get_str(&mut payload, "message")?;
        let data = get_bytes(&mut payload, "message")?;
        let key = get_opt_str(&mut payload, "message")?;
        let timestamp_ms = get_opt_u64(&mut payload, "message")?;
        let topic = get_opt_str(&mut payload, "message")?;
        expect_drained(&payload, "message")?;
        Ok(Self {
            id,
            data,
            key,
            timestamp_ms,
            topic,
        })
    }
}

/// Client acknowledgment of a previously delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub msg_id: String,
}

impl Confirmation {
    pub fn new(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
        }
    }

    pub fn encode(&self) -> Result<Frame> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.msg_id)?;
        Frame::new(FLAG_CONFIRMATION, buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let msg_id = get_str(&mut payload, "confirmation")?;
        expect_drained(&payload, "confirmation")?;
        Ok(Self { msg_id })
    }
}

/// First frame of a consume stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartConsumeRequest {
    pub topic: String,
    pub consumer: String,
}

impl StartConsumeRequest {
    pub fn encode(&self) -> Result<Frame> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.topic)?;
        put_str(&mut buf, &self.consumer)?;
        Frame::new(FLAG_START_CONSUME, buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let topic = get_str(&mut payload, "start_consume")?;
        let consumer = get_str(&mut payload, "start_consume")?;
        expect_drained(&payload, "start_consume")?;
        Ok(Self { topic, consumer })
    }
}

/// First frame of a publish stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPublishRequest {
    pub topic: String,
}

impl StartPublishRequest {
    pub fn encode(&self) -> Result<Frame> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.topic)?;
        Frame::new(FLAG_START_PUBLISH, buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let topic = get_str(&mut payload, "start_publish")?;
        expect_drained(&payload, "start_publish")?;
        Ok(Self { topic })
    }
}

/// Status category attached to terminal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
    Unknown,
}

impl Code {
    pub fn as_u8(self) -> u8 {
        match self {
            Code::InvalidArgument => 1,
            Code::FailedPrecondition => 2,
            Code::Unimplemented => 3,
            Code::Internal => 4,
            Code::Unavailable => 5,
            Code::Unknown => 0,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Code::InvalidArgument,
            2 => Code::FailedPrecondition,
            3 => Code::Unimplemented,
            4 => Code::Internal,
            5 => Code::Unavailable,
            // Codes from newer peers decode to Unknown rather than failing.
            _ => Code::Unknown,
        }
    }
}

/// Terminal status written to the client before the server closes a failed
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: Code,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Frame> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.code.as_u8());
        put_str(&mut buf, &self.message)?;
        Frame::new(FLAG_ERROR, buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 1 {
            return Err(Error::MalformedPayload("error"));
        }
        let code = Code::from_u8(payload.get_u8());
        let message = get_str(&mut payload, "error")?;
        expect_drained(&payload, "error")?;
        Ok(Self { code, message })
    }
}

/// Frames a client may send on a consume stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerRequest {
    Start(StartConsumeRequest),
    Confirmation(Confirmation),
}

impl ConsumerRequest {
    pub fn decode(frame: &Frame) -> Result<Self> {
        match frame.header.flags {
            FLAG_START_CONSUME => {
                StartConsumeRequest::decode(frame.payload.clone()).map(Self::Start)
            }
            FLAG_CONFIRMATION => Confirmation::decode(frame.payload.clone()).map(Self::Confirmation),
            tag => Err(Error::UnknownTag(tag)),
        }
    }
}

/// Frames a client may send on a publish stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerRequest {
    Start(StartPublishRequest),
    Message(Message),
}

impl ProducerRequest {
    pub fn decode(frame: &Frame) -> Result<Self> {
        match frame.header.flags {
            FLAG_START_PUBLISH => {
                StartPublishRequest::decode(frame.payload.clone()).map(Self::Start)
            }
            FLAG_MESSAGE => Message::decode(frame.payload.clone()).map(Self::Message),
            tag => Err(Error::UnknownTag(tag)),
        }
    }
}
