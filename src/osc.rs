//! OSC 1.0 message encoder and decoder
//!
//! Layout of a message packet:
//! ```text
//! address   - UTF-8, NUL terminated, padded to a multiple of 4 bytes
//! type tags - ',' followed by one tag per argument, NUL terminated, padded
//! arguments - big-endian, each a multiple of 4 bytes
//! ```
//!
//! Tags written: `i` (int32) and `f` (float32). Tags read: `i f d h s T F`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::RelayError;
use crate::protocol::EventValue;

const TAG_INT32: u8 = b'i';
const TAG_FLOAT32: u8 = b'f';
const TAG_FLOAT64: u8 = b'd';
const TAG_INT64: u8 = b'h';
const TAG_STRING: u8 = b's';
const TAG_TRUE: u8 = b'T';
const TAG_FALSE: u8 = b'F';

/// A decoded OSC argument
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Bool(bool),
}

impl std::fmt::Display for OscArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OscArg::Int(v) => write!(f, "{v}"),
            OscArg::Long(v) => write!(f, "{v}"),
            OscArg::Float(v) => write!(f, "{v:.3}"),
            OscArg::Double(v) => write!(f, "{v:.3}"),
            OscArg::Str(v) => write!(f, "{v:?}"),
            OscArg::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// A single OSC message (bundles are not produced by the relay)
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>, args: Vec<OscArg>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// Build the message a relayed event forwards as.
    pub fn from_event(address: &str, value: &EventValue) -> Self {
        let args = match value {
            EventValue::Int(v) => vec![OscArg::Int(*v)],
            EventValue::Float(v) => vec![OscArg::Float(*v as f32)],
            EventValue::List(vs) => vs.iter().map(|v| OscArg::Float(*v as f32)).collect(),
        };
        Self::new(address, args)
    }

    pub fn encode(&self) -> Result<Bytes, RelayError> {
        validate_address(&self.address)?;

        let mut buf = BytesMut::with_capacity(padded_len(self.address.len()) + 16);
        put_padded_str(&mut buf, &self.address);

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        for arg in &self.args {
            tags.push(match arg {
                OscArg::Int(_) => 'i',
                OscArg::Long(_) => 'h',
                OscArg::Float(_) => 'f',
                OscArg::Double(_) => 'd',
                OscArg::Str(_) => 's',
                OscArg::Bool(true) => 'T',
                OscArg::Bool(false) => 'F',
            });
        }
        put_padded_str(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                OscArg::Int(v) => buf.put_i32(*v),
                OscArg::Long(v) => buf.put_i64(*v),
                OscArg::Float(v) => buf.put_f32(*v),
                OscArg::Double(v) => buf.put_f64(*v),
                OscArg::Str(s) => put_padded_str(&mut buf, s),
                OscArg::Bool(_) => {}
            }
        }

        Ok(buf.freeze())
    }

    pub fn decode(packet: &[u8]) -> Result<Self, RelayError> {
        let mut buf = Bytes::copy_from_slice(packet);

        let address = take_padded_str(&mut buf)?;
        validate_address(&address)?;

        // A missing type tag string is tolerated by old senders: no arguments.
        if !buf.has_remaining() {
            return Ok(Self::new(address, Vec::new()));
        }

        let tags = take_padded_str(&mut buf)?;
        let tags = tags
            .strip_prefix(',')
            .ok_or_else(|| RelayError::Encode(format!("type tag string {tags:?} lacks ','")))?;

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.bytes() {
            let arg = match tag {
                TAG_INT32 => OscArg::Int(need(&buf, 4).map(|_| buf.get_i32())?),
                TAG_FLOAT32 => OscArg::Float(need(&buf, 4).map(|_| buf.get_f32())?),
                TAG_INT64 => OscArg::Long(need(&buf, 8).map(|_| buf.get_i64())?),
                TAG_FLOAT64 => OscArg::Double(need(&buf, 8).map(|_| buf.get_f64())?),
                TAG_STRING => OscArg::Str(take_padded_str(&mut buf)?),
                TAG_TRUE => OscArg::Bool(true),
                TAG_FALSE => OscArg::Bool(false),
                other => {
                    return Err(RelayError::Encode(format!(
                        "unsupported type tag '{}'",
                        other as char
                    )))
                }
            };
            args.push(arg);
        }

        Ok(Self::new(address, args))
    }
}

/// Encode a relayed `(address, value)` pair as an OSC packet.
pub fn encode_event(address: &str, value: &EventValue) -> Result<Bytes, RelayError> {
    OscMessage::from_event(address, value).encode()
}

pub fn validate_address(address: &str) -> Result<(), RelayError> {
    if !address.starts_with('/') {
        return Err(RelayError::Encode(format!(
            "address {address:?} must start with '/'"
        )));
    }
    if address.bytes().any(|b| b == 0 || b == b' ' || b == b'#') {
        return Err(RelayError::Encode(format!(
            "address {address:?} contains a reserved character"
        )));
    }
    Ok(())
}

fn padded_len(len: usize) -> usize {
    // string + at least one NUL, rounded up to 4
    (len + 4) & !3
}

fn put_padded_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    let pad = padded_len(s.len()) - s.len();
    buf.put_bytes(0, pad);
}

fn take_padded_str(buf: &mut Bytes) -> Result<String, RelayError> {
    let nul = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| RelayError::Encode("unterminated string".into()))?;
    let total = padded_len(nul);
    need(buf, total)?;

    let raw = buf.split_to(total);
    if raw[nul..].iter().any(|b| *b != 0) {
        return Err(RelayError::Encode("bad string padding".into()));
    }
    String::from_utf8(raw[..nul].to_vec())
        .map_err(|e| RelayError::Encode(format!("string is not UTF-8: {e}")))
}

fn need(buf: &Bytes, n: usize) -> Result<(), RelayError> {
    if buf.remaining() < n {
        return Err(RelayError::Encode(format!(
            "truncated packet: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}
