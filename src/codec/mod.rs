//! C6 — the binary-packed framing used by the interactive channel
//! (spec.md §4.6). Every frame is a MessagePack map with two keys,
//! `"hdr"` and `"body"`; `hdr` is itself a map whose `"props"` entry
//! carries the protocol-specific fields used by the shell and control
//! sub-protocols (spec.md §4.6.2-§4.6.4).
//!
//! This module hand-rolls the encode/decode instead of deriving
//! `serde::Serialize` through `rmp-serde`, because one field —
//! `Properties::offset` — has a hard wire requirement: it MUST be
//! written as a width-prefixed signed 64-bit integer even when the
//! value fits in a smaller representation, since the service's decoder
//! on the other end does not re-widen a compacted integer. `rmp_serde`
//! always picks the most compact msgpack integer encoding for a given
//! value, so the only way to honor that requirement is to call
//! `rmp::encode::write_i64` directly for that one field.

pub mod control;
pub mod shell;

use std::io::Read;

use rmp::decode::{self, DecodeStringError, ValueReadError};
use rmp::encode::{self, ValueWriteError};
use rmp::Marker;

use crate::error::{AgentError, AgentResult};

/// Status code carried in `Properties::status` for a routine
/// request/acknowledgement (spec.md §8 S4: `new`/`stop` replies).
pub const STATUS_NORMAL: u16 = 1;
/// Status code for a control-originated liveness probe (spec.md §4.6.3,
/// §8 S5: the healthcheck's shell-session `ping`).
pub const STATUS_CONTROL: u16 = 3;

/// Protocol identifiers multiplexed over the one channel (spec.md
/// §4.6.2's `proto` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Shell,
    FileTransfer,
    PortForward,
    MenderClient,
    Control,
}

impl Proto {
    pub fn code(self) -> u16 {
        match self {
            Proto::Shell => 0x0001,
            Proto::FileTransfer => 0x0002,
            Proto::PortForward => 0x0003,
            Proto::MenderClient => 0x0004,
            Proto::Control => 0xFFFF,
        }
    }

    pub fn from_code(code: u16) -> AgentResult<Self> {
        match code {
            0x0001 => Ok(Proto::Shell),
            0x0002 => Ok(Proto::FileTransfer),
            0x0003 => Ok(Proto::PortForward),
            0x0004 => Ok(Proto::MenderClient),
            0xFFFF => Ok(Proto::Control),
            other => Err(AgentError::Malformed(format!(
                "unknown protocol code {other}"
            ))),
        }
    }
}

/// The protocol-specific property bag (spec.md §3, §4.6.1). Every field
/// is optional on the wire: a field absent from the map means "not
/// set", distinct from a present field holding a zero or empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub terminal_width: Option<u16>,
    pub terminal_height: Option<u16>,
    pub user_id: Option<String>,
    pub timeout: Option<u32>,
    pub status: Option<u16>,
    pub offset: Option<i64>,
}

impl Properties {
    fn is_empty(&self) -> bool {
        self.terminal_width.is_none()
            && self.terminal_height.is_none()
            && self.user_id.is_none()
            && self.timeout.is_none()
            && self.status.is_none()
            && self.offset.is_none()
    }

    fn field_count(&self) -> u32 {
        [
            self.terminal_width.is_some(),
            self.terminal_height.is_some(),
            self.user_id.is_some(),
            self.timeout.is_some(),
            self.status.is_some(),
            self.offset.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count() as u32
    }
}

/// Frame header (spec.md §4.6.1). `typ` names the sub-protocol message
/// kind (`"new"`, `"shell"`, `"ping"`, `"open"`, `"accept"`, ...); it is
/// a header field on the wire, not part of `props`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub proto: Proto,
    pub typ: Option<String>,
    pub sid: Option<String>,
    pub props: Properties,
}

/// One framed message on the interactive channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub hdr: Header,
    pub body: Option<Vec<u8>>,
}

impl Message {
    pub fn new(
        proto: Proto,
        typ: Option<String>,
        sid: Option<String>,
        props: Properties,
        body: Option<Vec<u8>>,
    ) -> Self {
        Self {
            hdr: Header { proto, typ, sid, props },
            body,
        }
    }
}

fn write_err(e: ValueWriteError) -> AgentError {
    AgentError::MsgPackEncode(format!("{e:?}"))
}

fn read_err(e: impl std::fmt::Debug) -> AgentError {
    AgentError::MsgPackDecode(format!("{e:?}"))
}

/// Encodes `message` to its wire representation.
pub fn encode_message(message: &Message) -> AgentResult<Vec<u8>> {
    let mut out = Vec::new();
    encode::write_map_len(&mut out, if message.body.is_some() { 2 } else { 1 }).map_err(write_err)?;

    encode::write_str(&mut out, "hdr").map_err(write_err)?;
    encode_header(&mut out, &message.hdr)?;

    if let Some(body) = &message.body {
        encode::write_str(&mut out, "body").map_err(write_err)?;
        encode::write_bin(&mut out, body).map_err(write_err)?;
    }
    Ok(out)
}

fn encode_header(out: &mut Vec<u8>, hdr: &Header) -> AgentResult<()> {
    let field_count = 1
        + u32::from(hdr.typ.is_some())
        + u32::from(hdr.sid.is_some())
        + u32::from(!hdr.props.is_empty());
    encode::write_map_len(out, field_count).map_err(write_err)?;

    encode::write_str(out, "proto").map_err(write_err)?;
    encode::write_u16(out, hdr.proto.code()).map_err(write_err)?;

    if let Some(typ) = &hdr.typ {
        encode::write_str(out, "typ").map_err(write_err)?;
        encode::write_str(out, typ).map_err(write_err)?;
    }

    if let Some(sid) = &hdr.sid {
        encode::write_str(out, "sid").map_err(write_err)?;
        encode::write_str(out, sid).map_err(write_err)?;
    }

    if !hdr.props.is_empty() {
        encode::write_str(out, "props").map_err(write_err)?;
        encode_properties(out, &hdr.props)?;
    }
    Ok(())
}

fn encode_properties(out: &mut Vec<u8>, props: &Properties) -> AgentResult<()> {
    encode::write_map_len(out, props.field_count()).map_err(write_err)?;

    if let Some(width) = props.terminal_width {
        encode::write_str(out, "terminal_width").map_err(write_err)?;
        encode::write_u16(out, width).map_err(write_err)?;
    }
    if let Some(height) = props.terminal_height {
        encode::write_str(out, "terminal_height").map_err(write_err)?;
        encode::write_u16(out, height).map_err(write_err)?;
    }
    if let Some(user_id) = &props.user_id {
        encode::write_str(out, "user_id").map_err(write_err)?;
        encode::write_str(out, user_id).map_err(write_err)?;
    }
    if let Some(timeout) = props.timeout {
        encode::write_str(out, "timeout").map_err(write_err)?;
        encode::write_u32(out, timeout).map_err(write_err)?;
    }
    if let Some(status) = props.status {
        encode::write_str(out, "status").map_err(write_err)?;
        encode::write_u16(out, status).map_err(write_err)?;
    }
    if let Some(offset) = props.offset {
        encode::write_str(out, "offset").map_err(write_err)?;
        // Fixed-width, never compacted: see module docs.
        encode::write_i64(out, offset).map_err(write_err)?;
    }
    Ok(())
}

/// Decodes one message from `input`, which must hold exactly one frame
/// (the caller is responsible for delimiting frames on the transport;
/// spec.md §4.6.1 does not specify an outer length prefix beyond the
/// msgpack map markers themselves, which are self-delimiting).
pub fn decode_message(input: &[u8]) -> AgentResult<Message> {
    let mut cursor = input;
    let top_len = decode::read_map_len(&mut cursor).map_err(read_err)?;

    let mut hdr = None;
    let mut body = None;
    for _ in 0..top_len {
        let key = read_str(&mut cursor)?;
        match key.as_str() {
            "hdr" => hdr = Some(decode_header(&mut cursor)?),
            "body" => body = Some(read_bin(&mut cursor)?),
            _ => skip_value(&mut cursor)?,
        }
    }

    let hdr = hdr.ok_or_else(|| AgentError::Malformed("message missing hdr".into()))?;
    Ok(Message { hdr, body })
}

fn decode_header(cursor: &mut &[u8]) -> AgentResult<Header> {
    let len = decode::read_map_len(cursor).map_err(read_err)?;
    let mut proto = None;
    let mut typ = None;
    let mut sid = None;
    let mut props = Properties::default();

    for _ in 0..len {
        let key = read_str(cursor)?;
        match key.as_str() {
            "proto" => {
                let code = decode::read_int(cursor).map_err(read_err)?;
                proto = Some(Proto::from_code(code)?);
            }
            "typ" => typ = Some(read_str(cursor)?),
            "sid" => sid = Some(read_str(cursor)?),
            "props" => props = decode_properties(cursor)?,
            _ => skip_value(cursor)?,
        }
    }

    let proto = proto.ok_or_else(|| AgentError::Malformed("header missing proto".into()))?;
    Ok(Header { proto, typ, sid, props })
}

fn decode_properties(cursor: &mut &[u8]) -> AgentResult<Properties> {
    let len = decode::read_map_len(cursor).map_err(read_err)?;
    let mut props = Properties::default();
    for _ in 0..len {
        let key = read_str(cursor)?;
        match key.as_str() {
            "terminal_width" => props.terminal_width = Some(decode::read_int(cursor).map_err(read_err)?),
            "terminal_height" => props.terminal_height = Some(decode::read_int(cursor).map_err(read_err)?),
            "user_id" => props.user_id = Some(read_str(cursor)?),
            "timeout" => props.timeout = Some(decode::read_int(cursor).map_err(read_err)?),
            "status" => props.status = Some(decode::read_int(cursor).map_err(read_err)?),
            "offset" => props.offset = Some(decode::read_int(cursor).map_err(read_err)?),
            _ => skip_value(cursor)?,
        }
    }
    Ok(props)
}

fn read_str(cursor: &mut &[u8]) -> AgentResult<String> {
    let len = decode::read_str_len(cursor).map_err(|e: DecodeStringError| {
        AgentError::MsgPackDecode(format!("{e:?}"))
    })? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| AgentError::MsgPackDecode(format!("{e:?}")))?;
    String::from_utf8(buf).map_err(|e| AgentError::Malformed(format!("non-utf8 string: {e}")))
}

fn read_bin(cursor: &mut &[u8]) -> AgentResult<Vec<u8>> {
    let len = decode::read_bin_len(cursor).map_err(read_err)? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| AgentError::MsgPackDecode(format!("{e:?}")))?;
    Ok(buf)
}

/// Skips one arbitrary value, used for forward-compatible decoding of
/// maps that carry fields this version does not recognize.
fn skip_value(cursor: &mut &[u8]) -> AgentResult<()> {
    let marker = decode::read_marker(cursor).map_err(|e: ValueReadError| read_err(e))?;
    match marker {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => Ok(()),
        Marker::U8 | Marker::I8 => skip_bytes(cursor, 1),
        Marker::U16 | Marker::I16 => skip_bytes(cursor, 2),
        Marker::U32 | Marker::I32 | Marker::F32 => skip_bytes(cursor, 4),
        Marker::U64 | Marker::I64 | Marker::F64 => skip_bytes(cursor, 8),
        Marker::FixStr(len) => skip_bytes(cursor, len as usize),
        Marker::Str8 | Marker::Bin8 => {
            let len = read_u8(cursor)?;
            skip_bytes(cursor, len as usize)
        }
        Marker::Str16 | Marker::Bin16 => {
            let len = read_u16(cursor)?;
            skip_bytes(cursor, len as usize)
        }
        Marker::Str32 | Marker::Bin32 => {
            let len = read_u32(cursor)?;
            skip_bytes(cursor, len as usize)
        }
        Marker::FixArray(len) => {
            for _ in 0..len {
                skip_value(cursor)?;
            }
            Ok(())
        }
        Marker::FixMap(len) => {
            for _ in 0..(len as u32) * 2 {
                skip_value(cursor)?;
            }
            Ok(())
        }
        other => Err(AgentError::Malformed(format!(
            "unsupported value marker while skipping unknown field: {other:?}"
        ))),
    }
}

fn read_u8(cursor: &mut &[u8]) -> AgentResult<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf).map_err(|e| read_err(e))?;
    Ok(buf[0])
}

fn read_u16(cursor: &mut &[u8]) -> AgentResult<u16> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf).map_err(|e| read_err(e))?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(cursor: &mut &[u8]) -> AgentResult<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(|e| read_err(e))?;
    Ok(u32::from_be_bytes(buf))
}

fn skip_bytes(cursor: &mut &[u8], n: usize) -> AgentResult<()> {
    let mut buf = vec![0u8; n];
    cursor.read_exact(&mut buf).map_err(|e| read_err(e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_control_message_without_body() {
        let msg = Message::new(
            Proto::Control,
            Some("open".to_string()),
            Some("sid-1".to_string()),
            Properties::default(),
            None,
        );
        let wire = encode_message(&msg).unwrap();
        let decoded = decode_message(&wire).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_shell_message_with_body_and_offset() {
        let msg = Message::new(
            Proto::Shell,
            None,
            Some("sid-2".to_string()),
            Properties {
                offset: Some(0),
                ..Default::default()
            },
            Some(b"echo hi".to_vec()),
        );
        let wire = encode_message(&msg).unwrap();
        let decoded = decode_message(&wire).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn offset_is_encoded_as_fixed_width_int64_marker() {
        let msg = Message::new(
            Proto::Shell,
            None,
            None,
            Properties {
                offset: Some(0),
                ..Default::default()
            },
            None,
        );
        let wire = encode_message(&msg).unwrap();
        // Marker::I64 is 0xd3; a compacting encoder would have picked
        // Marker::FixPos(0) (0x00) for this value instead.
        assert!(wire.contains(&0xd3));
    }

    #[test]
    fn absent_properties_differ_from_present_zero() {
        let absent = Message::new(Proto::Shell, None, None, Properties::default(), None);
        let present_zero = Message::new(
            Proto::Shell,
            None,
            None,
            Properties {
                offset: Some(0),
                ..Default::default()
            },
            None,
        );
        assert_ne!(encode_message(&absent).unwrap(), encode_message(&present_zero).unwrap());
    }

    #[test]
    fn protocol_codes_match_the_registry() {
        assert_eq!(Proto::Shell.code(), 0x0001);
        assert_eq!(Proto::FileTransfer.code(), 0x0002);
        assert_eq!(Proto::PortForward.code(), 0x0003);
        assert_eq!(Proto::MenderClient.code(), 0x0004);
        assert_eq!(Proto::Control.code(), 0xFFFF);
    }

    #[test]
    fn unknown_proto_code_is_rejected() {
        // Hand-build a frame claiming proto code 99.
        let mut out = Vec::new();
        encode::write_map_len(&mut out, 1).unwrap();
        encode::write_str(&mut out, "hdr").unwrap();
        encode::write_map_len(&mut out, 1).unwrap();
        encode::write_str(&mut out, "proto").unwrap();
        encode::write_u16(&mut out, 99).unwrap();

        let err = decode_message(&out).unwrap_err();
        assert!(matches!(err, AgentError::Malformed(_)));
    }
}
