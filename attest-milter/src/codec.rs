//! Milter wire framing: 4-byte big-endian length, 1-byte command
//! letter, payload.

use attest_common::error::ProtocolError;

// Commands the MTA sends (SMFIC).
pub const SMFIC_ABORT: u8 = b'A';
pub const SMFIC_BODY: u8 = b'B';
pub const SMFIC_CONNECT: u8 = b'C';
pub const SMFIC_MACRO: u8 = b'D';
pub const SMFIC_BODYEOB: u8 = b'E';
pub const SMFIC_HELO: u8 = b'H';
pub const SMFIC_QUIT_NC: u8 = b'K';
pub const SMFIC_HEADER: u8 = b'L';
pub const SMFIC_MAIL: u8 = b'M';
pub const SMFIC_EOH: u8 = b'N';
pub const SMFIC_OPTNEG: u8 = b'O';
pub const SMFIC_QUIT: u8 = b'Q';
pub const SMFIC_RCPT: u8 = b'R';
pub const SMFIC_DATA: u8 = b'T';

// Responses the filter sends (SMFIR).
pub const SMFIR_ACCEPT: u8 = b'a';
pub const SMFIR_CONTINUE: u8 = b'c';
pub const SMFIR_DISCARD: u8 = b'd';
pub const SMFIR_ADDHEADER: u8 = b'h';
pub const SMFIR_INSHEADER: u8 = b'i';
pub const SMFIR_QUARANTINE: u8 = b'q';
pub const SMFIR_REJECT: u8 = b'r';
pub const SMFIR_TEMPFAIL: u8 = b't';
pub const SMFIR_REPLYCODE: u8 = b'y';

// Action capabilities (SMFIF) advertised at negotiation.
pub const SMFIF_ADDHDRS: u32 = 0x01;
pub const SMFIF_CHGBODY: u32 = 0x02;
pub const SMFIF_CHGHDRS: u32 = 0x10;
pub const SMFIF_QUARANTINE: u32 = 0x20;
pub const SMFIF_CHGFROM: u32 = 0x40;

pub const MILTER_VERSION: u32 = 6;

/// Every NOCONNECT/NOHELO/NOMAIL/NORCPT/NOBODY/NOHDRS/NOEOH bit
/// cleared: the filter wants to see every lifecycle event.
pub const PROTOCOL_STEPS: u32 = 0;

pub const ACTION_FLAGS: u32 =
    SMFIF_ADDHDRS | SMFIF_CHGBODY | SMFIF_CHGHDRS | SMFIF_QUARANTINE | SMFIF_CHGFROM;

/// Frames larger than this are a protocol error rather than a buffer
/// to grow into.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

/// Pop one complete frame off the front of `buffer`, or `None` when
/// more bytes are needed.
pub fn parse_frame(buffer: &mut Vec<u8>) -> Result<Option<Frame>, ProtocolError> {
    if buffer.len() < 5 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if length == 0 {
        return Err(ProtocolError::MalformedFrame(
            "zero-length frame".to_string(),
        ));
    }
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::Oversized(length));
    }
    if buffer.len() < 4 + length {
        return Ok(None);
    }

    let command = buffer[4];
    let payload = buffer[5..4 + length].to_vec();
    buffer.drain(..4 + length);

    Ok(Some(Frame { command, payload }))
}

/// Encode one response frame.
#[must_use]
pub fn encode_frame(command: u8, payload: &[u8]) -> Vec<u8> {
    let length = u32::try_from(payload.len() + 1).unwrap_or(u32::MAX);
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(command);
    frame.extend_from_slice(payload);
    frame
}

/// The negotiation reply: version, action bits, protocol-step bits.
#[must_use]
pub fn encode_optneg() -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&MILTER_VERSION.to_be_bytes());
    payload.extend_from_slice(&ACTION_FLAGS.to_be_bytes());
    payload.extend_from_slice(&PROTOCOL_STEPS.to_be_bytes());
    encode_frame(SMFIC_OPTNEG, &payload)
}

/// `insheader` at `index`: `u32 index, name NUL, value NUL`.
#[must_use]
pub fn encode_insert_header(index: u32, name: &str, value: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + name.len() + value.len() + 2);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    encode_frame(SMFIR_INSHEADER, &payload)
}

#[must_use]
pub fn encode_quarantine(reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(reason.len() + 1);
    payload.extend_from_slice(reason.as_bytes());
    payload.push(0);
    encode_frame(SMFIR_QUARANTINE, &payload)
}

/// A `replycode` response carrying a full SMTP reply line.
#[must_use]
pub fn encode_replycode(line: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(line.len() + 1);
    payload.extend_from_slice(line.as_bytes());
    payload.push(0);
    encode_frame(SMFIR_REPLYCODE, &payload)
}

fn cstr_at<'a>(payload: &'a [u8], offset: &mut usize) -> Result<&'a str, ProtocolError> {
    let rest = &payload[*offset..];
    let end = rest
        .iter()
        .position(|&byte| byte == 0)
        .ok_or_else(|| ProtocolError::MalformedFrame("unterminated string".to_string()))?;
    let text = std::str::from_utf8(&rest[..end])
        .map_err(|_| ProtocolError::MalformedFrame("invalid UTF-8".to_string()))?;
    *offset += end + 1;
    Ok(text)
}

/// Negotiation payload: the MTA's version, action and step masks.
pub fn parse_optneg(payload: &[u8]) -> Result<(u32, u32, u32), ProtocolError> {
    if payload.len() < 12 {
        return Err(ProtocolError::MalformedFrame(
            "short OPTNEG payload".to_string(),
        ));
    }

    let word = |idx: usize| {
        u32::from_be_bytes([
            payload[idx],
            payload[idx + 1],
            payload[idx + 2],
            payload[idx + 3],
        ])
    };
    Ok((word(0), word(4), word(8)))
}

/// Connect payload: `hostname NUL family [port16 address NUL]`.
///
/// `family` is `'4'`, `'6'`, `'L'` (local socket) or `'U'` (unknown).
pub fn parse_connect(payload: &[u8]) -> Result<(String, Option<String>), ProtocolError> {
    let mut offset = 0;
    let hostname = cstr_at(payload, &mut offset)?.to_string();

    let family = payload
        .get(offset)
        .copied()
        .ok_or_else(|| ProtocolError::MalformedFrame("missing address family".to_string()))?;
    offset += 1;

    let address = match family {
        b'4' | b'6' => {
            // Skip the 2-byte port.
            if payload.len() < offset + 2 {
                return Err(ProtocolError::MalformedFrame("missing port".to_string()));
            }
            offset += 2;
            Some(cstr_at(payload, &mut offset)?.to_string())
        }
        _ => None,
    };

    Ok((hostname, address))
}

/// Header payload: `name NUL value NUL`.
pub fn parse_header(payload: &[u8]) -> Result<(String, String), ProtocolError> {
    let mut offset = 0;
    let name = cstr_at(payload, &mut offset)?.to_string();
    let value = cstr_at(payload, &mut offset)?.to_string();
    Ok((name, value))
}

/// Macro payload: the command letter the macros apply to, then
/// NUL-separated name/value pairs.
pub fn parse_macros(payload: &[u8]) -> Result<(u8, Vec<(String, String)>), ProtocolError> {
    let Some((&stage, rest)) = payload.split_first() else {
        return Err(ProtocolError::MalformedFrame("empty macro frame".to_string()));
    };

    let mut macros = Vec::new();
    let mut offset = 0;
    while offset < rest.len() {
        let name = cstr_at(rest, &mut offset)?.to_string();
        if offset >= rest.len() {
            break;
        }
        let value = cstr_at(rest, &mut offset)?.to_string();
        macros.push((name, value));
    }

    Ok((stage, macros))
}

/// Envelope payload: the address, then optional ESMTP arguments.
pub fn parse_envelope(payload: &[u8]) -> Result<String, ProtocolError> {
    let mut offset = 0;
    Ok(cstr_at(payload, &mut offset)?.to_string())
}
