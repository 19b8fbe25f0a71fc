//! Framing codec: marshal/unmarshal messages to and from transport frames.
//!
//! Every message marshals to one framed body (signature, message id,
//! version, sequence, then the fields, all big-endian). WHISPER and
//! SHOUT carry
//! their payload as one additional raw frame after the body, so the
//! payload is never copied through the length-tagged encoding.

use std::collections::HashMap;

use crate::protocol::{
    ZreBody, ZreMsg, HELLO_ID, JOIN_ID, LEAVE_ID, PING_ID, PING_OK_ID, SHOUT_ID, SIGNATURE,
    STRING_MAX, VERSION, WHISPER_ID,
};

/// Decoding failure. Invalid frames are dropped by the receiving engine.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("invalid signature")]
    Signature,
    #[error("unknown message id {0}")]
    UnknownId(u8),
    #[error("unsupported version {0}")]
    Version(u8),
    #[error("truncated body")]
    Truncated,
    #[error("missing content frame")]
    MissingContent,
}

/// Serialize a message into its transport frames.
pub fn marshal(msg: &ZreMsg) -> Vec<Vec<u8>> {
    let mut body = Vec::with_capacity(body_size(msg));
    put_u16(&mut body, SIGNATURE);
    body.push(msg.id());
    body.push(VERSION);
    put_u16(&mut body, msg.sequence);

    match &msg.body {
        ZreBody::Hello {
            endpoint,
            groups,
            status,
            name,
            headers,
        } => {
            put_string(&mut body, endpoint);
            put_u32(&mut body, groups.len() as u32);
            for group in groups {
                put_long_string(&mut body, group);
            }
            body.push(*status);
            put_string(&mut body, name);
            put_u32(&mut body, headers.len() as u32);
            // Sorted so equal messages marshal to identical bytes.
            let mut keys: Vec<&String> = headers.keys().collect();
            keys.sort();
            for key in keys {
                put_string(&mut body, key);
                put_long_string(&mut body, &headers[key]);
            }
        }
        ZreBody::Whisper { content } => {
            return vec![body, content.clone()];
        }
        ZreBody::Shout { group, content } => {
            put_string(&mut body, group);
            return vec![body, content.clone()];
        }
        ZreBody::Join { group, status } | ZreBody::Leave { group, status } => {
            put_string(&mut body, group);
            body.push(*status);
        }
        ZreBody::Ping | ZreBody::PingOk => {}
    }

    vec![body]
}

/// Parse a message from its transport frames (routing identity already
/// stripped by the router).
pub fn unmarshal(frames: &[Vec<u8>]) -> Result<ZreMsg, WireError> {
    let body = frames.first().ok_or(WireError::Empty)?;
    let mut cur = Cursor::new(body);

    if cur.get_u16()? != SIGNATURE {
        return Err(WireError::Signature);
    }
    let id = cur.get_u8()?;
    let version = cur.get_u8()?;
    if version != VERSION {
        return Err(WireError::Version(version));
    }
    let sequence = cur.get_u16()?;

    let body = match id {
        HELLO_ID => {
            let endpoint = cur.get_string()?;
            let group_count = cur.get_u32()?;
            let mut groups = Vec::new();
            for _ in 0..group_count {
                groups.push(cur.get_long_string()?);
            }
            let status = cur.get_u8()?;
            let name = cur.get_string()?;
            let header_count = cur.get_u32()?;
            let mut headers = HashMap::new();
            for _ in 0..header_count {
                let key = cur.get_string()?;
                let value = cur.get_long_string()?;
                headers.insert(key, value);
            }
            ZreBody::Hello {
                endpoint,
                groups,
                status,
                name,
                headers,
            }
        }
        WHISPER_ID => ZreBody::Whisper {
            content: frames.get(1).ok_or(WireError::MissingContent)?.clone(),
        },
        SHOUT_ID => ZreBody::Shout {
            group: cur.get_string()?,
            content: frames.get(1).ok_or(WireError::MissingContent)?.clone(),
        },
        JOIN_ID => ZreBody::Join {
            group: cur.get_string()?,
            status: cur.get_u8()?,
        },
        LEAVE_ID => ZreBody::Leave {
            group: cur.get_string()?,
            status: cur.get_u8()?,
        },
        PING_ID => ZreBody::Ping,
        PING_OK_ID => ZreBody::PingOk,
        other => return Err(WireError::UnknownId(other)),
    };

    Ok(ZreMsg { sequence, body })
}

fn body_size(msg: &ZreMsg) -> usize {
    let mut size = 2 + 1 + 1 + 2; // signature, id, version, sequence
    match &msg.body {
        ZreBody::Hello {
            endpoint,
            groups,
            name,
            headers,
            ..
        } => {
            size += 1 + endpoint.len().min(STRING_MAX);
            size += 4;
            for group in groups {
                size += 4 + group.len();
            }
            size += 1; // status
            size += 1 + name.len().min(STRING_MAX);
            size += 4;
            for (key, value) in headers {
                size += 1 + key.len().min(STRING_MAX);
                size += 4 + value.len();
            }
        }
        ZreBody::Whisper { .. } => {}
        ZreBody::Shout { group, .. } => size += 1 + group.len().min(STRING_MAX),
        ZreBody::Join { group, .. } | ZreBody::Leave { group, .. } => {
            size += 1 + group.len().min(STRING_MAX) + 1;
        }
        ZreBody::Ping | ZreBody::PingOk => {}
    }
    size
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Short string: 1-byte length, capped at 255 bytes.
fn put_string(buf: &mut Vec<u8>, s: &str) {
    let size = s.len().min(STRING_MAX);
    buf.push(size as u8);
    buf.extend_from_slice(&s.as_bytes()[..size]);
}

/// Long string: 4-byte length.
fn put_long_string(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_string(&mut self) -> Result<String, WireError> {
        let size = self.get_u8()? as usize;
        let bytes = self.take(size)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn get_long_string(&mut self) -> Result<String, WireError> {
        let size = self.get_u32()? as usize;
        let bytes = self.take(size)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}
