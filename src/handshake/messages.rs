//! Messages exchanged during the handshake. All of them are framed with the regular three byte
//!  frame header.
//!
//! ConnectReq (connector to acceptor):
//!
//! ```ascii
//! 0: length (u16)
//! 2: flags (u8) = 0
//! 3: connection version (u32), e.g. 0x17 for RIPC 14
//! 7: connect flags (u8): 0x08 KEY_EXCHANGE (RIPC 14 only)
//! 8: header length (u8) - the length without the component info
//! 9: compression bitmap size (u8), followed by the bitmap: bit (1 << type) for each type
//! *: ping timeout (u8), in seconds
//! *: session flags (u8)
//! *: protocol type (u8) - RIPC 12 and later
//! *: major version (u8)
//! *: minor version (u8)
//! *: host name (u8 length + bytes)
//! *: IP address (u8 length + bytes)
//! *: component info - RIPC 13 and later: container length (u8) = name length + 1,
//!    name length (u8), name
//! ```
//!
//! ConnectAck (acceptor to connector):
//!
//! ```ascii
//! 0: length (u16)
//! 2: flags (u8) = HAS_OPTIONAL_FLAGS
//! 3: extended flags (u8) = 0x01 CONNECT_ACK
//! 4: header length (u8) - the length without the component info
//! 5: unused (u8)
//! 6: RIPC version (u32), e.g. 14
//! 10: max user message size (u16)
//! 12: session flags (u8)
//! 13: ping timeout (u8)
//! 14: major version (u8)
//! 15: minor version (u8)
//! 16: compression type (u16)
//! 18: compression level (u8)
//! RIPC 14 only:
//! 19: key exchange flags (u8): 0x08 KEY_EXCHANGE
//! 20: encryption type (u8)
//! 21: key info length (u8), followed by the key info: P (u64), G (u64), public key (u64)
//! RIPC 13 and later:
//! *: component info as in the ConnectReq
//! ```
//!
//! ConnectNak (acceptor to connector):
//!
//! ```ascii
//! 0: length (u16)
//! 2: flags (u8) = HAS_OPTIONAL_FLAGS
//! 3: extended flags (u8) = 0x02 CONNECT_NAK
//! 4: header length (u8) = 8
//! 5: unused (u8)
//! 6: text length (u16), including a trailing NUL
//! 8: text
//! ```
//!
//! ClientKey (connector to acceptor, RIPC 14 with key exchange):
//!
//! ```ascii
//! 0: length (u16) = 12
//! 2: flags (u8) = 0
//! 3: key length (u8) = 8
//! 4: public key (u64)
//! ```

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use crate::compression::CompressionType;
use crate::ripc::{FrameHeader, RipcFlags, RipcVersion, SessionFlags, HEADER_LEN};
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const KEY_EXCHANGE: u8 = 0x08;
const EXT_CONNECT_ACK: u8 = 0x01;
const EXT_CONNECT_NAK: u8 = 0x02;
const KEY_INFO_LEN: usize = 24;
const CLIENT_KEY_LEN: usize = 8;

pub const CONNECTION_REFUSED: &str = "Connection refused.";

fn put_string_u8(buf: &mut BytesMut, s: &str) {
    buf.put_u8(s.len().min(u8::MAX as usize) as u8);
    buf.put_slice(&s.as_bytes()[..s.len().min(u8::MAX as usize)]);
}

fn try_get_string_u8(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u8()?.safe_cast();
    let mut bytes = vec![0; len];
    buf.try_copy_to_slice(&mut bytes)?;
    Ok(String::from_utf8(bytes)?)
}

fn put_component_info(buf: &mut BytesMut, component_version: &str) {
    let name_len = component_version.len().min(u8::MAX as usize - 1);
    buf.put_u8((name_len + 1) as u8);
    put_string_u8(buf, &component_version[..name_len]);
}

fn try_get_component_info(buf: &mut impl Buf) -> anyhow::Result<String> {
    if !buf.has_remaining() {
        return Ok(String::new());
    }
    let container_len: usize = buf.try_get_u8()?.safe_cast();
    if container_len == 0 {
        return Ok(String::new());
    }
    try_get_string_u8(buf)
}

/// Writes the frame length and the header length once the message is complete
fn finish(buf: &mut BytesMut, start: usize, header_len_pos: usize, header_len: usize) {
    let len: u16 = (buf.len() - start).prechecked_cast();
    buf[start..start + 2].copy_from_slice(&len.to_be_bytes());
    buf[header_len_pos] = header_len.min(u8::MAX as usize) as u8;
}

/// Returns the length of the first frame in `buf` if it is complete
pub fn complete_frame_len(buf: &[u8]) -> Option<usize> {
    let header = FrameHeader::peek(buf)?;
    if header.len <= buf.len() {
        Some(header.len)
    }
    else {
        None
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectReq {
    pub version: RipcVersion,
    pub key_exchange: bool,
    /// bit (1 << type) for each supported compression type
    pub compression_bitmap: u8,
    pub ping_timeout: u8,
    pub session_flags: SessionFlags,
    pub protocol_type: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub host_name: String,
    pub ip_address: String,
    pub component_version: String,
}

impl ConnectReq {
    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u16(0);
        buf.put_u8(0);
        buf.put_u32(self.version.connection_version());
        buf.put_u8(if self.key_exchange && self.version.has_key_exchange() { KEY_EXCHANGE } else { 0 });
        let header_len_pos = buf.len();
        buf.put_u8(0);

        if self.compression_bitmap == 0 {
            buf.put_u8(0);
        }
        else {
            buf.put_u8(1);
            buf.put_u8(self.compression_bitmap);
        }

        buf.put_u8(self.ping_timeout);
        buf.put_u8(self.session_flags.bits());
        if self.version.has_protocol_type() {
            buf.put_u8(self.protocol_type);
        }
        buf.put_u8(self.major_version);
        buf.put_u8(self.minor_version);
        put_string_u8(buf, &self.host_name);
        put_string_u8(buf, &self.ip_address);

        let header_len = buf.len() - start;
        if self.version.has_component_info() {
            put_component_info(buf, &self.component_version);
        }
        finish(buf, start, header_len_pos, header_len);
    }

    /// Returns the connection version of a ConnectReq frame without decoding it
    pub fn peek_connection_version(frame: &[u8]) -> Option<u32> {
        let mut buf = frame.get(HEADER_LEN..)?;
        buf.try_get_u32().ok()
    }

    pub fn deser(frame: &[u8]) -> anyhow::Result<ConnectReq> {
        let mut buf = frame;
        buf.try_get_u16()?;
        buf.try_get_u8()?;
        let connection_version = buf.try_get_u32()?;
        let version = RipcVersion::from_connection_version(connection_version)
            .ok_or_else(|| anyhow!("unsupported connection version {:#x}", connection_version))?;
        let key_exchange = buf.try_get_u8()? & KEY_EXCHANGE != 0;
        buf.try_get_u8()?;

        let bitmap_size: usize = buf.try_get_u8()?.safe_cast();
        let mut compression_bitmap = 0;
        if bitmap_size > 0 {
            compression_bitmap = buf.try_get_u8()?;
            if buf.remaining() < bitmap_size - 1 {
                bail!("compression bitmap exceeds the message");
            }
            buf.advance(bitmap_size - 1);
        }

        let ping_timeout = buf.try_get_u8()?;
        let session_flags = SessionFlags::from_bits_truncate(buf.try_get_u8()?);
        let protocol_type = if version.has_protocol_type() { buf.try_get_u8()? } else { 0 };
        let major_version = buf.try_get_u8()?;
        let minor_version = buf.try_get_u8()?;
        let host_name = try_get_string_u8(&mut buf)?;
        let ip_address = try_get_string_u8(&mut buf)?;
        let component_version = if version.has_component_info() {
            try_get_component_info(&mut buf)?
        }
        else {
            String::new()
        };

        Ok(ConnectReq {
            version,
            key_exchange,
            compression_bitmap,
            ping_timeout,
            session_flags,
            protocol_type,
            major_version,
            minor_version,
            host_name,
            ip_address,
            component_version,
        })
    }
}

/// The acceptor's part of a Diffie-Hellman key exchange
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KeyInfo {
    pub p: u64,
    pub g: u64,
    pub public_key: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectAck {
    pub version: RipcVersion,
    pub max_user_msg_size: u16,
    pub session_flags: SessionFlags,
    pub ping_timeout: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub compression_type: CompressionType,
    pub compression_level: u8,
    /// only for RIPC 14 with key exchange
    pub key_info: Option<KeyInfo>,
    pub component_version: String,
}

impl ConnectAck {
    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u16(0);
        buf.put_u8(RipcFlags::HAS_OPTIONAL_FLAGS.bits());
        buf.put_u8(EXT_CONNECT_ACK);
        let header_len_pos = buf.len();
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u32(u8::from(self.version) as u32);
        buf.put_u16(self.max_user_msg_size);
        buf.put_u8(self.session_flags.bits());
        buf.put_u8(self.ping_timeout);
        buf.put_u8(self.major_version);
        buf.put_u8(self.minor_version);
        buf.put_u16(u8::from(self.compression_type) as u16);
        buf.put_u8(self.compression_level);

        if self.version.has_key_exchange() {
            match &self.key_info {
                Some(key_info) => {
                    buf.put_u8(KEY_EXCHANGE);
                    buf.put_u8(0);
                    buf.put_u8(KEY_INFO_LEN as u8);
                    buf.put_u64(key_info.p);
                    buf.put_u64(key_info.g);
                    buf.put_u64(key_info.public_key);
                }
                None => {
                    buf.put_u8(0);
                    buf.put_u8(0);
                    buf.put_u8(0);
                }
            }
        }

        let header_len = buf.len() - start;
        if self.version.has_component_info() {
            put_component_info(buf, &self.component_version);
        }
        finish(buf, start, header_len_pos, header_len);
    }

    fn deser_body(buf: &mut &[u8]) -> anyhow::Result<ConnectAck> {
        buf.try_get_u8()?;
        buf.try_get_u8()?;
        let raw_version = buf.try_get_u32()?;
        let version = u8::try_from(raw_version).ok()
            .and_then(|v| RipcVersion::try_from(v).ok())
            .ok_or_else(|| anyhow!("unsupported RIPC version {}", raw_version))?;

        let max_user_msg_size = buf.try_get_u16()?;
        let session_flags = SessionFlags::from_bits_truncate(buf.try_get_u8()?);
        let ping_timeout = buf.try_get_u8()?;
        let major_version = buf.try_get_u8()?;
        let minor_version = buf.try_get_u8()?;
        let raw_compression = buf.try_get_u16()?;
        let compression_type = u8::try_from(raw_compression).ok()
            .and_then(|c| CompressionType::try_from(c).ok())
            .ok_or_else(|| anyhow!("unsupported compression type {}", raw_compression))?;
        let compression_level = buf.try_get_u8()?;

        let mut key_info = None;
        if version.has_key_exchange() {
            let flags = buf.try_get_u8()?;
            buf.try_get_u8()?;
            let key_info_len: usize = buf.try_get_u8()?.safe_cast();
            if flags & KEY_EXCHANGE != 0 {
                if key_info_len != KEY_INFO_LEN {
                    bail!("invalid key info length {}", key_info_len);
                }
                key_info = Some(KeyInfo {
                    p: buf.try_get_u64()?,
                    g: buf.try_get_u64()?,
                    public_key: buf.try_get_u64()?,
                });
            }
            else {
                if buf.remaining() < key_info_len {
                    bail!("key info exceeds the message");
                }
                buf.advance(key_info_len);
            }
        }

        let component_version = if version.has_component_info() {
            try_get_component_info(buf)?
        }
        else {
            String::new()
        };

        Ok(ConnectAck {
            version,
            max_user_msg_size,
            session_flags,
            ping_timeout,
            major_version,
            minor_version,
            compression_type,
            compression_level,
            key_info,
            component_version,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectNak {
    pub text: String,
}

impl ConnectNak {
    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u16(0);
        buf.put_u8(RipcFlags::HAS_OPTIONAL_FLAGS.bits());
        buf.put_u8(EXT_CONNECT_NAK);
        let header_len_pos = buf.len();
        buf.put_u8(0);
        buf.put_u8(0);
        let text_len: u16 = (self.text.len() + 1).prechecked_cast();
        buf.put_u16(text_len);
        let header_len = buf.len() - start;
        buf.put_slice(self.text.as_bytes());
        buf.put_u8(0);
        finish(buf, start, header_len_pos, header_len);
    }

    fn deser_body(buf: &mut &[u8]) -> anyhow::Result<ConnectNak> {
        buf.try_get_u8()?;
        buf.try_get_u8()?;
        let text_len: usize = buf.try_get_u16()?.safe_cast();
        let mut text = vec![0; text_len];
        buf.try_copy_to_slice(&mut text)?;
        if text.last() == Some(&0) {
            text.pop();
        }
        Ok(ConnectNak { text: String::from_utf8_lossy(&text).into_owned() })
    }
}

/// The acceptor's answer to a ConnectReq
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectReply {
    Ack(ConnectAck),
    Nak(ConnectNak),
}

impl ConnectReply {
    pub fn deser(frame: &[u8]) -> anyhow::Result<ConnectReply> {
        let mut buf = frame;
        buf.try_get_u16()?;
        let flags = RipcFlags::from_bits_truncate(buf.try_get_u8()?);
        if !flags.contains(RipcFlags::HAS_OPTIONAL_FLAGS) {
            bail!("unexpected handshake message with flags {:?}", flags);
        }

        match buf.try_get_u8()? {
            EXT_CONNECT_ACK => Ok(ConnectReply::Ack(ConnectAck::deser_body(&mut buf)?)),
            EXT_CONNECT_NAK => Ok(ConnectReply::Nak(ConnectNak::deser_body(&mut buf)?)),
            other => bail!("unexpected handshake message with extended flags {:#x}", other),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClientKey {
    pub public_key: u64,
}

impl ClientKey {
    pub const FRAME_LEN: usize = HEADER_LEN + 1 + CLIENT_KEY_LEN;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(Self::FRAME_LEN as u16);
        buf.put_u8(0);
        buf.put_u8(CLIENT_KEY_LEN as u8);
        buf.put_u64(self.public_key);
    }

    pub fn deser(frame: &[u8]) -> anyhow::Result<ClientKey> {
        let mut buf = frame;
        buf.try_get_u16()?;
        buf.try_get_u8()?;
        let key_len: usize = buf.try_get_u8()?.safe_cast();
        if key_len != CLIENT_KEY_LEN {
            bail!("invalid client key length {}", key_len);
        }
        Ok(ClientKey { public_key: buf.try_get_u64()? })
    }
}
