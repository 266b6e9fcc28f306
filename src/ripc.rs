use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// length (u16) + flags (u8)
pub const HEADER_LEN: usize = 3;
/// length prefix of a single message inside a packed frame
pub const PACKED_HEADER_LEN: usize = 2;

/// A ping is a frame consisting only of the header
pub const PING_FRAME: [u8; HEADER_LEN] = [0, HEADER_LEN as u8, RipcFlags::DATA.bits()];

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct RipcFlags: u8 {
        const HAS_OPTIONAL_FLAGS = 0x01;
        const DATA = 0x02;
        const COMPRESSION = 0x04;
        const COMP_FRAGMENT = 0x08;
        const PACKING = 0x10;
    }
}

bitflags! {
    /// The extended flags byte that follows the header if `HAS_OPTIONAL_FLAGS` is set
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct RipcExtFlags: u8 {
        const FRAGMENT_HEADER = 0x01;
        const FRAGMENT = 0x02;
    }
}

bitflags! {
    /// ping directions agreed on in the handshake
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SessionFlags: u8 {
        const CLIENT_TO_SERVER_PING = 0x01;
        const SERVER_TO_CLIENT_PING = 0x02;
    }
}

/// The RIPC protocol versions this implementation speaks, in the numbering that is visible to
///  applications. On the wire, the handshake uses a separate 'connection version' number.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum RipcVersion {
    Ripc11 = 11,
    Ripc12 = 12,
    Ripc13 = 13,
    Ripc14 = 14,
}

impl RipcVersion {
    pub const ALL_DESCENDING: [RipcVersion; 4] = [RipcVersion::Ripc14, RipcVersion::Ripc13, RipcVersion::Ripc12, RipcVersion::Ripc11];

    pub fn connection_version(self) -> u32 {
        match self {
            RipcVersion::Ripc11 => 0x14,
            RipcVersion::Ripc12 => 0x15,
            RipcVersion::Ripc13 => 0x16,
            RipcVersion::Ripc14 => 0x17,
        }
    }

    pub fn from_connection_version(connection_version: u32) -> Option<RipcVersion> {
        Self::ALL_DESCENDING.into_iter()
            .find(|v| v.connection_version() == connection_version)
    }

    pub fn fragment_id_len(self) -> usize {
        if self >= RipcVersion::Ripc13 { 2 } else { 1 }
    }

    pub fn max_fragment_id(self) -> u16 {
        if self >= RipcVersion::Ripc13 { u16::MAX } else { u8::MAX as u16 }
    }

    /// header + ext flags + total length + fragment id
    pub fn first_fragment_header_len(self) -> usize {
        HEADER_LEN + 1 + 4 + self.fragment_id_len()
    }

    /// header + ext flags + fragment id
    pub fn next_fragment_header_len(self) -> usize {
        HEADER_LEN + 1 + self.fragment_id_len()
    }

    pub fn has_protocol_type(self) -> bool {
        self >= RipcVersion::Ripc12
    }

    pub fn has_component_info(self) -> bool {
        self >= RipcVersion::Ripc13
    }

    pub fn has_key_exchange(self) -> bool {
        self >= RipcVersion::Ripc14
    }

    pub fn put_fragment_id(self, buf: &mut impl BufMut, fragment_id: u16) {
        if self.fragment_id_len() == 2 {
            buf.put_u16(fragment_id);
        }
        else {
            // ids stay below max_fragment_id(), see FragmentIdGenerator
            buf.put_u8(fragment_id as u8);
        }
    }

    pub fn try_get_fragment_id(self, buf: &mut impl Buf) -> anyhow::Result<u16> {
        if self.fragment_id_len() == 2 {
            Ok(buf.try_get_u16()?)
        }
        else {
            Ok(buf.try_get_u8()? as u16)
        }
    }
}

/// Hands out fragment ids, starting at 1 and wrapping around without ever returning 0
pub struct FragmentIdGenerator {
    next: u16,
}
impl FragmentIdGenerator {
    pub fn new() -> FragmentIdGenerator {
        FragmentIdGenerator { next: 1 }
    }

    pub fn next_id(&mut self, version: RipcVersion) -> u16 {
        if self.next == 0 || self.next > version.max_fragment_id() {
            self.next = 1;
        }
        let result = self.next;
        self.next = self.next.wrapping_add(1);
        result
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// total frame length, including the header itself
    pub len: usize,
    pub flags: RipcFlags,
}

impl FrameHeader {
    pub fn new(len: usize, flags: RipcFlags) -> FrameHeader {
        FrameHeader { len, flags }
    }

    pub fn is_ping(&self) -> bool {
        self.len == HEADER_LEN
    }

    pub fn payload_len(&self) -> usize {
        self.len.saturating_sub(HEADER_LEN)
    }

    /// Writes the header into the first three bytes of `buf`
    pub fn write_to(&self, buf: &mut [u8]) {
        let len: u16 = self.len.prechecked_cast();
        buf[..2].copy_from_slice(&len.to_be_bytes());
        buf[2] = self.flags.bits();
    }

    /// Returns `None` if `buf` is too short to contain a header. Unknown flag bits are ignored.
    pub fn peek(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(FrameHeader {
            len: u16::from_be_bytes([buf[0], buf[1]]).safe_cast(),
            flags: RipcFlags::from_bits_truncate(buf[2]),
        })
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::v11(RipcVersion::Ripc11, 0x14, 1, 9, 5)]
    #[case::v12(RipcVersion::Ripc12, 0x15, 1, 9, 5)]
    #[case::v13(RipcVersion::Ripc13, 0x16, 2, 10, 6)]
    #[case::v14(RipcVersion::Ripc14, 0x17, 2, 10, 6)]
    fn test_version_properties(#[case] version: RipcVersion, #[case] connection_version: u32, #[case] id_len: usize, #[case] first_len: usize, #[case] next_len: usize) {
        assert_eq!(version.connection_version(), connection_version);
        assert_eq!(RipcVersion::from_connection_version(connection_version), Some(version));
        assert_eq!(version.fragment_id_len(), id_len);
        assert_eq!(version.first_fragment_header_len(), first_len);
        assert_eq!(version.next_fragment_header_len(), next_len);
    }

    #[test]
    fn test_unknown_connection_version() {
        assert_eq!(RipcVersion::from_connection_version(0x18), None);
        assert_eq!(RipcVersion::from_connection_version(0), None);
    }

    #[rstest]
    #[case::v13(RipcVersion::Ripc13, 0x1234, vec![0x12, 0x34])]
    #[case::v11(RipcVersion::Ripc11, 0x34, vec![0x34])]
    fn test_fragment_id_ser(#[case] version: RipcVersion, #[case] id: u16, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        version.put_fragment_id(&mut buf, id);
        assert_eq!(buf, expected);

        let mut b: &[u8] = &buf;
        assert_eq!(version.try_get_fragment_id(&mut b).unwrap(), id);
        assert!(b.is_empty());
    }

    #[test]
    fn test_fragment_id_generator_wraps_without_zero() {
        let mut generator = FragmentIdGenerator::new();
        assert_eq!(generator.next_id(RipcVersion::Ripc11), 1);
        for _ in 2..=255 {
            generator.next_id(RipcVersion::Ripc11);
        }
        assert_eq!(generator.next_id(RipcVersion::Ripc11), 1);

        let mut generator = FragmentIdGenerator { next: u16::MAX };
        assert_eq!(generator.next_id(RipcVersion::Ripc14), u16::MAX);
        assert_eq!(generator.next_id(RipcVersion::Ripc14), 1);
    }

    #[rstest]
    #[case::ping(&PING_FRAME, Some(FrameHeader::new(3, RipcFlags::DATA)))]
    #[case::data(&[1, 0, 2, 9], Some(FrameHeader::new(256, RipcFlags::DATA)))]
    #[case::packed_compressed(&[0, 9, 0x14], Some(FrameHeader::new(9, RipcFlags::PACKING | RipcFlags::COMPRESSION)))]
    #[case::too_short(&[0, 9], None)]
    fn test_peek(#[case] buf: &[u8], #[case] expected: Option<FrameHeader>) {
        assert_eq!(FrameHeader::peek(buf), expected);
    }

    #[test]
    fn test_write_to() {
        let mut buf = [0u8; 5];
        FrameHeader::new(0x0102, RipcFlags::HAS_OPTIONAL_FLAGS | RipcFlags::DATA).write_to(&mut buf);
        assert_eq!(buf, [1, 2, 3, 0, 0]);
    }

    #[test]
    fn test_ping() {
        assert!(FrameHeader::peek(&PING_FRAME).unwrap().is_ping());
        assert!(!FrameHeader::new(4, RipcFlags::DATA).is_ping());
    }
}
