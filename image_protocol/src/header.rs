use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

pub const PROTOCOL_VERSION: u32 = 0;

pub const TYPE_TAG_LEN: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    None,
    Image,
    Configuration,
    Status,
    Handshake,
}

impl PacketType {
    const ALL: [PacketType; 5] = [
        PacketType::None,
        PacketType::Image,
        PacketType::Configuration,
        PacketType::Status,
        PacketType::Handshake,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PacketType::None => "",
            PacketType::Image => "IMAGE",
            PacketType::Configuration => "CONFIGURATION",
            PacketType::Status => "STATUS",
            PacketType::Handshake => "HANDSHAKE",
        }
    }

    /// The type's name as it appears on the wire: truncated to 8 bytes, and padded with zeros
    pub fn tag(self) -> [u8; TYPE_TAG_LEN] {
        let mut tag = [0u8; TYPE_TAG_LEN];
        let name = self.name().as_bytes();
        let len = name.len().min(TYPE_TAG_LEN);
        tag[..len].copy_from_slice(&name[..len]);
        tag
    }

    /// The exact inverse of [`PacketType::tag`] - tags that merely start with a type's name
    ///  do not match.
    pub fn from_tag(tag: &[u8; TYPE_TAG_LEN]) -> Option<PacketType> {
        Self::ALL.into_iter()
            .find(|t| &t.tag() == tag)
    }
}

/// The two header layouts, which peers must agree on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderFormat {
    /// messages can span several packets
    Segmented,
    /// every message is a single packet without segment fields
    Unsegmented,
}

impl HeaderFormat {
    pub const fn serialized_len(self) -> usize {
        match self {
            HeaderFormat::Segmented => 18,
            HeaderFormat::Unsegmented => 12,
        }
    }
}

/// Packet header, all numbers little endian:
///
/// ```ascii
///  0: protocol version (u32)
///  4: type tag (8 bytes, zero padded)
/// 12: number of segments (u16)      - segmented format only
/// 14: segment index (u16)           - segmented format only
/// 16: message index (u16)           - segmented format only
/// ```
///
/// The unsegmented format implies a single segment with index 0 of message 0.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub version: u32,
    pub type_tag: [u8; TYPE_TAG_LEN],
    pub num_segments: u16,
    pub segment_index: u16,
    pub index: u16,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType, num_segments: u16, segment_index: u16, index: u16) -> PacketHeader {
        PacketHeader {
            version: PROTOCOL_VERSION,
            type_tag: packet_type.tag(),
            num_segments,
            segment_index,
            index,
        }
    }

    pub fn single(packet_type: PacketType, index: u16) -> PacketHeader {
        Self::new(packet_type, 1, 0, index)
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_tag(&self.type_tag)
    }

    pub fn ser(&self, buf: &mut BytesMut, format: HeaderFormat) {
        buf.put_u32_le(self.version);
        buf.put_slice(&self.type_tag);
        if format == HeaderFormat::Segmented {
            buf.put_u16_le(self.num_segments);
            buf.put_u16_le(self.segment_index);
            buf.put_u16_le(self.index);
        }
    }

    pub fn deser(buf: &mut impl Buf, format: HeaderFormat) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < format.serialized_len() {
            bail!("packet too short for header: {} bytes", buf.remaining());
        }

        let version = buf.get_u32_le();
        let mut type_tag = [0u8; TYPE_TAG_LEN];
        buf.copy_to_slice(&mut type_tag);

        let header = match format {
            HeaderFormat::Segmented => PacketHeader {
                version,
                type_tag,
                num_segments: buf.get_u16_le(),
                segment_index: buf.get_u16_le(),
                index: buf.get_u16_le(),
            },
            HeaderFormat::Unsegmented => PacketHeader {
                version,
                type_tag,
                num_segments: 1,
                segment_index: 0,
                index: 0,
            },
        };
        Ok(header)
    }
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let tag_len = self.type_tag.iter().position(|&b| b == 0).unwrap_or(TYPE_TAG_LEN);
        write!(f, "PacketHeader{{v{}:{}:#{}[{}/{}]}}",
               self.version,
               String::from_utf8_lossy(&self.type_tag[..tag_len]),
               self.index,
               self.segment_index,
               self.num_segments,
        )
    }
}

/// Image metadata at the start of segment 0, all numbers little endian:
///
/// ```ascii
///  0: timestamp (u64)
///  8: width (u16)
/// 10: height (u16)
/// 12: encoding (u8)
/// 13: camera identifier (u8)
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ImageMetadata {
    pub timestamp: u64,
    pub width: u16,
    pub height: u16,
    pub encoding: u8,
    pub identifier: u8,
}

impl ImageMetadata {
    pub const SERIALIZED_LEN: usize = 14;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.timestamp);
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.put_u8(self.encoding);
        buf.put_u8(self.identifier);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ImageMetadata> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("not enough data for image metadata: {} bytes", buf.remaining());
        }
        Ok(ImageMetadata {
            timestamp: buf.get_u64_le(),
            width: buf.get_u16_le(),
            height: buf.get_u16_le(),
            encoding: buf.get_u8(),
            identifier: buf.get_u8(),
        })
    }
}
