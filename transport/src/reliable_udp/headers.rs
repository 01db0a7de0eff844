use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketKind {
    Data,
    Ack,
}

impl PacketKind {
    fn to_raw(self) -> u8 {
        match self {
            PacketKind::Data => 0,
            PacketKind::Ack => 1,
        }
    }

    fn from_raw(raw: u8) -> anyhow::Result<PacketKind> {
        match raw {
            0 => Ok(PacketKind::Data),
            1 => Ok(PacketKind::Ack),
            _ => bail!("invalid packet kind {}", raw),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReliableHeader {
    pub kind: PacketKind,
    pub sequence: u32,
}

impl ReliableHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() + size_of::<u32>();

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.to_raw());
        buf.put_u32(self.sequence);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ReliableHeader> {
        let kind = PacketKind::from_raw(buf.try_get_u8()?)?;
        let sequence = buf.try_get_u32()?;
        Ok(ReliableHeader {
            kind,
            sequence,
        })
    }

    pub fn packet(kind: PacketKind, sequence: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN + payload.len());
        ReliableHeader { kind, sequence }.ser(&mut buf);
        buf.put_slice(payload);
        buf
    }
}
