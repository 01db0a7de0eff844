use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use transport::safe_converter::{PrecheckedCast, SafeCast};

pub const FRAME_PREFIX_LEN: usize = size_of::<u32>();

/// Prefixes a packet with its length (u32 LE) for transmission over a byte stream
pub fn frame(packet: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + packet.len());
    let len: u32 = packet.len().prechecked_cast();
    buf.put_u32_le(len);
    buf.put_slice(packet);
    buf
}

/// Splits a peer's byte stream back into the packets that were framed on the sender side.
pub struct StreamDeframer {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl StreamDeframer {
    pub fn new(max_frame_len: usize) -> StreamDeframer {
        StreamDeframer {
            buffer: BytesMut::new(),
            max_frame_len,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.put_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete packet, if any. A frame longer than the maximum means that the
    ///  stream can not be trusted any more, and is reported as an error.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        if self.buffer.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }

        let frame_len: usize = (&self.buffer[..FRAME_PREFIX_LEN]).get_u32_le().safe_cast();
        if frame_len > self.max_frame_len {
            bail!("received a frame of {} bytes, which is longer than the maximum of {}", frame_len, self.max_frame_len);
        }
        if self.buffer.len() < FRAME_PREFIX_LEN + frame_len {
            return Ok(None);
        }

        self.buffer.advance(FRAME_PREFIX_LEN);
        Ok(Some(self.buffer.split_to(frame_len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        assert_eq!(frame(b"abc").as_ref(), b"\x03\0\0\0abc");
        assert_eq!(frame(b"").as_ref(), b"\0\0\0\0");
    }

    #[test]
    fn test_byte_by_byte() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(b"first"));
        stream.extend_from_slice(&frame(b""));
        stream.extend_from_slice(&frame(b"third packet"));

        let mut deframer = StreamDeframer::new(1024);
        let mut packets = Vec::new();
        for b in stream {
            deframer.push(&[b]);
            while let Some(packet) = deframer.next_frame().unwrap() {
                packets.push(packet);
            }
        }
        assert_eq!(packets, vec![Bytes::from_static(b"first"), Bytes::new(), Bytes::from_static(b"third packet")]);
        assert_eq!(deframer.buffered_len(), 0);
    }

    #[test]
    fn test_several_frames_in_one_push() {
        let mut deframer = StreamDeframer::new(1024);
        let mut data = frame(b"one");
        data.extend_from_slice(&frame(b"two"));
        data.extend_from_slice(&frame(b"thr")[..5]);
        deframer.push(&data);

        assert_eq!(deframer.next_frame().unwrap(), Some(Bytes::from_static(b"one")));
        assert_eq!(deframer.next_frame().unwrap(), Some(Bytes::from_static(b"two")));
        assert_eq!(deframer.next_frame().unwrap(), None);
        assert_eq!(deframer.buffered_len(), 5);
    }

    #[test]
    fn test_oversized_frame() {
        let mut deframer = StreamDeframer::new(4);
        deframer.push(&frame(b"12345"));
        assert!(deframer.next_frame().is_err());
    }
}
