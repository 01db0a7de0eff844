use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::header::{HeaderFormat, ImageMetadata, PacketHeader, PacketType};

/// A complete image as sent by a server
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Image {
    pub metadata: ImageMetadata,
    pub data: Vec<u8>,
}

pub fn num_segments(payload_len: usize, max_segment_size: usize) -> usize {
    (ImageMetadata::SERIALIZED_LEN + payload_len).div_ceil(max_segment_size)
}

/// Splits an image into wire packets. The message body (metadata followed by the payload) is
///  cut into segments of `max_segment_size` bytes, with only the last segment being shorter.
///
/// In the unsegmented format, the whole image becomes a single packet regardless of its size.
pub fn segment_image(metadata: &ImageMetadata, payload: &[u8], max_segment_size: usize, index: u16, format: HeaderFormat) -> anyhow::Result<Vec<Bytes>> {
    if max_segment_size < ImageMetadata::SERIALIZED_LEN {
        bail!("segment size {} is too small for image metadata", max_segment_size);
    }

    let mut body = BytesMut::with_capacity(ImageMetadata::SERIALIZED_LEN + payload.len());
    metadata.ser(&mut body);
    body.put_slice(payload);

    if format == HeaderFormat::Unsegmented {
        let mut packet = BytesMut::with_capacity(format.serialized_len() + body.len());
        PacketHeader::single(PacketType::Image, index).ser(&mut packet, format);
        packet.put_slice(&body);
        return Ok(vec![packet.freeze()]);
    }

    let num_segments = num_segments(payload.len(), max_segment_size);
    let Ok(num_segments_u16) = u16::try_from(num_segments) else {
        bail!("image of {} bytes needs {} segments, which is more than supported", payload.len(), num_segments);
    };

    let packets = body
        .chunks(max_segment_size)
        .zip(0..num_segments_u16)
        .map(|(chunk, segment_index)| {
            let mut packet = BytesMut::with_capacity(format.serialized_len() + chunk.len());
            PacketHeader::new(PacketType::Image, num_segments_u16, segment_index, index).ser(&mut packet, format);
            packet.put_slice(chunk);
            packet.freeze()
        })
        .collect::<Vec<_>>();
    trace!("image #{} split into {} packets", index, packets.len());
    Ok(packets)
}

struct PartialMessage {
    num_segments: u16,
    segments: BTreeMap<u16, Bytes>,
    first_seen: Instant,
}

impl PartialMessage {
    fn assemble(self, index: u16) -> Option<Image> {
        let Some(first) = self.segments.get(&0) else {
            warn!("image #{} is missing segment 0", index);
            return None;
        };
        if first.len() < ImageMetadata::SERIALIZED_LEN {
            warn!("segment 0 of image #{} is too small for image metadata: {} bytes", index, first.len());
            return None;
        }
        let metadata = ImageMetadata::deser(&mut first.as_ref()).ok()?;

        let total_len: usize = self.segments.values().map(|s| s.len()).sum();
        let mut data = Vec::with_capacity(total_len - ImageMetadata::SERIALIZED_LEN);
        for segment_index in 0..self.num_segments {
            let Some(segment) = self.segments.get(&segment_index) else {
                warn!("image #{} is missing segment {}", index, segment_index);
                return None;
            };
            if segment_index == 0 {
                data.extend_from_slice(&segment[ImageMetadata::SERIALIZED_LEN..]);
            }
            else {
                data.extend_from_slice(segment);
            }
        }
        debug!("reassembled image #{} from {} segments: {} bytes", index, self.num_segments, data.len());
        Some(Image { metadata, data })
    }
}

/// Collects segments of partially received messages per message index, and assembles them
///  once all segments are there. Segments may arrive in any order.
///
/// Partial messages whose remaining segments do not arrive are evicted after a timeout, and the
///  number of partial messages is bounded: when a new message starts while the limit is reached,
///  the oldest partial message is discarded.
pub struct Reassembler {
    partial_messages: FxHashMap<u16, PartialMessage>,
    timeout: Duration,
    max_partial_messages: usize,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_partial_messages: usize) -> Reassembler {
        Reassembler {
            partial_messages: Default::default(),
            timeout,
            max_partial_messages: max_partial_messages.max(1),
        }
    }

    pub fn num_partial_messages(&self) -> usize {
        self.partial_messages.len()
    }

    pub fn is_pending(&self, index: u16) -> bool {
        self.partial_messages.contains_key(&index)
    }

    /// Adds a segment (the packet body after the header), returning the image if this segment
    ///  completed it.
    pub fn add_segment(&mut self, header: &PacketHeader, body: &[u8], now: Instant) -> Option<Image> {
        self.evict_stale(now);

        if header.num_segments == 0 || header.segment_index >= header.num_segments {
            warn!("invalid segment {} of {} for image #{} - dropping", header.segment_index, header.num_segments, header.index);
            return None;
        }

        if self.partial_messages.get(&header.index).is_some_and(|p| p.num_segments != header.num_segments) {
            debug!("image #{} re-started with a different number of segments - discarding the partial image", header.index);
            self.partial_messages.remove(&header.index);
        }
        if !self.partial_messages.contains_key(&header.index) {
            self.make_room();
        }

        let partial = self.partial_messages
            .entry(header.index)
            .or_insert_with(|| PartialMessage {
                num_segments: header.num_segments,
                segments: BTreeMap::new(),
                first_seen: now,
            });
        if partial.segments.insert(header.segment_index, Bytes::copy_from_slice(body)).is_some() {
            trace!("duplicate segment {} for image #{}", header.segment_index, header.index);
        }
        if partial.segments.len() < usize::from(partial.num_segments) {
            return None;
        }

        self.partial_messages.remove(&header.index)?
            .assemble(header.index)
    }

    fn evict_stale(&mut self, now: Instant) {
        let timeout = self.timeout;
        let len_before = self.partial_messages.len();
        self.partial_messages.retain(|_, p| now.saturating_duration_since(p.first_seen) < timeout);
        let num_evicted = len_before - self.partial_messages.len();
        if num_evicted > 0 {
            debug!("evicted {} partial images after timeout", num_evicted);
        }
    }

    fn make_room(&mut self) {
        while self.partial_messages.len() >= self.max_partial_messages {
            let oldest = self.partial_messages.iter()
                .min_by_key(|(_, p)| p.first_seen)
                .map(|(&index, _)| index);
            match oldest {
                Some(index) => {
                    debug!("too many partial images - discarding image #{}", index);
                    self.partial_messages.remove(&index);
                }
                None => break,
            }
        }
    }
}
