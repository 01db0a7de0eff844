use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

struct Unacked {
    packet: Bytes,
    last_sent: Instant,
    num_sent: u32,
}

/// Sequencing state for a single reliable-UDP peer, in both directions. This is pure
///  bookkeeping without I/O.
#[derive(Default)]
pub(crate) struct PeerState {
    next_send_sequence: u32,
    unacked: BTreeMap<u32, Unacked>,
    /// senders start at sequence number 0
    next_expected: u32,
    out_of_order: BTreeMap<u32, Bytes>,
    deliverable: VecDeque<Bytes>,
}

/// the result of checking a peer's unacknowledged packets for overdue retransmissions
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Overdue {
    Resend(Vec<Bytes>),
    GiveUp,
}

impl PeerState {
    pub fn num_unacked(&self) -> usize {
        self.unacked.len()
    }

    /// Registers a packet about to be sent, returning its sequence number. `build_packet` is
    ///  called with the sequence number to serialize the packet.
    pub fn register_send(&mut self, now: Instant, build_packet: impl FnOnce(u32) -> Bytes) -> (u32, Bytes) {
        let sequence = self.next_send_sequence;
        self.next_send_sequence = sequence.wrapping_add(1);

        let packet = build_packet(sequence);
        self.unacked.insert(sequence, Unacked {
            packet: packet.clone(),
            last_sent: now,
            num_sent: 1,
        });
        (sequence, packet)
    }

    pub fn on_ack(&mut self, sequence: u32) -> bool {
        self.unacked.remove(&sequence).is_some()
    }

    /// Handles an incoming DATA packet. Payloads become deliverable in sequence order, and
    ///  duplicates as well as packets too far ahead of the current position are ignored.
    ///
    /// Returns `true` if the packet should be acknowledged, i.e. it was accepted now or was
    ///  accepted before. Packets outside the receive window are not acknowledged so that the
    ///  sender re-sends them.
    pub fn on_data(&mut self, sequence: u32, payload: Bytes, receive_window_size: u32) -> bool {
        let offset = sequence.wrapping_sub(self.next_expected);
        if offset >= u32::MAX / 2 {
            trace!("ignoring duplicate packet #{}", sequence);
            return true;
        }
        if offset >= receive_window_size {
            trace!("packet #{} is outside the receive window - ignoring", sequence);
            return false;
        }
        if offset > 0 {
            self.out_of_order.entry(sequence).or_insert(payload);
            return true;
        }

        self.deliverable.push_back(payload);
        let mut next = sequence.wrapping_add(1);
        while let Some(buffered) = self.out_of_order.remove(&next) {
            self.deliverable.push_back(buffered);
            next = next.wrapping_add(1);
        }
        self.next_expected = next;
        true
    }

    pub fn pop_deliverable(&mut self) -> Option<Bytes> {
        self.deliverable.pop_front()
    }

    /// Collects packets that were not acknowledged within `timeout` for re-sending. Gives up
    ///  if one of them was re-sent `max_retransmissions` times already.
    pub fn collect_overdue(&mut self, now: Instant, timeout: Duration, max_retransmissions: u32) -> Overdue {
        let mut packets = Vec::new();
        for unacked in self.unacked.values_mut() {
            if now.duration_since(unacked.last_sent) < timeout {
                continue;
            }
            if unacked.num_sent > max_retransmissions {
                return Overdue::GiveUp;
            }
            unacked.num_sent += 1;
            unacked.last_sent = now;
            packets.push(unacked.packet.clone());
        }
        Overdue::Resend(packets)
    }
}
