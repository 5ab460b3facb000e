//! Reliable-ordered message delivery: see [`Channel`].
//!
//! The channel owns three rings keyed by message or packet sequence:
//!
//! - **send queue** - messages accepted from the application, held until
//!   every byte of them is acked.
//!
//!   Insertion: [`Channel::send`]. Removal: when a packet carrying the
//!   message is acked, or (for block messages) when every fragment is acked.
//!
//! - **sent-packet entries** - what each outgoing packet carried (message
//!   ids, or one block fragment), so a packet ack can release exactly the
//!   right send-queue entries.
//!
//!   Insertion: while filling a packet. Removal: aged out one window after
//!   sending.
//!
//! - **receive queue** - messages accepted from packets, held until the
//!   application drains them in id order.
//!
//!   Insertion: packet receive. Removal: [`Channel::receive`].
//!
//! At most one block message is in flight per direction: when the oldest
//! unacked message is a block, packets carry its fragments (one per packet)
//! instead of inline messages until the whole block is acked.

use bitvec::vec::BitVec;
use bytes::BytesMut;
use tracing::trace;

use crate::{
    bits::{bits_required, Stream},
    config::{Config, MAX_MESSAGES_PER_PACKET, PACKET_WINDOW},
    connection::{ConnectionError, FragmentPayload},
    msg::Message,
    seq::{sequence_greater_than, sequence_less_than, Seq},
    seq_buf::SequenceBuffer,
};

/// Bits left in the packet budget at which message selection gives up early
/// rather than scanning for a small enough message.
const GIVE_UP_BITS: usize = 8 * 8;

#[derive(Debug, Clone)]
struct SendEntry<M> {
    message: M,
    /// Serialized cost including per-message overhead. Zero for blocks,
    /// which are never serialized inline.
    measured_bits: usize,
    last_sent: f64,
    is_block: bool,
}

#[derive(Debug, Clone)]
enum SentDetail {
    Messages(Vec<Seq>),
    Fragment { block_id: Seq, fragment_id: u16 },
}

#[derive(Debug, Clone)]
struct SentPacketEntry {
    #[allow(dead_code)] // kept for diagnostics parity with the sent rings
    sent_time: f64,
    acked: bool,
    detail: SentDetail,
}

#[derive(Debug, Clone)]
struct RecvEntry<M> {
    message: M,
}

#[derive(Debug)]
struct SendBlock {
    active: bool,
    block_id: Seq,
    num_fragments: usize,
    block_size: usize,
    num_acked: usize,
    acked: BitVec,
    sent_time: Vec<f64>,
}

impl SendBlock {
    fn new() -> Self {
        Self {
            active: false,
            block_id: Seq(0),
            num_fragments: 0,
            block_size: 0,
            num_acked: 0,
            acked: BitVec::new(),
            sent_time: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct RecvBlock {
    active: bool,
    message_id: Seq,
    message_kind: u32,
    num_fragments: usize,
    num_received: usize,
    /// Total block size; zero until the last fragment has been seen.
    block_size: usize,
    received: BitVec,
    data: BytesMut,
}

impl RecvBlock {
    fn new() -> Self {
        Self {
            active: false,
            message_id: Seq(0),
            message_kind: 0,
            num_fragments: 0,
            num_received: 0,
            block_size: 0,
            received: BitVec::new(),
            data: BytesMut::new(),
        }
    }
}

/// Everything the channel wants to put into one outgoing packet: either a
/// batch of inline messages or a single block fragment, never both.
#[derive(Debug)]
pub(crate) enum PacketContent<M> {
    /// Nothing to send this packet.
    Empty,
    /// Inline messages, paired with their ids.
    Messages(Vec<(Seq, M)>),
    /// One fragment of the in-flight block.
    Fragment(FragmentPayload),
}

/// Reliable-ordered message channel with block-transfer support.
#[derive(Debug)]
pub struct Channel<M> {
    config: Config,
    message_overhead_bits: usize,
    send_queue: SequenceBuffer<SendEntry<M>>,
    sent_packets: SequenceBuffer<SentPacketEntry>,
    receive_queue: SequenceBuffer<RecvEntry<M>>,
    /// Id the next sent message will take.
    send_id: Seq,
    /// Id of the next message to hand to the application.
    receive_id: Seq,
    /// Smallest id still present in the send queue.
    oldest_unacked_id: Seq,
    send_block: SendBlock,
    recv_block: RecvBlock,
}

impl<M: Message> Channel<M> {
    /// Creates an empty channel.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let kind_bits = if M::kind_count() > 1 {
            bits_required(M::kind_count() - 1) as usize
        } else {
            0
        };
        Self {
            config: config.clone(),
            message_overhead_bits: 16 + kind_bits,
            send_queue: SequenceBuffer::new(config.send_queue_size),
            sent_packets: SequenceBuffer::new(PACKET_WINDOW),
            receive_queue: SequenceBuffer::new(config.receive_queue_size),
            send_id: Seq(0),
            receive_id: Seq(0),
            oldest_unacked_id: Seq(0),
            send_block: SendBlock::new(),
            recv_block: RecvBlock::new(),
        }
    }

    /// Whether the send queue has a free slot for the next message.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.send_queue.available(self.send_id)
    }

    /// Id the next sent message will take.
    #[must_use]
    pub const fn next_send_id(&self) -> Seq {
        self.send_id
    }

    /// Id of the next message [`Channel::receive`] will deliver.
    #[must_use]
    pub const fn receive_next_id(&self) -> Seq {
        self.receive_id
    }

    /// Smallest message id still awaiting acknowledgement.
    #[must_use]
    pub const fn oldest_unacked_id(&self) -> Seq {
        self.oldest_unacked_id
    }

    /// Whether any message is queued but not yet fully acked.
    #[must_use]
    pub fn has_messages_to_send(&self) -> bool {
        self.oldest_unacked_id != self.send_id
    }

    /// Accepts a message for reliable delivery, assigning it the next send
    /// id.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::MessageSendQueueFull`] if the queue has no free
    ///   slot at the next id; the message is dropped, the channel is intact.
    /// - [`ConnectionError::MessageSerializeMeasureFailed`] if the message
    ///   cannot fit the per-packet budget (or a block payload is empty or
    ///   oversized).
    pub fn send(&mut self, message: M, time: f64) -> Result<(), ConnectionError> {
        if !self.can_send() {
            return Err(ConnectionError::MessageSendQueueFull);
        }

        let is_block = message.is_block();
        let measured_bits = if is_block {
            let size = message.block_data().len();
            if size == 0 || size > self.config.max_block_size {
                return Err(ConnectionError::MessageSerializeMeasureFailed);
            }
            0
        } else {
            let mut measure = Stream::measure(self.config.message_packet_budget / 2);
            let mut scratch = message.clone();
            if !scratch.serialize(&mut measure) || !measure.ok() {
                return Err(ConnectionError::MessageSerializeMeasureFailed);
            }
            measure.bits_processed() + self.message_overhead_bits
        };

        let id = self.send_id.get_inc();
        self.send_queue.insert(
            id,
            SendEntry {
                message,
                measured_bits,
                last_sent: -1.0,
                is_block,
            },
        );
        Ok(())
    }

    /// Returns the next in-order message, if it has arrived.
    pub fn receive(&mut self) -> Option<M> {
        let entry = self.receive_queue.remove(self.receive_id)?;
        self.receive_id = self.receive_id.add(1);
        Some(entry.message)
    }

    fn sending_block(&self) -> bool {
        self.send_queue
            .find(self.oldest_unacked_id)
            .is_some_and(|entry| entry.is_block)
    }

    /// Picks what the packet with sequence `packet_seq` should carry and
    /// records it against that sequence for ack handling.
    pub(crate) fn fill_packet(&mut self, packet_seq: Seq, time: f64) -> PacketContent<M> {
        if !self.has_messages_to_send() {
            return PacketContent::Empty;
        }

        if self.sending_block() {
            match self.next_fragment(time) {
                Some(fragment) => {
                    self.sent_packets.insert(
                        packet_seq,
                        SentPacketEntry {
                            sent_time: time,
                            acked: false,
                            detail: SentDetail::Fragment {
                                block_id: fragment.message_id,
                                fragment_id: fragment.fragment_id,
                            },
                        },
                    );
                    PacketContent::Fragment(fragment)
                }
                None => PacketContent::Empty,
            }
        } else {
            let ids = self.select_messages(time);
            if ids.is_empty() {
                return PacketContent::Empty;
            }
            let messages = ids
                .iter()
                .map(|&id| {
                    let entry = self
                        .send_queue
                        .find(id)
                        .expect("selected ids are present in the send queue");
                    (id, entry.message.clone())
                })
                .collect();
            self.sent_packets.insert(
                packet_seq,
                SentPacketEntry {
                    sent_time: time,
                    acked: false,
                    detail: SentDetail::Messages(ids),
                },
            );
            PacketContent::Messages(messages)
        }
    }

    /// Walks `[oldest_unacked, next_send)` in order collecting messages that
    /// are due for (re)send and fit the remaining packet budget.
    fn select_messages(&mut self, time: f64) -> Vec<Seq> {
        let mut ids = Vec::new();
        let mut available_bits = self.config.message_packet_budget * 8;
        let message_limit =
            self.config.send_queue_size.min(self.config.receive_queue_size) / 2;

        for i in 0..message_limit {
            #[allow(clippy::cast_possible_truncation)]
            let id = self.oldest_unacked_id.add(i as u16);
            if id == self.send_id {
                break;
            }
            let Some(entry) = self.send_queue.find_mut(id) else {
                continue;
            };
            if entry.is_block {
                // blocks and regular messages never share a packet
                break;
            }
            if entry.last_sent + self.config.message_resend_rate <= time
                && available_bits >= entry.measured_bits
            {
                ids.push(id);
                entry.last_sent = time;
                available_bits -= entry.measured_bits;
            }
            if available_bits <= GIVE_UP_BITS {
                break;
            }
            if ids.len() == MAX_MESSAGES_PER_PACKET {
                break;
            }
        }
        ids
    }

    /// Starts or continues sending the block at the head of the send queue,
    /// returning the next fragment due for (re)send, if any.
    fn next_fragment(&mut self, time: f64) -> Option<FragmentPayload> {
        let entry = self
            .send_queue
            .find(self.oldest_unacked_id)
            .expect("sending_block checked the entry exists");
        debug_assert!(entry.is_block);
        let message_id = self.oldest_unacked_id;
        let block_data = entry.message.block_data().clone();
        let message_kind = entry.message.kind();
        let block_size = block_data.len();
        let fragment_size = self.config.fragment_size;

        if !self.send_block.active {
            let num_fragments = (block_size + fragment_size - 1) / fragment_size;
            debug_assert!(num_fragments >= 1);
            debug_assert!(num_fragments <= self.config.max_fragments_per_block());
            trace!(
                block_id = message_id.0,
                num_fragments,
                block_size,
                "starting block send"
            );
            self.send_block.active = true;
            self.send_block.block_id = message_id;
            self.send_block.num_fragments = num_fragments;
            self.send_block.block_size = block_size;
            self.send_block.num_acked = 0;
            self.send_block.acked = BitVec::repeat(false, num_fragments);
            self.send_block.sent_time = vec![-1.0; num_fragments];
        }

        let num_fragments = self.send_block.num_fragments;
        let fragment_id = (0..num_fragments).find(|&i| {
            !self.send_block.acked[i]
                && self.send_block.sent_time[i] + self.config.fragment_resend_rate <= time
        })?;
        self.send_block.sent_time[fragment_id] = time;

        let fragment_bytes = if fragment_id == num_fragments - 1 {
            block_size - (num_fragments - 1) * fragment_size
        } else {
            fragment_size
        };
        let start = fragment_id * fragment_size;
        Some(FragmentPayload {
            message_id,
            num_fragments,
            #[allow(clippy::cast_possible_truncation)]
            fragment_id: fragment_id as u16,
            payload: block_data.slice(start..start + fragment_bytes),
            message_kind,
        })
    }

    /// Handles an ack for the packet with sequence `acked_seq`, releasing
    /// whatever that packet carried.
    pub(crate) fn process_packet_ack(&mut self, acked_seq: Seq) {
        let Some(entry) = self.sent_packets.find_mut(acked_seq) else {
            return;
        };
        if entry.acked {
            return;
        }
        entry.acked = true;

        match entry.detail.clone() {
            SentDetail::Messages(ids) => {
                for id in ids {
                    if self.send_queue.exists(id) {
                        self.send_queue.remove(id);
                        self.update_oldest_unacked();
                    }
                }
            }
            SentDetail::Fragment {
                block_id,
                fragment_id,
            } => {
                if self.send_block.active && self.send_block.block_id == block_id {
                    let index = usize::from(fragment_id);
                    if !self.send_block.acked[index] {
                        self.send_block.acked.set(index, true);
                        self.send_block.num_acked += 1;
                        if self.send_block.num_acked == self.send_block.num_fragments {
                            trace!(block_id = block_id.0, "block fully acked");
                            self.send_block.active = false;
                            self.send_queue.remove(block_id);
                            self.update_oldest_unacked();
                        }
                    }
                }
            }
        }
    }

    fn update_oldest_unacked(&mut self) {
        while self.oldest_unacked_id != self.send_id
            && self.send_queue.find(self.oldest_unacked_id).is_none()
        {
            self.oldest_unacked_id = self.oldest_unacked_id.add(1);
        }
        debug_assert!(!sequence_greater_than(
            self.oldest_unacked_id.0,
            self.send_id.0
        ));
    }

    /// Accepts inline messages from a received packet.
    ///
    /// Duplicates and stale ids are dropped; an id beyond the receive window
    /// is a fatal desync.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::MessageDesync`] on a message id outside the
    /// receive window.
    pub(crate) fn process_messages(
        &mut self,
        messages: Vec<(Seq, M)>,
    ) -> Result<(), ConnectionError> {
        #[allow(clippy::cast_possible_truncation)]
        let max_id = self
            .receive_id
            .add(self.config.receive_queue_size as u16 - 1);

        for (id, message) in messages {
            if self.receive_queue.exists(id) {
                continue;
            }
            if sequence_less_than(id.0, self.receive_id.0) {
                continue;
            }
            if sequence_greater_than(id.0, max_id.0) {
                return Err(ConnectionError::MessageDesync);
            }
            self.receive_queue.insert(id, RecvEntry { message });
        }
        Ok(())
    }

    /// Accepts one block fragment from a received packet, merging it into
    /// the in-progress block and completing the block message when the last
    /// fragment lands.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::MessageDesync`] on inconsistent fragment metadata.
    pub(crate) fn process_fragment(
        &mut self,
        fragment: &FragmentPayload,
    ) -> Result<(), ConnectionError> {
        // only the next in-order undelivered message can be an active block;
        // anything else is a stale retransmit
        if fragment.message_id != self.receive_queue.sequence() {
            return Ok(());
        }

        if !self.recv_block.active {
            if fragment.num_fragments > self.config.max_fragments_per_block() {
                return Err(ConnectionError::MessageDesync);
            }
            trace!(
                block_id = fragment.message_id.0,
                num_fragments = fragment.num_fragments,
                "starting block receive"
            );
            self.recv_block.active = true;
            self.recv_block.message_id = fragment.message_id;
            self.recv_block.message_kind = 0;
            self.recv_block.num_fragments = fragment.num_fragments;
            self.recv_block.num_received = 0;
            self.recv_block.block_size = 0;
            self.recv_block.received = BitVec::repeat(false, fragment.num_fragments);
            self.recv_block.data = BytesMut::zeroed(
                fragment.num_fragments * self.config.fragment_size,
            );
        }

        let fragment_size = self.config.fragment_size;
        let num_fragments = self.recv_block.num_fragments;
        if usize::from(fragment.fragment_id) >= num_fragments
            || fragment.num_fragments != num_fragments
        {
            return Err(ConnectionError::MessageDesync);
        }
        let is_last = usize::from(fragment.fragment_id) == num_fragments - 1;
        if fragment.payload.is_empty()
            || fragment.payload.len() > fragment_size
            || (!is_last && fragment.payload.len() != fragment_size)
        {
            return Err(ConnectionError::MessageDesync);
        }

        let index = usize::from(fragment.fragment_id);
        if self.recv_block.received[index] {
            return Ok(());
        }
        self.recv_block.received.set(index, true);
        self.recv_block.num_received += 1;

        let start = index * fragment_size;
        self.recv_block.data[start..start + fragment.payload.len()]
            .copy_from_slice(&fragment.payload);

        if index == 0 {
            self.recv_block.message_kind = fragment.message_kind;
        }
        if is_last {
            self.recv_block.block_size =
                (num_fragments - 1) * fragment_size + fragment.payload.len();
        }

        if self.recv_block.num_received == num_fragments {
            let block_size = self.recv_block.block_size;
            debug_assert!(block_size > 0 && block_size <= self.config.max_block_size);

            let Some(mut message) = M::create(self.recv_block.message_kind) else {
                return Err(ConnectionError::MessageDesync);
            };
            if !message.is_block() {
                return Err(ConnectionError::MessageDesync);
            }
            let data = core::mem::take(&mut self.recv_block.data);
            message.attach_block(data.freeze().slice(..block_size));

            let message_id = self.recv_block.message_id;
            self.recv_block.active = false;
            trace!(block_id = message_id.0, block_size, "block complete");

            if self
                .receive_queue
                .insert(message_id, RecvEntry { message })
                .is_none()
            {
                return Err(ConnectionError::OutOfMemory);
            }
        }
        Ok(())
    }

    /// Ages out sent-packet entries older than one window.
    pub(crate) fn remove_old(&mut self) {
        self.sent_packets.remove_old();
    }

    /// Drops all queued state and rewinds every sequence to zero.
    pub fn reset(&mut self) {
        self.send_queue.reset();
        self.sent_packets.reset();
        self.receive_queue.reset();
        self.send_id = Seq(0);
        self.receive_id = Seq(0);
        self.oldest_unacked_id = Seq(0);
        self.send_block = SendBlock::new();
        self.recv_block = RecvBlock::new();
    }
}
