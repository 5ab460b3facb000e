//! See [`Connection`] and [`ConnectionPacket`].

use bytes::Bytes;

use crate::{
    ack::{AckHeader, AckSystem},
    bits::{bits_required, Stream},
    channel::{Channel, PacketContent},
    config::{Config, MAX_MESSAGES_PER_PACKET},
    msg::Message,
    seq::Seq,
};

/// Fatal or caller-visible failure of a [`Connection`].
///
/// [`MessageDesync`] and [`OutOfMemory`] latch the connection into an error
/// state: it refuses further sends and receives until [`Connection::reset`].
/// The other kinds only reject the offending call.
///
/// [`MessageDesync`]: ConnectionError::MessageDesync
/// [`OutOfMemory`]: ConnectionError::OutOfMemory
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// A received message id or fragment landed outside the receive window,
    /// or fragment metadata contradicted the in-progress block. The peers
    /// have lost agreement and the connection is unusable.
    #[error("message stream desynced")]
    MessageDesync,
    /// The send queue has no free slot at the next message id. The message
    /// was dropped; the connection is intact.
    #[error("message send queue full")]
    MessageSendQueueFull,
    /// The message cannot be serialized within the per-packet budget, so it
    /// could never be delivered. The message was dropped.
    #[error("message serialize measure failed")]
    MessageSerializeMeasureFailed,
    /// A bounded buffer could not accept data it was required to hold.
    #[error("out of memory")]
    OutOfMemory,
}

/// One fragment of a block message as carried by a [`ConnectionPacket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentPayload {
    /// Id of the block message this fragment belongs to.
    pub message_id: Seq,
    /// Total number of fragments in the block.
    pub num_fragments: usize,
    /// Index of this fragment, in `0..num_fragments`.
    pub fragment_id: u16,
    /// This fragment's bytes. Every fragment except the last is exactly the
    /// configured fragment size; the last carries the remainder.
    pub payload: Bytes,
    /// Message kind of the block. Only serialized on fragment 0.
    pub message_kind: u32,
}

/// The single packet type of the connection engine.
///
/// Serialization order: `[seq][ack][ack_bits][has_messages]{messages}`
/// `[has_fragment]{fragment}`. The send side fills at most one of the two
/// optional sections per packet; the read side parses both independently.
#[derive(Debug, Clone)]
pub struct ConnectionPacket<M> {
    /// This packet's own sequence number.
    pub sequence: Seq,
    /// Acknowledgement state of the sender.
    pub header: AckHeader,
    /// Inline messages with their ids. Empty if the packet carries a
    /// fragment or nothing.
    pub messages: Vec<(Seq, M)>,
    /// At most one block fragment.
    pub fragment: Option<FragmentPayload>,
}

impl<M: Message> ConnectionPacket<M> {
    /// Creates an empty packet with zeroed header fields.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sequence: Seq(0),
            header: AckHeader::default(),
            messages: Vec::new(),
            fragment: None,
        }
    }

    fn kind_bits() -> usize {
        if M::kind_count() > 1 {
            bits_required(M::kind_count() - 1) as usize
        } else {
            0
        }
    }

    /// Runs the packet body through `stream` in any mode.
    #[allow(clippy::too_many_lines)]
    pub fn serialize(&mut self, stream: &mut Stream, config: &Config) -> bool {
        let mut sequence = u32::from(self.sequence.0);
        let mut ack = u32::from(self.header.ack.0);
        let mut ack_bits = self.header.ack_bits;
        if !stream.serialize_bits(&mut sequence, 16)
            || !stream.serialize_bits(&mut ack, 16)
            || !stream.serialize_bits(&mut ack_bits, 32)
        {
            return false;
        }
        self.sequence = Seq(sequence as u16);
        self.header = AckHeader {
            ack: Seq(ack as u16),
            ack_bits,
        };

        if !self.serialize_messages(stream) {
            return false;
        }
        self.serialize_fragment(stream, config)
    }

    fn serialize_messages(&mut self, stream: &mut Stream) -> bool {
        let mut has_messages = !self.messages.is_empty();
        if !stream.serialize_bool(&mut has_messages) {
            return false;
        }
        if !has_messages {
            if stream.is_reading() {
                self.messages.clear();
            }
            return true;
        }

        #[allow(clippy::cast_possible_wrap)]
        let mut num_messages = self.messages.len() as i32;
        #[allow(clippy::cast_possible_wrap)]
        if !stream.serialize_int(&mut num_messages, 1, MAX_MESSAGES_PER_PACKET as i32) {
            return false;
        }
        #[allow(clippy::cast_sign_loss)]
        let num_messages = num_messages as usize;

        let mut ids = Vec::with_capacity(num_messages);
        for i in 0..num_messages {
            let mut id = if stream.is_reading() {
                0
            } else {
                u32::from(self.messages[i].0 .0)
            };
            if !stream.serialize_bits(&mut id, 16) {
                return false;
            }
            ids.push(Seq(id as u16));
        }

        let kind_bits = Self::kind_bits();
        if stream.is_reading() {
            self.messages.clear();
            for id in ids {
                let mut kind = 0u32;
                if kind_bits > 0 && !stream.serialize_bits(&mut kind, kind_bits) {
                    return false;
                }
                let Some(mut message) = M::create(kind) else {
                    return false;
                };
                if message.is_block() {
                    // block payloads only travel as fragments
                    return false;
                }
                if !message.serialize(stream) {
                    return false;
                }
                self.messages.push((id, message));
            }
        } else {
            for (_, message) in &mut self.messages {
                let mut kind = message.kind();
                if kind_bits > 0 && !stream.serialize_bits(&mut kind, kind_bits) {
                    return false;
                }
                if !message.serialize(stream) {
                    return false;
                }
            }
        }
        true
    }

    fn serialize_fragment(&mut self, stream: &mut Stream, config: &Config) -> bool {
        let mut has_fragment = self.fragment.is_some();
        if !stream.serialize_bool(&mut has_fragment) {
            return false;
        }
        if !has_fragment {
            if stream.is_reading() {
                self.fragment = None;
            }
            return true;
        }

        let mut fragment = if stream.is_reading() {
            FragmentPayload {
                message_id: Seq(0),
                num_fragments: 1,
                fragment_id: 0,
                payload: Bytes::new(),
                message_kind: 0,
            }
        } else {
            match self.fragment.take() {
                Some(fragment) => fragment,
                None => return false,
            }
        };

        let mut message_id = u32::from(fragment.message_id.0);
        if !stream.serialize_bits(&mut message_id, 16) {
            return false;
        }
        fragment.message_id = Seq(message_id as u16);

        #[allow(clippy::cast_possible_wrap)]
        let mut num_fragments = fragment.num_fragments as i32;
        #[allow(clippy::cast_possible_wrap)]
        if !stream.serialize_int(&mut num_fragments, 1, config.max_fragments_per_block() as i32)
        {
            return false;
        }
        #[allow(clippy::cast_sign_loss)]
        let num_fragments_usize = num_fragments as usize;
        fragment.num_fragments = num_fragments_usize;

        let mut fragment_id = i32::from(fragment.fragment_id);
        if num_fragments > 1 {
            if !stream.serialize_int(&mut fragment_id, 0, num_fragments - 1) {
                return false;
            }
        } else {
            fragment_id = 0;
        }
        #[allow(clippy::cast_sign_loss)]
        {
            fragment.fragment_id = fragment_id as u16;
        }

        // the byte count is always serialized, including for the last
        // fragment, so reassembly never has to infer it
        #[allow(clippy::cast_possible_wrap)]
        let mut fragment_bytes = fragment.payload.len() as i32;
        #[allow(clippy::cast_possible_wrap)]
        if !stream.serialize_int(&mut fragment_bytes, 1, config.fragment_size as i32) {
            return false;
        }
        #[allow(clippy::cast_sign_loss)]
        let fragment_bytes = fragment_bytes as usize;

        if stream.is_reading() {
            let mut payload = vec![0u8; fragment_bytes];
            if !stream.serialize_bytes(&mut payload) {
                return false;
            }
            fragment.payload = Bytes::from(payload);
        } else {
            let mut payload = fragment.payload.to_vec();
            if !stream.serialize_bytes(&mut payload) {
                return false;
            }
        }

        if fragment.fragment_id == 0 {
            let kind_bits = Self::kind_bits();
            if kind_bits > 0 && !stream.serialize_bits(&mut fragment.message_kind, kind_bits) {
                return false;
            }
        } else {
            fragment.message_kind = 0;
        }

        self.fragment = Some(fragment);
        true
    }
}

impl<M: Message> Default for ConnectionPacket<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a reliable connection: the ack system and message/block
/// channel multiplexed into a single packet type.
///
/// The host drives it with [`advance_time`], builds at most one outgoing
/// packet per tick with [`write_packet`], and feeds every received packet to
/// [`read_packet`]. Acks from an incoming packet are processed before its
/// messages, so send-queue slots released by the ack are visible to the same
/// packet's downstream effects.
///
/// [`advance_time`]: Connection::advance_time
/// [`write_packet`]: Connection::write_packet
/// [`read_packet`]: Connection::read_packet
#[derive(Debug)]
pub struct Connection<M> {
    time: f64,
    error: Option<ConnectionError>,
    acks: AckSystem,
    /// Whether the peer is owed an ack it has not been sent yet. Set when a
    /// received packet carries messages or a fragment; packets that carry
    /// nothing need no ack (nothing references them), which is what lets two
    /// idle endpoints actually fall silent instead of acking each other's
    /// acks forever.
    acks_dirty: bool,
    channel: Channel<M>,
}

impl<M: Message> Connection<M> {
    /// Creates a connection endpoint.
    ///
    /// # Panics
    ///
    /// Panics if the configuration fails [`Config::validate`].
    #[must_use]
    pub fn new(config: &Config) -> Self {
        config.validate();
        Self {
            time: 0.0,
            error: None,
            acks: AckSystem::new(),
            acks_dirty: false,
            channel: Channel::new(config),
        }
    }

    /// The latched fatal error, if any. Check once per tick; a connection in
    /// error refuses all further work until [`Connection::reset`].
    #[must_use]
    pub const fn error(&self) -> Option<ConnectionError> {
        self.error
    }

    /// Whether the send queue can accept another message.
    #[must_use]
    pub fn can_send_message(&self) -> bool {
        self.error.is_none() && self.channel.can_send()
    }

    /// Whether any queued message is still awaiting acknowledgement.
    #[must_use]
    pub fn has_messages_to_send(&self) -> bool {
        self.channel.has_messages_to_send()
    }

    /// Queues a message for reliable in-order delivery.
    ///
    /// # Errors
    ///
    /// See [`Channel::send`]. The connection stays usable after an error
    /// here; only the offending message is dropped.
    pub fn send_message(&mut self, message: M) -> Result<(), ConnectionError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.channel.send(message, self.time)
    }

    /// Returns the next in-order received message, if available.
    pub fn receive_message(&mut self) -> Option<M> {
        if self.error.is_some() {
            return None;
        }
        self.channel.receive()
    }

    /// Builds the next outgoing packet: ack header plus either a batch of
    /// due messages or one block fragment.
    ///
    /// Returns `None` if the connection is in error, or on a truly idle
    /// tick: nothing due for (re)send and no ack the peer is still owed. On
    /// an idle connection the host should fall back to its keep-alive
    /// cadence instead of emitting empty packets every tick.
    pub fn write_packet(&mut self) -> Option<ConnectionPacket<M>> {
        if self.error.is_some() {
            return None;
        }

        let sequence = self.acks.next_sequence();
        let content = self.channel.fill_packet(sequence, self.time);
        if matches!(content, PacketContent::Empty) && !self.acks_dirty {
            return None;
        }
        self.acks.record_sent(sequence);
        self.acks_dirty = false;

        let mut packet = ConnectionPacket::new();
        packet.sequence = sequence;
        packet.header = self.acks.header();
        match content {
            PacketContent::Empty => {}
            PacketContent::Messages(messages) => packet.messages = messages,
            PacketContent::Fragment(fragment) => packet.fragment = Some(fragment),
        }
        Some(packet)
    }

    /// Applies a received packet: processes its acks, then its messages,
    /// then its fragment, then records its sequence as received.
    ///
    /// # Errors
    ///
    /// A fatal channel error ([`ConnectionError::MessageDesync`],
    /// [`ConnectionError::OutOfMemory`]) latches the connection.
    pub fn read_packet(&mut self, packet: ConnectionPacket<M>) -> Result<(), ConnectionError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let needs_ack = !packet.messages.is_empty() || packet.fragment.is_some();

        let Self { acks, channel, .. } = self;
        acks.process(packet.header, |acked_seq| {
            channel.process_packet_ack(acked_seq);
        });

        let result = (|| {
            channel.process_messages(packet.messages)?;
            if let Some(fragment) = &packet.fragment {
                channel.process_fragment(fragment)?;
            }
            Ok(())
        })();
        if let Err(error) = result {
            self.error = Some(error);
            return Err(error);
        }

        self.acks.record_received(packet.sequence);
        if needs_ack {
            self.acks_dirty = true;
        }
        Ok(())
    }

    /// Advances the connection clock and ages out stale ring entries.
    pub fn advance_time(&mut self, time: f64) {
        self.time = time;
        self.acks.remove_old();
        self.channel.remove_old();
    }

    /// Clears all state, releasing every queued message, and leaves the
    /// connection usable again.
    pub fn reset(&mut self) {
        self.time = 0.0;
        self.error = None;
        self.acks.reset();
        self.acks_dirty = false;
        self.channel.reset();
    }
}
