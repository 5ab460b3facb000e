//! Packet-level acknowledgements: see [`AckSystem`].
//!
//! Every outgoing packet carries the pair `(ack, ack_bits)` describing what
//! the sender has received so far:
//! - `ack` is the most recent received packet sequence
//! - bit `i` of `ack_bits` is set iff sequence `ack - i` has been received
//!
//! ```text
//!      ack: 40
//! ack_bits: 0b0000..00001001
//!                   ^   ^  ^
//!                   |   |  +- seq 40 (40 - 0) was received
//!                   |   +---- seq 37 (40 - 3) was received
//!                   +-------- seq 33 was NOT received
//! ```
//!
//! Sending the last 32 acknowledgements with every packet gives enough
//! redundancy that ack loss only matters if 32 consecutive packets vanish;
//! message-level resends bridge anything longer.
//!
//! See <https://gafferongames.com/post/reliable_ordered_messages/#packet-levelacks>.

use crate::{
    config::PACKET_WINDOW,
    seq::Seq,
    seq_buf::SequenceBuffer,
};

/// The `(ack, ack_bits)` pair carried by every connection packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckHeader {
    /// Most recent received packet sequence.
    pub ack: Seq,
    /// Bit `i` set iff sequence `ack - i` was received.
    pub ack_bits: u32,
}

#[derive(Debug, Clone)]
struct SentPacket {
    acked: bool,
}

#[derive(Debug, Clone)]
struct ReceivedPacket;

/// Per-connection packet sequencing and acknowledgement state.
///
/// Tracks one ring of recently sent packets (so each is acked at most once)
/// and one ring of recently received sequences (to build outgoing
/// [`AckHeader`]s). Both rings hold [`PACKET_WINDOW`] entries.
#[derive(Debug)]
pub struct AckSystem {
    sent: SequenceBuffer<SentPacket>,
    received: SequenceBuffer<ReceivedPacket>,
}

impl Default for AckSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl AckSystem {
    /// Creates empty ack state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sent: SequenceBuffer::new(PACKET_WINDOW),
            received: SequenceBuffer::new(PACKET_WINDOW),
        }
    }

    /// Sequence number the next outgoing packet will use.
    #[must_use]
    pub fn next_sequence(&self) -> Seq {
        self.sent.sequence()
    }

    /// Records that a packet with sequence `seq` is being sent, unacked.
    pub fn record_sent(&mut self, seq: Seq) {
        self.sent.insert(seq, SentPacket { acked: false });
    }

    /// Records receipt of an incoming packet sequence. Idempotent.
    pub fn record_received(&mut self, seq: Seq) {
        self.received.insert(seq, ReceivedPacket);
    }

    /// Builds the ack header reflecting everything received so far.
    #[must_use]
    pub fn header(&self) -> AckHeader {
        let ack = self.received.sequence().sub(1);
        let mut ack_bits = 0u32;
        for i in 0..32u16 {
            if self.received.exists(ack.sub(i)) {
                ack_bits |= 1 << i;
            }
        }
        AckHeader { ack, ack_bits }
    }

    /// Processes an incoming ack header, invoking `on_ack` once per sent
    /// packet newly confirmed by it.
    ///
    /// A sequence already marked acked, or one that has fallen out of the
    /// sent ring, fires nothing - each sent packet is acked at most once.
    pub fn process(&mut self, header: AckHeader, mut on_ack: impl FnMut(Seq)) {
        let mut ack_bits = header.ack_bits;
        for i in 0..32u16 {
            if ack_bits & 1 != 0 {
                let seq = header.ack.sub(i);
                if let Some(sent) = self.sent.find_mut(seq) {
                    if !sent.acked {
                        sent.acked = true;
                        on_ack(seq);
                    }
                }
            }
            ack_bits >>= 1;
        }
    }

    /// Prunes ring entries older than one full window.
    pub fn remove_old(&mut self) {
        self.sent.remove_old();
        self.received.remove_old();
    }

    /// Clears all state.
    pub fn reset(&mut self) {
        self.sent.reset();
        self.received.reset();
    }
}
