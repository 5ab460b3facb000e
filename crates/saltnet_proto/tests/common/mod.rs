//! Shared test messages and a deterministic lossy-link simulator.

#![allow(dead_code)] // not every test file uses every helper

use std::net::SocketAddr;

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use saltnet_proto::{bits::Stream, Message, Transmit};

/// Per-sequence body sizes, so messages exercise many serialized widths.
const MESSAGE_BITS: [usize; 21] = [
    1, 320, 120, 4, 256, 45, 11, 13, 101, 100, 84, 95, 203, 2, 3, 8, 512, 5, 3, 7, 50,
];

fn body_bits(sequence: u16) -> usize {
    MESSAGE_BITS[usize::from(sequence) % MESSAGE_BITS.len()]
}

/// Test traffic: small inline messages of varying size, plus opaque blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestMessage {
    /// Inline message carrying its own sequence number and filler sized by
    /// that sequence.
    Small { sequence: u16 },
    /// Block message carrying an opaque payload.
    Block(Bytes),
}

impl Message for TestMessage {
    fn kind_count() -> u32 {
        2
    }

    fn kind(&self) -> u32 {
        match self {
            Self::Small { .. } => 0,
            Self::Block(_) => 1,
        }
    }

    fn create(kind: u32) -> Option<Self> {
        match kind {
            0 => Some(Self::Small { sequence: 0 }),
            1 => Some(Self::Block(Bytes::new())),
            _ => None,
        }
    }

    fn serialize(&mut self, stream: &mut Stream) -> bool {
        let Self::Small { sequence } = self else {
            return false;
        };
        let mut value = u32::from(*sequence);
        if !stream.serialize_bits(&mut value, 16) {
            return false;
        }
        *sequence = value as u16;

        let mut remaining = body_bits(*sequence);
        let mut dummy = 0u32;
        while remaining > 0 {
            let chunk = remaining.min(32);
            if !stream.serialize_bits(&mut dummy, chunk) {
                return false;
            }
            remaining -= chunk;
        }
        stream.serialize_check(0x00C0_FFEE)
    }

    fn is_block(&self) -> bool {
        matches!(self, Self::Block(_))
    }

    fn block_data(&self) -> &Bytes {
        match self {
            Self::Block(data) => data,
            Self::Small { .. } => panic!("not a block message"),
        }
    }

    fn attach_block(&mut self, data: Bytes) {
        *self = Self::Block(data);
    }
}

/// The block payload for the `index`-th sent message: byte `i` is
/// `(index + i) mod 256`.
pub fn block_payload(index: u64, size: usize) -> Bytes {
    (0..size).map(|i| (index + i as u64) as u8).collect()
}

#[derive(Debug)]
struct InFlight {
    deliver_at: f64,
    from: SocketAddr,
    to: SocketAddr,
    payload: Bytes,
}

/// Network conditions for [`Simulator`].
#[derive(Debug, Clone, Copy)]
pub struct LinkConditions {
    /// Probability in `[0, 1]` that a datagram is dropped.
    pub loss: f64,
    /// Probability in `[0, 1]` that a datagram is delivered twice.
    pub duplicate: f64,
    /// Base one-way latency in seconds.
    pub latency: f64,
    /// Uniform jitter added to the latency, in seconds.
    pub jitter: f64,
}

/// Deterministic datagram-in-flight simulator: loss, duplication, latency,
/// jitter, and the reordering that jitter implies.
#[derive(Debug)]
pub struct Simulator {
    rng: StdRng,
    conditions: LinkConditions,
    in_flight: Vec<InFlight>,
    time: f64,
}

impl Simulator {
    pub fn new(seed: u64, conditions: LinkConditions) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            conditions,
            in_flight: Vec::new(),
            time: 0.0,
        }
    }

    /// Submits a datagram for (possible) delivery.
    pub fn send(&mut self, from: SocketAddr, transmit: &Transmit) {
        if self.rng.gen_bool(self.conditions.loss) {
            return;
        }
        let mut copies = 1;
        if self.conditions.duplicate > 0.0 && self.rng.gen_bool(self.conditions.duplicate) {
            copies = 2;
        }
        for _ in 0..copies {
            let delay = self.conditions.latency
                + if self.conditions.jitter > 0.0 {
                    self.rng.gen_range(0.0..self.conditions.jitter)
                } else {
                    0.0
                };
            self.in_flight.push(InFlight {
                deliver_at: self.time + delay,
                from,
                to: transmit.addr,
                payload: transmit.payload.clone(),
            });
        }
    }

    /// Advances the link clock and returns every datagram due for delivery,
    /// as `(from, to, payload)`.
    pub fn advance(&mut self, time: f64) -> Vec<(SocketAddr, SocketAddr, Bytes)> {
        self.time = time;
        let mut delivered = Vec::new();
        let mut index = 0;
        while index < self.in_flight.len() {
            if self.in_flight[index].deliver_at <= time {
                let packet = self.in_flight.swap_remove(index);
                delivered.push((packet.from, packet.to, packet.payload));
            } else {
                index += 1;
            }
        }
        delivered
    }
}
