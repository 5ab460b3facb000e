//! See [`Config`].

use static_assertions::const_assert;

/// Sequence window for the sent/received packet rings.
pub const PACKET_WINDOW: usize = 256;

/// Maximum number of messages a single packet may carry.
pub const MAX_MESSAGES_PER_PACKET: usize = 64;

/// Number of slots in the server's challenge table.
pub const CHALLENGE_TABLE_SIZE: usize = 1024;

/// Maximum number of server addresses a connect token may whitelist.
pub const MAX_SERVERS_PER_TOKEN: usize = 8;

const_assert!(65536 % PACKET_WINDOW == 0);
const_assert!(PACKET_WINDOW > 32); // must cover the ack bitfield

/// Tunables for a protocol endpoint.
///
/// The defaults match the reference deployment; every field can be overridden
/// before constructing a [`Client`], [`Server`], or [`Connection`]. Rates and
/// timeouts are in seconds on the same timeline the host passes to
/// `advance_time`.
///
/// [`Client`]: crate::client::Client
/// [`Server`]: crate::server::Server
/// [`Connection`]: crate::connection::Connection
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum number of simultaneously connected clients on a server.
    pub max_clients: usize,
    /// UDP port the server binds; carried in issued connect tokens.
    pub server_port: u16,
    /// Protocol id unique to this deployment. Packets from other deployments
    /// (or other versions) fail the CRC and check magic and are dropped.
    pub protocol_id: u32,
    /// Lifetime of an issued connect token, in seconds.
    pub connect_token_expiry_seconds: u64,
    /// Minimum interval between challenge packets sent to one address.
    pub challenge_send_rate: f64,
    /// Seconds after which an unanswered challenge entry expires.
    pub challenge_timeout: f64,
    /// Interval between connection request resends while handshaking.
    pub connection_request_send_rate: f64,
    /// Interval between challenge response resends while handshaking.
    pub connection_response_send_rate: f64,
    /// Interval between keep-alive packets on an otherwise quiet connection.
    pub connection_keep_alive_rate: f64,
    /// Seconds of receive silence after which a connection is closed.
    pub connection_timeout: f64,
    /// Maximum size of a serialized packet, header and body, in bytes.
    pub max_packet_size: usize,
    /// Capacity of the message send queue. Must divide 65536.
    pub send_queue_size: usize,
    /// Capacity of the message receive queue. Must divide 65536.
    pub receive_queue_size: usize,
    /// Interval before an unacked message is eligible for resend.
    pub message_resend_rate: f64,
    /// Interval before an unacked block fragment is eligible for resend.
    pub fragment_resend_rate: f64,
    /// Maximum byte size of a block message payload.
    pub max_block_size: usize,
    /// Byte size of a block fragment; every fragment but the last is exactly
    /// this long.
    pub fragment_size: usize,
    /// Byte budget for the message section of a single packet.
    pub message_packet_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_clients: 32,
            server_port: 50000,
            protocol_id: 0x1234_1651,
            connect_token_expiry_seconds: 30,
            challenge_send_rate: 0.1,
            challenge_timeout: 10.0,
            connection_request_send_rate: 0.1,
            connection_response_send_rate: 0.1,
            connection_keep_alive_rate: 1.0,
            connection_timeout: 10.0,
            max_packet_size: 4096,
            send_queue_size: 1024,
            receive_queue_size: 256,
            message_resend_rate: 0.1,
            fragment_resend_rate: 0.1,
            max_block_size: 256 * 1024,
            fragment_size: 1024,
            message_packet_budget: 1024,
        }
    }
}

impl Config {
    /// Number of fragments the largest allowed block splits into.
    #[must_use]
    pub fn max_fragments_per_block(&self) -> usize {
        (self.max_block_size + self.fragment_size - 1) / self.fragment_size
    }

    /// Checks internal consistency of the configuration.
    ///
    /// # Panics
    ///
    /// Panics on an unusable configuration: zero queue sizes, queue sizes
    /// that do not divide 65536, or a fragment size of zero.
    pub fn validate(&self) {
        assert!(self.max_clients > 0);
        assert!(self.send_queue_size > 0 && self.send_queue_size < 65536);
        assert!(65536 % self.send_queue_size == 0);
        assert!(self.receive_queue_size > 0 && self.receive_queue_size < 65536);
        assert!(65536 % self.receive_queue_size == 0);
        assert!(self.fragment_size > 0);
        assert!(self.max_block_size > 0);
        assert!(self.max_fragments_per_block() <= 65536);
        assert!(self.message_packet_budget <= self.max_packet_size);
    }
}
