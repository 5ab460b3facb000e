//! Outer datagram framing: see [`Packet`], [`write_packet`], [`read_packet`].
//!
//! Cleartext datagrams are framed as:
//!
//! ```text
//! [ crc32 : 4 bytes BE ][ type : 3 bits ][ body ][ check : 32 bits ]
//! ```
//!
//! The CRC is computed over the whole datagram with its own field zeroed and
//! the protocol id fed in first as salt, so packets from a different
//! deployment (or protocol version) fail the checksum without the id ever
//! traveling on the wire. The trailing check magic is the protocol id again,
//! bit-aligned, catching serializer desyncs that happen to preserve the CRC
//! domain.
//!
//! Raw mode drops the CRC and check and is used for the plaintext inside
//! AEAD-sealed datagrams, which carry their own authentication.

use bytes::Bytes;

use crate::{
    bits::Stream,
    config::Config,
    connection::ConnectionPacket,
    msg::Message,
    token::TOKEN_BYTES,
};

/// Number of distinct packet types.
pub const NUM_PACKET_TYPES: u32 = 7;

/// Serialized size of everything in a connection request except the padding:
/// framing, salts, nonce, and token. Padding fills the rest of
/// [`Config::max_packet_size`].
const REQUEST_UNPADDED_BYTES: usize = 64 + TOKEN_BYTES;

/// Byte length of the zero padding in a connection request.
#[must_use]
pub(crate) fn request_pad_bytes(config: &Config) -> usize {
    config.max_packet_size.saturating_sub(REQUEST_UNPADDED_BYTES)
}

/// Client-to-server connection request: the sealed connect token plus the
/// client's salt, padded out to the full packet size so the protocol cannot
/// be used for traffic amplification.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// Random salt chosen by the client for this connection attempt.
    pub client_salt: u64,
    /// Nonce the matchmaker sealed the token under.
    pub token_nonce: u64,
    /// The sealed connect token, opaque to the client.
    pub token_data: Box<[u8; TOKEN_BYTES]>,
}

impl ConnectionRequest {
    fn serialize(&mut self, stream: &mut Stream, config: &Config) -> bool {
        if !stream.serialize_u64(&mut self.client_salt)
            || !stream.serialize_u64(&mut self.token_nonce)
            || !stream.serialize_bytes(&mut self.token_data[..])
        {
            return false;
        }
        // a short request is dropped here, before any token cryptography
        let mut pad = vec![0u8; request_pad_bytes(config)];
        stream.serialize_bytes(&mut pad)
    }
}

/// Reason a server refused a connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeniedReason {
    /// Every client slot is occupied.
    ServerFull,
    /// A connection for this address and client salt already exists.
    AlreadyConnected,
}

/// Server-to-client refusal of a connection request.
#[derive(Debug, Clone)]
pub struct ConnectionDenied {
    /// Salt of the request being refused.
    pub client_salt: u64,
    /// Why the request was refused.
    pub reason: DeniedReason,
}

impl ConnectionDenied {
    fn serialize(&mut self, stream: &mut Stream) -> bool {
        if !stream.serialize_u64(&mut self.client_salt) {
            return false;
        }
        let mut reason = match self.reason {
            DeniedReason::ServerFull => 0i32,
            DeniedReason::AlreadyConnected => 1,
        };
        if !stream.serialize_int(&mut reason, 0, 1) {
            return false;
        }
        self.reason = if reason == 0 {
            DeniedReason::ServerFull
        } else {
            DeniedReason::AlreadyConnected
        };
        true
    }
}

/// The salt pair binding a connection: the client-chosen salt from the
/// request and the server-chosen salt from the challenge. Carried by every
/// handshake packet after the request, so neither side can be impersonated
/// by an attacker who only spoofs source addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Salts {
    /// Random salt chosen by the client.
    pub client_salt: u64,
    /// Random salt chosen by the server.
    pub challenge_salt: u64,
}

impl Salts {
    fn serialize(&mut self, stream: &mut Stream) -> bool {
        stream.serialize_u64(&mut self.client_salt)
            && stream.serialize_u64(&mut self.challenge_salt)
    }
}

/// Every packet type of the protocol, cleartext handshake and encrypted
/// payload alike.
#[derive(Debug, Clone)]
pub enum Packet<M> {
    /// Client requests a connection with a sealed token.
    Request(ConnectionRequest),
    /// Server refuses a connection request.
    Denied(ConnectionDenied),
    /// Server answers a request with its challenge salt.
    Challenge(Salts),
    /// Client echoes both salts, proving it received the challenge at its
    /// claimed address.
    Response(Salts),
    /// Either side signals liveness on an otherwise quiet connection.
    KeepAlive(Salts),
    /// Courtesy notice that the sender is going away.
    Disconnect(Salts),
    /// Connection engine traffic: acks, messages, block fragments.
    Payload(ConnectionPacket<M>),
}

impl<M: Message> Packet<M> {
    /// Type tag of this packet.
    #[must_use]
    pub const fn kind(&self) -> u32 {
        match self {
            Self::Request(_) => 0,
            Self::Denied(_) => 1,
            Self::Challenge(_) => 2,
            Self::Response(_) => 3,
            Self::KeepAlive(_) => 4,
            Self::Disconnect(_) => 5,
            Self::Payload(_) => 6,
        }
    }

    fn create(kind: u32) -> Option<Self> {
        match kind {
            0 => Some(Self::Request(ConnectionRequest {
                client_salt: 0,
                token_nonce: 0,
                token_data: Box::new([0u8; TOKEN_BYTES]),
            })),
            1 => Some(Self::Denied(ConnectionDenied {
                client_salt: 0,
                reason: DeniedReason::ServerFull,
            })),
            2 => Some(Self::Challenge(Salts::default())),
            3 => Some(Self::Response(Salts::default())),
            4 => Some(Self::KeepAlive(Salts::default())),
            5 => Some(Self::Disconnect(Salts::default())),
            6 => Some(Self::Payload(ConnectionPacket::new())),
            _ => None,
        }
    }

    fn serialize_body(&mut self, stream: &mut Stream, config: &Config) -> bool {
        match self {
            Self::Request(request) => request.serialize(stream, config),
            Self::Denied(denied) => denied.serialize(stream),
            Self::Challenge(salts)
            | Self::Response(salts)
            | Self::KeepAlive(salts)
            | Self::Disconnect(salts) => salts.serialize(stream),
            Self::Payload(payload) => payload.serialize(stream, config),
        }
    }
}

/// Error reading an incoming datagram. All of these mean the datagram is
/// dropped; none are fatal to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadPacketError {
    /// Datagram too short to hold the frame.
    #[error("packet too small")]
    TooSmall,
    /// Checksum mismatch: corruption, or a different protocol id.
    #[error("crc32 mismatch")]
    CrcMismatch,
    /// Type tag out of range.
    #[error("invalid packet type")]
    InvalidType,
    /// Type tag in range but no packet could be constructed for it.
    #[error("failed to create packet")]
    CreateFailed,
    /// Body failed to deserialize.
    #[error("packet body serialize failed")]
    BodySerializeFailed,
    /// Trailing check magic missing or wrong.
    #[error("packet check failed")]
    CheckFailed,
}

fn crc32(config: &Config, zeroed_head: &[u8], tail: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&config.protocol_id.to_le_bytes());
    hasher.update(zeroed_head);
    hasher.update(tail);
    hasher.finalize()
}

fn serialize_type<M: Message>(stream: &mut Stream, packet: Option<&Packet<M>>) -> Option<u32> {
    #[allow(clippy::cast_possible_wrap)]
    let mut kind = packet.map_or(0, |packet| packet.kind() as i32);
    #[allow(clippy::cast_possible_wrap)]
    if !stream.serialize_int(&mut kind, 0, NUM_PACKET_TYPES as i32) {
        return None;
    }
    #[allow(clippy::cast_sign_loss)]
    Some(kind as u32)
}

/// Serializes a packet in framed (cleartext) mode.
///
/// Returns `None` if the packet does not fit the configured maximum size.
#[must_use]
pub fn write_packet<M: Message>(packet: &mut Packet<M>, config: &Config) -> Option<Bytes> {
    let mut stream = Stream::writer(config.max_packet_size);
    let mut crc_field = 0u32;
    if !stream.serialize_bits(&mut crc_field, 32) {
        return None;
    }
    serialize_type(&mut stream, Some(packet))?;
    if !packet.serialize_body(&mut stream, config) {
        return None;
    }
    if !stream.serialize_check(config.protocol_id) {
        return None;
    }

    let data = stream.into_bytes()?;
    let crc = crc32(config, &[0u8; 4], &data[4..]);
    let mut data = data.to_vec();
    data[..4].copy_from_slice(&crc.to_be_bytes());
    Some(Bytes::from(data))
}

/// Reads a packet in framed (cleartext) mode.
///
/// # Errors
///
/// Any [`ReadPacketError`]; the caller drops the datagram.
pub fn read_packet<M: Message>(
    data: &[u8],
    config: &Config,
) -> Result<Packet<M>, ReadPacketError> {
    if data.len() < 9 {
        return Err(ReadPacketError::TooSmall);
    }

    let wire_crc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if wire_crc != crc32(config, &[0u8; 4], &data[4..]) {
        return Err(ReadPacketError::CrcMismatch);
    }

    let mut stream = Stream::reader(data);
    let mut crc_field = 0u32;
    if !stream.serialize_bits(&mut crc_field, 32) {
        return Err(ReadPacketError::TooSmall);
    }

    read_body(&mut stream, config, true)
}

/// Serializes a packet in raw mode: no CRC, no trailing check. Used for the
/// plaintext inside encrypted datagrams.
///
/// Returns `None` if the packet does not fit the configured maximum size.
#[must_use]
pub fn write_packet_raw<M: Message>(packet: &mut Packet<M>, config: &Config) -> Option<Bytes> {
    let mut stream = Stream::writer(config.max_packet_size);
    serialize_type(&mut stream, Some(packet))?;
    if !packet.serialize_body(&mut stream, config) {
        return None;
    }
    stream.into_bytes()
}

/// Reads a packet in raw mode.
///
/// # Errors
///
/// Any [`ReadPacketError`]; the caller drops the datagram.
pub fn read_packet_raw<M: Message>(
    data: &[u8],
    config: &Config,
) -> Result<Packet<M>, ReadPacketError> {
    if data.is_empty() {
        return Err(ReadPacketError::TooSmall);
    }
    let mut stream = Stream::reader(data);
    read_body(&mut stream, config, false)
}

fn read_body<M: Message>(
    stream: &mut Stream,
    config: &Config,
    check: bool,
) -> Result<Packet<M>, ReadPacketError> {
    let kind = serialize_type::<M>(stream, None).ok_or(ReadPacketError::InvalidType)?;
    if kind >= NUM_PACKET_TYPES {
        return Err(ReadPacketError::InvalidType);
    }
    let mut packet = Packet::create(kind).ok_or(ReadPacketError::CreateFailed)?;
    if !packet.serialize_body(stream, config) {
        return Err(ReadPacketError::BodySerializeFailed);
    }
    if check && !stream.serialize_check(config.protocol_id) {
        return Err(ReadPacketError::CheckFailed);
    }
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// Packet tests never touch message bodies, so a unit message suffices.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct NoMessage;

    impl Message for NoMessage {
        fn kind_count() -> u32 {
            1
        }

        fn kind(&self) -> u32 {
            0
        }

        fn create(kind: u32) -> Option<Self> {
            (kind == 0).then_some(Self)
        }

        fn serialize(&mut self, _stream: &mut Stream) -> bool {
            true
        }
    }

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn salts_round_trip_framed() {
        let config = config();
        let salts = Salts {
            client_salt: 0x1111_2222_3333_4444,
            challenge_salt: 0x5555_6666_7777_8888,
        };
        let mut packet = Packet::<NoMessage>::Challenge(salts);
        let data = write_packet(&mut packet, &config).unwrap();

        let read = read_packet::<NoMessage>(&data, &config).unwrap();
        assert_matches!(read, Packet::Challenge(got) if got == salts);
    }

    #[test]
    fn request_is_padded_to_max_packet_size() {
        let config = config();
        let mut packet = Packet::<NoMessage>::Request(ConnectionRequest {
            client_salt: 1,
            token_nonce: 2,
            token_data: Box::new([0xAA; TOKEN_BYTES]),
        });
        let data = write_packet(&mut packet, &config).unwrap();
        assert!(data.len() + 64 >= config.max_packet_size);

        let read = read_packet::<NoMessage>(&data, &config).unwrap();
        assert_matches!(read, Packet::Request(request) => {
            assert_eq!(1, request.client_salt);
            assert_eq!(2, request.token_nonce);
            assert_eq!([0xAA; TOKEN_BYTES], *request.token_data);
        });
    }

    #[test]
    fn truncated_request_rejected() {
        let config = config();
        let mut packet = Packet::<NoMessage>::Request(ConnectionRequest {
            client_salt: 1,
            token_nonce: 2,
            token_data: Box::new([0u8; TOKEN_BYTES]),
        });
        let data = write_packet(&mut packet, &config).unwrap();

        // a short request must fail before any token work happens; simulate
        // an attacker truncating the padding
        let truncated = &data[..TOKEN_BYTES + 32];
        // CRC no longer matches the truncated data
        assert_matches!(
            read_packet::<NoMessage>(truncated, &config),
            Err(ReadPacketError::CrcMismatch)
        );
    }

    #[test]
    fn corruption_fails_crc() {
        let config = config();
        let mut packet = Packet::<NoMessage>::KeepAlive(Salts::default());
        let data = write_packet(&mut packet, &config).unwrap();

        for i in 0..data.len() {
            let mut corrupt = data.to_vec();
            corrupt[i] ^= 0x04;
            assert_matches!(
                read_packet::<NoMessage>(&corrupt, &config),
                Err(ReadPacketError::CrcMismatch)
            );
        }
    }

    #[test]
    fn wrong_protocol_id_fails_crc() {
        let config = config();
        let mut packet = Packet::<NoMessage>::KeepAlive(Salts::default());
        let data = write_packet(&mut packet, &config).unwrap();

        let other = Config {
            protocol_id: config.protocol_id + 1,
            ..config
        };
        assert_matches!(
            read_packet::<NoMessage>(&data, &other),
            Err(ReadPacketError::CrcMismatch)
        );
    }

    #[test]
    fn denied_reasons_round_trip() {
        let config = config();
        for reason in [DeniedReason::ServerFull, DeniedReason::AlreadyConnected] {
            let mut packet = Packet::<NoMessage>::Denied(ConnectionDenied {
                client_salt: 9,
                reason,
            });
            let data = write_packet(&mut packet, &config).unwrap();
            let read = read_packet::<NoMessage>(&data, &config).unwrap();
            assert_matches!(read, Packet::Denied(denied) => {
                assert_eq!(9, denied.client_salt);
                assert_eq!(reason, denied.reason);
            });
        }
    }

    #[test]
    fn raw_mode_round_trip() {
        let config = config();
        let mut packet = Packet::<NoMessage>::KeepAlive(Salts {
            client_salt: 3,
            challenge_salt: 4,
        });
        let data = write_packet_raw(&mut packet, &config).unwrap();
        // raw frames are much smaller than framed ones: no crc, no check
        assert!(data.len() < 20);

        let read = read_packet_raw::<NoMessage>(&data, &config).unwrap();
        assert_matches!(read, Packet::KeepAlive(salts) => {
            assert_eq!(3, salts.client_salt);
            assert_eq!(4, salts.challenge_salt);
        });
    }

    #[test]
    fn empty_datagram_too_small() {
        let config = config();
        assert_matches!(
            read_packet::<NoMessage>(&[], &config),
            Err(ReadPacketError::TooSmall)
        );
        assert_matches!(
            read_packet_raw::<NoMessage>(&[], &config),
            Err(ReadPacketError::TooSmall)
        );
    }
}
