//! Connect tokens: see [`ConnectToken`] and [`TokenIssuer`].
//!
//! A connect token is a short-lived capability issued by a matchmaker over a
//! separate secure channel. It names the client, the servers it may join, and
//! the session keys both sides will use after the handshake. The token body
//! is sealed with a private key shared only between matchmaker and servers,
//! so the client can carry it but not read or forge it.

use std::net::SocketAddr;

use crate::{
    bits::Stream,
    config::MAX_SERVERS_PER_TOKEN,
    crypto::{self, CryptoError, Key, MAC_BYTES},
};

/// Byte length of a sealed connect token as it travels on the wire.
pub const TOKEN_BYTES: usize = 1024;

/// Byte length of the serialized (unsealed) token body, zero padded.
pub const TOKEN_BODY_BYTES: usize = TOKEN_BYTES - MAC_BYTES;

/// Longest allowed textual form of a server address.
const MAX_ADDRESS_LENGTH: usize = 64;

/// The private contents of a connect token.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectToken {
    /// Deployment the token is valid for.
    pub protocol_id: u32,
    /// Unique id of the client this token was issued to.
    pub client_id: u64,
    /// UNIX timestamp (seconds) after which the token is rejected.
    pub expiry_timestamp: u64,
    /// Servers this token may be used on, at most
    /// [`MAX_SERVERS_PER_TOKEN`].
    pub server_addresses: Vec<SocketAddr>,
    /// Session key for client-to-server packets.
    pub client_to_server_key: Key,
    /// Session key for server-to-client packets.
    pub server_to_client_key: Key,
    /// Random filler; makes even tokens with identical fields unique.
    pub random: [u8; 32],
}

/// Error sealing or opening a [`ConnectToken`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Token names no server addresses, or more than
    /// [`MAX_SERVERS_PER_TOKEN`].
    #[error("invalid server address count `{0}`")]
    AddressCount(usize),
    /// Token body failed to serialize or deserialize.
    #[error("token body serialization failed")]
    Body,
    /// A server address failed to parse on read.
    #[error("invalid server address")]
    InvalidAddress,
    /// Sealed data is not exactly [`TOKEN_BYTES`] long.
    #[error("sealed token has wrong length `{0}`")]
    Length(usize),
    /// AEAD failure opening the token.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl ConnectToken {
    /// Creates a token with fresh random session keys and filler.
    ///
    /// # Errors
    ///
    /// Errors if `server_addresses` is empty or names too many servers.
    pub fn generate(
        protocol_id: u32,
        client_id: u64,
        expiry_timestamp: u64,
        server_addresses: Vec<SocketAddr>,
    ) -> Result<Self, TokenError> {
        if server_addresses.is_empty() || server_addresses.len() > MAX_SERVERS_PER_TOKEN {
            return Err(TokenError::AddressCount(server_addresses.len()));
        }
        let mut random = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut random);
        Ok(Self {
            protocol_id,
            client_id,
            expiry_timestamp,
            server_addresses,
            client_to_server_key: Key::generate(),
            server_to_client_key: Key::generate(),
            random,
        })
    }

    fn serialize(&mut self, stream: &mut Stream) -> bool {
        if !stream.serialize_bits(&mut self.protocol_id, 32) {
            return false;
        }
        if !stream.serialize_u64(&mut self.client_id) {
            return false;
        }
        if !stream.serialize_u64(&mut self.expiry_timestamp) {
            return false;
        }

        #[allow(clippy::cast_possible_wrap)]
        let mut num_addresses = self.server_addresses.len() as i32;
        #[allow(clippy::cast_possible_wrap)]
        if !stream.serialize_int(&mut num_addresses, 1, MAX_SERVERS_PER_TOKEN as i32) {
            return false;
        }

        if stream.is_reading() {
            self.server_addresses.clear();
        }
        for i in 0..num_addresses as usize {
            let mut text = if stream.is_reading() {
                Vec::new()
            } else {
                self.server_addresses[i].to_string().into_bytes()
            };
            debug_assert!(text.len() <= MAX_ADDRESS_LENGTH);

            #[allow(clippy::cast_possible_truncation)]
            let mut length = text.len() as u32;
            if !stream.serialize_align() || !stream.serialize_bits(&mut length, 32) {
                return false;
            }
            if length as usize > MAX_ADDRESS_LENGTH {
                return false;
            }
            if stream.is_reading() {
                text.resize(length as usize, 0);
            }
            if !stream.serialize_bytes(&mut text) {
                return false;
            }
            if stream.is_reading() {
                let Some(addr) = core::str::from_utf8(&text)
                    .ok()
                    .and_then(|text| text.parse::<SocketAddr>().ok())
                else {
                    return false;
                };
                self.server_addresses.push(addr);
            }
        }

        let mut c2s = *self.client_to_server_key.as_bytes();
        let mut s2c = *self.server_to_client_key.as_bytes();
        if !stream.serialize_bytes(&mut c2s) || !stream.serialize_bytes(&mut s2c) {
            return false;
        }
        if stream.is_reading() {
            self.client_to_server_key = Key::from_bytes(c2s);
            self.server_to_client_key = Key::from_bytes(s2c);
        }

        stream.serialize_bytes(&mut self.random)
    }

    /// Serializes and seals this token to its fixed wire size.
    ///
    /// `nonce` must be unique per sealing under one private key; the issuer
    /// uses an incrementing counter. Additional data is reserved and
    /// currently empty.
    ///
    /// # Errors
    ///
    /// Errors if the token does not fit the fixed body size or sealing
    /// fails.
    pub fn encrypt(&self, nonce: u64, private_key: &Key) -> Result<[u8; TOKEN_BYTES], TokenError> {
        let mut stream = Stream::writer(TOKEN_BODY_BYTES);
        if !self.clone().serialize(&mut stream) {
            return Err(TokenError::Body);
        }
        let written = stream.into_bytes().ok_or(TokenError::Body)?;

        let mut body = [0u8; TOKEN_BODY_BYTES];
        body[..written.len()].copy_from_slice(&written);

        let sealed = crypto::seal(&body, &[], nonce, private_key)?;
        debug_assert_eq!(TOKEN_BYTES, sealed.len());
        sealed
            .try_into()
            .map_err(|sealed: Vec<u8>| TokenError::Length(sealed.len()))
    }

    /// Opens and deserializes a sealed token.
    ///
    /// # Errors
    ///
    /// Errors if the data has the wrong length, fails authentication, or
    /// deserializes to an invalid token.
    pub fn decrypt(sealed: &[u8], nonce: u64, private_key: &Key) -> Result<Self, TokenError> {
        if sealed.len() != TOKEN_BYTES {
            return Err(TokenError::Length(sealed.len()));
        }
        let body = crypto::open(sealed, &[], nonce, private_key)?;

        let mut token = Self {
            protocol_id: 0,
            client_id: 0,
            expiry_timestamp: 0,
            server_addresses: Vec::new(),
            client_to_server_key: Key::from_bytes([0u8; 32]),
            server_to_client_key: Key::from_bytes([0u8; 32]),
            random: [0u8; 32],
        };
        let mut stream = Stream::reader(&body);
        if !token.serialize(&mut stream) {
            return Err(TokenError::Body);
        }
        Ok(token)
    }
}

/// Everything the matchmaker hands a client after a successful match
/// request: the sealed token to forward to the server, plus the session keys
/// the client itself will use.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Sealed token bytes, opaque to the client.
    pub data: Box<[u8; TOKEN_BYTES]>,
    /// Nonce the token was sealed under; sent beside the token so the server
    /// can open it statelessly.
    pub nonce: u64,
    /// Servers the client may connect to.
    pub server_addresses: Vec<SocketAddr>,
    /// Session key for client-to-server packets.
    pub client_to_server_key: Key,
    /// Session key for server-to-client packets.
    pub server_to_client_key: Key,
    /// UNIX timestamp (seconds) after which the token is dead.
    pub expiry_timestamp: u64,
}

/// Matchmaker-side token mint holding the private key and nonce counter.
#[derive(Debug)]
pub struct TokenIssuer {
    private_key: Key,
    next_nonce: u64,
}

impl TokenIssuer {
    /// Creates an issuer sealing under `private_key`.
    #[must_use]
    pub const fn new(private_key: Key) -> Self {
        Self {
            private_key,
            next_nonce: 0,
        }
    }

    /// Issues a token for `client_id` valid on `server_addresses` until
    /// `now + expiry_seconds`.
    ///
    /// # Errors
    ///
    /// Errors if the address list is invalid or sealing fails.
    pub fn issue(
        &mut self,
        protocol_id: u32,
        client_id: u64,
        server_addresses: Vec<SocketAddr>,
        now: u64,
        expiry_seconds: u64,
    ) -> Result<IssuedToken, TokenError> {
        let expiry_timestamp = now + expiry_seconds;
        let token = ConnectToken::generate(
            protocol_id,
            client_id,
            expiry_timestamp,
            server_addresses.clone(),
        )?;
        let nonce = self.next_nonce;
        let data = token.encrypt(nonce, &self.private_key)?;
        self.next_nonce += 1;
        Ok(IssuedToken {
            data: Box::new(data),
            nonce,
            server_addresses,
            client_to_server_key: token.client_to_server_key.clone(),
            server_to_client_key: token.server_to_client_key.clone(),
            expiry_timestamp,
        })
    }
}
