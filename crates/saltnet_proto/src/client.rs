//! See [`Client`].

use std::net::SocketAddr;

use bytes::Bytes;
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, trace, warn};

use crate::{
    config::Config,
    connection::{Connection, ConnectionError},
    crypto,
    msg::Message,
    packet::{
        read_packet, write_packet, write_packet_raw, ConnectionRequest, DeniedReason, Packet,
        Salts,
    },
    stats::EndpointStats,
    token::IssuedToken,
};

/// A datagram an endpoint wants the host to put on the wire.
#[derive(Debug, Clone)]
pub struct Transmit {
    /// Destination address.
    pub addr: SocketAddr,
    /// Datagram contents.
    pub payload: Bytes,
}

/// Connection state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected and not trying to be.
    Disconnected,
    /// Resending connection requests, waiting for a challenge.
    SendingRequest,
    /// Resending challenge responses, waiting for confirmation.
    SendingResponse,
    /// Fully connected; payload packets flow.
    Connected,
}

/// Why a [`Client`] returned to [`ClientState::Disconnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The connect token expired before the handshake completed.
    ConnectTokenExpired,
    /// The server refused the connection.
    ConnectionDenied(DeniedReason),
    /// The established connection went silent past the timeout.
    ConnectionTimedOut,
    /// The server never confirmed our challenge response.
    ConnectionResponseTimedOut,
    /// The server sent a courtesy disconnect.
    DisconnectedByServer,
}

/// Number of courtesy disconnect packets sent on an orderly
/// [`Client::disconnect`]; redundancy against loss, since nothing acks them.
const DISCONNECT_BURST: usize = 10;

/// Client endpoint: the connecting side of the handshake plus an encrypted
/// [`Connection`] once established.
///
/// Sans-IO: drive it with [`advance_time`], feed datagrams to [`recv`], and
/// drain [`flush`] into your socket each tick.
///
/// [`advance_time`]: Client::advance_time
/// [`recv`]: Client::recv
/// [`flush`]: Client::flush
#[derive(Debug)]
pub struct Client<M> {
    config: Config,
    state: ClientState,
    server_addr: Option<SocketAddr>,
    token: Option<IssuedToken>,
    salts: Salts,
    /// AEAD sequence for client-to-server packets.
    send_sequence: u64,
    time: f64,
    last_send_time: f64,
    last_recv_time: f64,
    connection: Connection<M>,
    disconnect_reason: Option<DisconnectReason>,
    stats: EndpointStats,
    outbox: Vec<Transmit>,
}

impl<M: Message> Client<M> {
    /// Creates a disconnected client.
    ///
    /// # Panics
    ///
    /// Panics if the configuration fails [`Config::validate`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        config.validate();
        let connection = Connection::new(&config);
        Self {
            config,
            state: ClientState::Disconnected,
            server_addr: None,
            token: None,
            salts: Salts::default(),
            send_sequence: 0,
            time: 0.0,
            last_send_time: f64::NEG_INFINITY,
            last_recv_time: f64::NEG_INFINITY,
            connection,
            disconnect_reason: None,
            stats: EndpointStats::default(),
            outbox: Vec::new(),
        }
    }

    /// Current connection state.
    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Why the last connection attempt or session ended, if it failed.
    #[must_use]
    pub const fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    /// Datagram counters.
    #[must_use]
    pub const fn stats(&self) -> EndpointStats {
        self.stats
    }

    /// The `(client_salt, challenge_salt)` pair binding this session, once
    /// a challenge has been received.
    #[must_use]
    pub fn salts(&self) -> Option<(u64, u64)> {
        match self.state {
            ClientState::SendingResponse | ClientState::Connected => {
                Some((self.salts.client_salt, self.salts.challenge_salt))
            }
            _ => None,
        }
    }

    /// The reliable connection's latched error, if any.
    #[must_use]
    pub const fn error(&self) -> Option<ConnectionError> {
        self.connection.error()
    }

    /// Begins connecting to `server_addr` using a token from the matchmaker.
    ///
    /// Any previous session is dropped without a courtesy disconnect; call
    /// [`Client::disconnect`] first if the old server deserves one.
    pub fn connect(&mut self, server_addr: SocketAddr, token: IssuedToken) {
        self.reset();
        self.salts.client_salt = OsRng.next_u64();
        self.server_addr = Some(server_addr);
        self.token = Some(token);
        self.state = ClientState::SendingRequest;
        debug!(%server_addr, "connecting");
    }

    /// Orderly disconnect: bursts courtesy disconnect packets so the server
    /// frees our slot without waiting for its timeout, then resets.
    pub fn disconnect(&mut self) {
        if self.state == ClientState::Connected || self.state == ClientState::SendingResponse {
            for _ in 0..DISCONNECT_BURST {
                self.queue_cleartext(Packet::Disconnect(self.salts));
            }
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = ClientState::Disconnected;
        self.server_addr = None;
        // dropping the token zeroes the session keys
        self.token = None;
        self.salts = Salts::default();
        self.send_sequence = 0;
        self.last_send_time = f64::NEG_INFINITY;
        self.last_recv_time = f64::NEG_INFINITY;
        self.connection.reset();
        self.disconnect_reason = None;
    }

    fn fail(&mut self, reason: DisconnectReason) {
        debug!(?reason, "disconnected");
        self.reset();
        self.disconnect_reason = Some(reason);
    }

    /// Whether the send queue can accept another message.
    #[must_use]
    pub fn can_send_message(&self) -> bool {
        self.is_connected() && self.connection.can_send_message()
    }

    /// Queues a message for reliable delivery to the server.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::MessageSendQueueFull`] when disconnected or the
    /// queue is full; otherwise see [`Connection::send_message`].
    pub fn send_message(&mut self, message: M) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::MessageSendQueueFull);
        }
        self.connection.send_message(message)
    }

    /// Returns the next in-order message from the server, if any.
    pub fn receive_message(&mut self) -> Option<M> {
        if !self.is_connected() {
            return None;
        }
        self.connection.receive_message()
    }

    /// Advances the clock: runs handshake resends, payload sends,
    /// keep-alives, and timeouts.
    pub fn advance_time(&mut self, time: f64) {
        self.time = time;
        self.connection.advance_time(time);

        match self.state {
            ClientState::Disconnected => {}
            ClientState::SendingRequest => {
                let expired = self
                    .token
                    .as_ref()
                    .is_some_and(|token| {
                        #[allow(clippy::cast_precision_loss)]
                        let expiry = token.expiry_timestamp as f64;
                        time >= expiry
                    });
                if expired {
                    self.fail(DisconnectReason::ConnectTokenExpired);
                    return;
                }
                if self.last_send_time + self.config.connection_request_send_rate <= time {
                    let Some(token) = &self.token else { return };
                    let request = ConnectionRequest {
                        client_salt: self.salts.client_salt,
                        token_nonce: token.nonce,
                        token_data: token.data.clone(),
                    };
                    trace!("sending connection request");
                    self.queue_cleartext(Packet::Request(request));
                }
            }
            ClientState::SendingResponse => {
                if self.last_recv_time + self.config.connection_timeout <= time {
                    self.fail(DisconnectReason::ConnectionResponseTimedOut);
                    return;
                }
                if self.last_send_time + self.config.connection_response_send_rate <= time {
                    trace!("sending challenge response");
                    self.queue_cleartext(Packet::Response(self.salts));
                }
            }
            ClientState::Connected => {
                if self.last_recv_time + self.config.connection_timeout <= time {
                    self.fail(DisconnectReason::ConnectionTimedOut);
                    return;
                }
                if let Some(packet) = self.connection.write_packet() {
                    self.queue_encrypted(Packet::Payload(packet));
                } else if self.last_send_time + self.config.connection_keep_alive_rate <= time {
                    self.queue_cleartext(Packet::KeepAlive(self.salts));
                }
            }
        }
    }

    /// Feeds one received datagram to the client.
    pub fn recv(&mut self, from: SocketAddr, datagram: &[u8]) {
        if self.state == ClientState::Disconnected {
            return;
        }
        if self.server_addr != Some(from) {
            return;
        }
        self.stats.packets_received += 1;

        if crypto::is_encrypted(datagram) {
            self.recv_encrypted(datagram);
        } else {
            self.recv_cleartext(datagram);
        }
    }

    fn recv_encrypted(&mut self, datagram: &[u8]) {
        let Some(token) = &self.token else {
            self.stats.packets_dropped += 1;
            return;
        };
        let plaintext = match crypto::decrypt_packet(datagram, &token.server_to_client_key) {
            Ok((plaintext, _sequence)) => plaintext,
            Err(error) => {
                trace!(%error, "dropping undecryptable datagram");
                self.stats.packets_dropped += 1;
                self.stats.decrypt_failures += 1;
                return;
            }
        };
        let packet = match crate::packet::read_packet_raw::<M>(&plaintext, &self.config) {
            Ok(packet) => packet,
            Err(error) => {
                trace!(%error, "dropping malformed encrypted packet");
                self.stats.packets_dropped += 1;
                return;
            }
        };
        let Packet::Payload(payload) = packet else {
            self.stats.packets_dropped += 1;
            return;
        };

        // a payload sealed under the session key is proof the server
        // accepted us, even if its keep-alive got lost
        if self.state == ClientState::SendingResponse {
            debug!("connected (confirmed by payload packet)");
            self.state = ClientState::Connected;
        }
        if self.state != ClientState::Connected {
            self.stats.packets_dropped += 1;
            return;
        }

        self.last_recv_time = self.time;
        if let Err(error) = self.connection.read_packet(payload) {
            warn!(%error, "connection entered error state");
        }
    }

    fn recv_cleartext(&mut self, datagram: &[u8]) {
        let packet = match read_packet::<M>(datagram, &self.config) {
            Ok(packet) => packet,
            Err(error) => {
                trace!(%error, "dropping malformed datagram");
                self.stats.packets_dropped += 1;
                return;
            }
        };

        match packet {
            Packet::Challenge(salts) => {
                if self.state == ClientState::SendingRequest
                    && salts.client_salt == self.salts.client_salt
                {
                    debug!("received challenge");
                    self.salts.challenge_salt = salts.challenge_salt;
                    self.state = ClientState::SendingResponse;
                    self.last_recv_time = self.time;
                    // answer immediately rather than waiting a send interval
                    self.last_send_time = f64::NEG_INFINITY;
                }
            }
            Packet::Denied(denied) => {
                if denied.client_salt == self.salts.client_salt
                    && self.state != ClientState::Connected
                {
                    self.fail(DisconnectReason::ConnectionDenied(denied.reason));
                }
            }
            Packet::KeepAlive(salts) => {
                if salts != self.salts {
                    self.stats.packets_dropped += 1;
                    return;
                }
                if self.state == ClientState::SendingResponse {
                    debug!("connected");
                    self.state = ClientState::Connected;
                }
                if self.state == ClientState::Connected {
                    self.last_recv_time = self.time;
                }
            }
            Packet::Disconnect(salts) => {
                if salts == self.salts
                    && (self.state == ClientState::Connected
                        || self.state == ClientState::SendingResponse)
                {
                    self.fail(DisconnectReason::DisconnectedByServer);
                }
            }
            Packet::Request(_) | Packet::Response(_) | Packet::Payload(_) => {
                // client-to-server packets have no business arriving here
                self.stats.packets_dropped += 1;
            }
        }
    }

    /// Drains the datagrams queued since the last flush.
    pub fn flush(&mut self) -> impl Iterator<Item = Transmit> + '_ {
        self.outbox.drain(..)
    }

    fn queue_cleartext(&mut self, mut packet: Packet<M>) {
        let Some(addr) = self.server_addr else { return };
        let Some(payload) = write_packet(&mut packet, &self.config) else {
            warn!("failed to serialize outgoing packet");
            return;
        };
        self.last_send_time = self.time;
        self.stats.packets_sent += 1;
        self.outbox.push(Transmit { addr, payload });
    }

    fn queue_encrypted(&mut self, mut packet: Packet<M>) {
        let Some(addr) = self.server_addr else { return };
        let Some(token) = &self.token else { return };
        let Some(plaintext) = write_packet_raw(&mut packet, &self.config) else {
            warn!("failed to serialize outgoing packet");
            return;
        };
        let sequence = self.send_sequence;
        let sealed = match crypto::encrypt_packet(
            &plaintext,
            sequence,
            &token.client_to_server_key,
        ) {
            Ok(sealed) => sealed,
            Err(error) => {
                warn!(%error, "failed to encrypt outgoing packet");
                return;
            }
        };
        self.send_sequence += 1;
        self.last_send_time = self.time;
        self.stats.packets_sent += 1;
        self.outbox.push(Transmit {
            addr,
            payload: sealed,
        });
    }
}
