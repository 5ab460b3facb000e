//! See [`Server`].

use std::net::SocketAddr;

use ahash::RandomState;
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, trace, warn};

use crate::{
    client::Transmit,
    config::{Config, CHALLENGE_TABLE_SIZE},
    connection::{Connection, ConnectionError},
    crypto::{self, Key},
    msg::Message,
    packet::{
        read_packet, write_packet, write_packet_raw, ConnectionDenied, ConnectionRequest,
        DeniedReason, Packet, Salts,
    },
    stats::EndpointStats,
    token::ConnectToken,
};

/// Number of courtesy disconnect packets sent when the server kicks a
/// client.
const DISCONNECT_BURST: usize = 10;

/// A pending challenge: issued to an address that presented a valid connect
/// token, waiting for the salted response that proves reachability.
///
/// The token's contents ride along so the slot can be populated without
/// re-decrypting anything when the response arrives.
#[derive(Debug)]
struct ChallengeEntry {
    address: SocketAddr,
    salts: Salts,
    client_id: u64,
    client_to_server_key: Key,
    server_to_client_key: Key,
    create_time: f64,
    last_send_time: f64,
}

/// One connected client.
#[derive(Debug)]
struct ClientSlot<M> {
    address: SocketAddr,
    client_id: u64,
    salts: Salts,
    #[allow(dead_code)] // reported in diagnostics dumps
    connect_time: f64,
    last_send_time: f64,
    last_recv_time: f64,
    /// Key for server-to-client packets.
    send_key: Key,
    /// Key for client-to-server packets.
    recv_key: Key,
    send_sequence: u64,
    connection: Connection<M>,
}

/// Server endpoint: validates connect tokens, runs the salted
/// challenge/response handshake, and hosts one encrypted [`Connection`] per
/// client slot.
///
/// Sans-IO: drive it with [`advance_time`], feed datagrams to [`recv`], and
/// drain [`flush`] into your socket each tick.
///
/// [`advance_time`]: Server::advance_time
/// [`recv`]: Server::recv
/// [`flush`]: Server::flush
#[derive(Debug)]
pub struct Server<M> {
    config: Config,
    /// The address clients reach us at; tokens not whitelisting it are
    /// rejected.
    public_addr: SocketAddr,
    private_key: Key,
    /// Seeded per server instance, so an attacker cannot precompute
    /// challenge-table collisions.
    hasher: RandomState,
    challenges: Box<[Option<ChallengeEntry>]>,
    slots: Vec<Option<ClientSlot<M>>>,
    num_connected: usize,
    time: f64,
    stats: EndpointStats,
    outbox: Vec<Transmit>,
}

impl<M: Message> Server<M> {
    /// Creates a server listening (logically) at `public_addr`, opening
    /// tokens with `private_key`.
    ///
    /// # Panics
    ///
    /// Panics if the configuration fails [`Config::validate`].
    #[must_use]
    pub fn new(config: Config, public_addr: SocketAddr, private_key: Key) -> Self {
        config.validate();
        let mut slots = Vec::with_capacity(config.max_clients);
        slots.resize_with(config.max_clients, || None);
        Self {
            config,
            public_addr,
            private_key,
            hasher: RandomState::with_seeds(
                OsRng.next_u64(),
                OsRng.next_u64(),
                OsRng.next_u64(),
                OsRng.next_u64(),
            ),
            challenges: (0..CHALLENGE_TABLE_SIZE).map(|_| None).collect(),
            slots,
            num_connected: 0,
            time: 0.0,
            stats: EndpointStats::default(),
            outbox: Vec::new(),
        }
    }

    /// Number of currently connected clients.
    #[must_use]
    pub const fn client_count(&self) -> usize {
        self.num_connected
    }

    /// Datagram counters.
    #[must_use]
    pub const fn stats(&self) -> EndpointStats {
        self.stats
    }

    /// Whether slot `index` holds a connected client.
    #[must_use]
    pub fn is_client_connected(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    /// The client id occupying slot `index`, if connected.
    #[must_use]
    pub fn client_id(&self, index: usize) -> Option<u64> {
        self.slots.get(index)?.as_ref().map(|slot| slot.client_id)
    }

    /// The address of the client in slot `index`, if connected.
    #[must_use]
    pub fn client_address(&self, index: usize) -> Option<SocketAddr> {
        self.slots.get(index)?.as_ref().map(|slot| slot.address)
    }

    /// The salt pair bound to slot `index`, if connected.
    #[must_use]
    pub fn client_salts(&self, index: usize) -> Option<(u64, u64)> {
        self.slots.get(index)?.as_ref().map(|slot| {
            (slot.salts.client_salt, slot.salts.challenge_salt)
        })
    }

    /// The latched connection error of slot `index`, if any.
    #[must_use]
    pub fn client_error(&self, index: usize) -> Option<ConnectionError> {
        self.slots.get(index)?.as_ref().and_then(|slot| slot.connection.error())
    }

    /// Queues a message for reliable delivery to the client in slot
    /// `index`.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::MessageSendQueueFull`] if the slot is empty;
    /// otherwise see [`Connection::send_message`].
    pub fn send_message(&mut self, index: usize, message: M) -> Result<(), ConnectionError> {
        let Some(Some(slot)) = self.slots.get_mut(index) else {
            return Err(ConnectionError::MessageSendQueueFull);
        };
        slot.connection.send_message(message)
    }

    /// Returns the next in-order message from the client in slot `index`.
    pub fn receive_message(&mut self, index: usize) -> Option<M> {
        let Some(Some(slot)) = self.slots.get_mut(index) else {
            return None;
        };
        slot.connection.receive_message()
    }

    /// Kicks the client in slot `index` with a courtesy disconnect burst.
    pub fn disconnect_client(&mut self, index: usize) {
        let Some(Some(slot)) = self.slots.get(index) else {
            return;
        };
        let address = slot.address;
        let salts = slot.salts;
        for _ in 0..DISCONNECT_BURST {
            self.queue_cleartext(address, Packet::Disconnect(salts));
        }
        self.free_slot(index);
    }

    /// Advances the clock: sends per-client payload packets and keep-alives,
    /// times out quiet slots, and expires stale challenge entries.
    pub fn advance_time(&mut self, time: f64) {
        self.time = time;

        for index in 0..self.slots.len() {
            let Some(slot) = &mut self.slots[index] else {
                continue;
            };
            slot.connection.advance_time(time);

            if slot.last_recv_time + self.config.connection_timeout <= time {
                debug!(index, client_id = slot.client_id, "client timed out");
                self.free_slot(index);
                continue;
            }

            if let Some(packet) = slot.connection.write_packet() {
                Self::queue_encrypted_to(
                    &mut self.outbox,
                    &mut self.stats,
                    &self.config,
                    slot,
                    Packet::Payload(packet),
                    time,
                );
            } else if slot.last_send_time + self.config.connection_keep_alive_rate <= time {
                let address = slot.address;
                let salts = slot.salts;
                slot.last_send_time = time;
                self.queue_cleartext(address, Packet::KeepAlive(salts));
            }
        }

        for entry in &mut *self.challenges {
            let expired = entry
                .as_ref()
                .is_some_and(|entry| entry.create_time + self.config.challenge_timeout <= time);
            if expired {
                *entry = None;
            }
        }
    }

    /// Feeds one received datagram to the server.
    pub fn recv(&mut self, from: SocketAddr, datagram: &[u8]) {
        self.stats.packets_received += 1;

        if crypto::is_encrypted(datagram) {
            self.recv_encrypted(from, datagram);
        } else {
            self.recv_cleartext(from, datagram);
        }
    }

    /// Drains the datagrams queued since the last flush.
    pub fn flush(&mut self) -> impl Iterator<Item = Transmit> + '_ {
        self.outbox.drain(..)
    }

    fn recv_encrypted(&mut self, from: SocketAddr, datagram: &[u8]) {
        let Some(index) = self.slot_index_by_addr(from) else {
            self.stats.packets_dropped += 1;
            return;
        };
        let Some(slot) = &mut self.slots[index] else {
            return;
        };

        let plaintext = match crypto::decrypt_packet(datagram, &slot.recv_key) {
            Ok((plaintext, _sequence)) => plaintext,
            Err(error) => {
                trace!(%error, %from, "dropping undecryptable datagram");
                self.stats.packets_dropped += 1;
                self.stats.decrypt_failures += 1;
                return;
            }
        };
        let packet = match crate::packet::read_packet_raw::<M>(&plaintext, &self.config) {
            Ok(packet) => packet,
            Err(error) => {
                trace!(%error, %from, "dropping malformed encrypted packet");
                self.stats.packets_dropped += 1;
                return;
            }
        };
        let Packet::Payload(payload) = packet else {
            self.stats.packets_dropped += 1;
            return;
        };

        slot.last_recv_time = self.time;
        if let Err(error) = slot.connection.read_packet(payload) {
            warn!(%error, index, "client connection entered error state");
        }
    }

    fn recv_cleartext(&mut self, from: SocketAddr, datagram: &[u8]) {
        let packet = match read_packet::<M>(datagram, &self.config) {
            Ok(packet) => packet,
            Err(error) => {
                trace!(%error, %from, "dropping malformed datagram");
                self.stats.packets_dropped += 1;
                return;
            }
        };

        match packet {
            Packet::Request(request) => self.process_request(from, &request),
            Packet::Response(salts) => self.process_response(from, salts),
            Packet::KeepAlive(salts) => {
                // only a fully authenticated salt triple may refresh a slot
                if let Some(index) = self.slot_index_by_salts(from, salts) {
                    if let Some(slot) = &mut self.slots[index] {
                        slot.last_recv_time = self.time;
                    }
                }
            }
            Packet::Disconnect(salts) => {
                if let Some(index) = self.slot_index_by_salts(from, salts) {
                    debug!(index, "client disconnected");
                    self.free_slot(index);
                }
            }
            Packet::Denied(_) | Packet::Challenge(_) | Packet::Payload(_) => {
                self.stats.packets_dropped += 1;
            }
        }
    }

    fn process_request(&mut self, from: SocketAddr, request: &ConnectionRequest) {
        let token = match ConnectToken::decrypt(
            &request.token_data[..],
            request.token_nonce,
            &self.private_key,
        ) {
            Ok(token) => token,
            Err(error) => {
                debug!(%error, %from, "rejecting request with bad token");
                self.stats.packets_dropped += 1;
                return;
            }
        };

        if token.protocol_id != self.config.protocol_id {
            debug!(%from, "rejecting token for wrong protocol");
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        if self.time >= token.expiry_timestamp as f64 {
            debug!(%from, "rejecting expired token");
            return;
        }
        if !token.server_addresses.contains(&self.public_addr) {
            debug!(%from, "rejecting token not issued for this server");
            return;
        }

        if self
            .slot_index_by_request(from, request.client_salt)
            .is_some()
        {
            self.queue_cleartext(
                from,
                Packet::Denied(ConnectionDenied {
                    client_salt: request.client_salt,
                    reason: DeniedReason::AlreadyConnected,
                }),
            );
            return;
        }
        if self.num_connected == self.config.max_clients {
            debug!(%from, "denying request: server full");
            self.queue_cleartext(
                from,
                Packet::Denied(ConnectionDenied {
                    client_salt: request.client_salt,
                    reason: DeniedReason::ServerFull,
                }),
            );
            return;
        }

        let time = self.time;
        let challenge_send_rate = self.config.challenge_send_rate;
        let Some(entry) = self.find_or_insert_challenge(from, request.client_salt, &token) else {
            return;
        };
        if entry.last_send_time + challenge_send_rate <= time {
            entry.last_send_time = time;
            let salts = entry.salts;
            trace!(%from, "sending challenge");
            self.queue_cleartext(from, Packet::Challenge(salts));
        }
    }

    fn process_response(&mut self, from: SocketAddr, salts: Salts) {
        // a duplicate response for a client we already connected means our
        // keep-alive was lost; resend it instead of allocating a new slot
        if let Some(index) = self.slot_index_by_salts(from, salts) {
            let Some(slot) = &mut self.slots[index] else {
                return;
            };
            if slot.last_send_time + self.config.challenge_send_rate <= self.time {
                slot.last_send_time = self.time;
                let address = slot.address;
                self.queue_cleartext(address, Packet::KeepAlive(salts));
            }
            return;
        }

        let index = self.challenge_index(from, salts.client_salt);
        let Some(entry) = &self.challenges[index] else {
            return;
        };
        if entry.address != from || entry.salts.client_salt != salts.client_salt {
            return;
        }
        if entry.salts.challenge_salt != salts.challenge_salt {
            warn!(%from, "challenge salt mismatch in response");
            return;
        }

        if self.num_connected == self.config.max_clients {
            self.queue_cleartext(
                from,
                Packet::Denied(ConnectionDenied {
                    client_salt: salts.client_salt,
                    reason: DeniedReason::ServerFull,
                }),
            );
            return;
        }
        let Some(slot_index) = self.slots.iter().position(Option::is_none) else {
            return;
        };

        let entry = self.challenges[index]
            .as_ref()
            .expect("entry checked above");
        debug!(
            slot_index,
            client_id = entry.client_id,
            %from,
            "client connected"
        );
        self.slots[slot_index] = Some(ClientSlot {
            address: from,
            client_id: entry.client_id,
            salts,
            connect_time: self.time,
            last_send_time: self.time,
            last_recv_time: self.time,
            send_key: entry.server_to_client_key.clone(),
            recv_key: entry.client_to_server_key.clone(),
            send_sequence: 0,
            connection: Connection::new(&self.config),
        });
        self.num_connected += 1;

        self.queue_cleartext(from, Packet::KeepAlive(salts));
    }

    fn challenge_index(&self, address: SocketAddr, client_salt: u64) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.hasher.hash_one((address, client_salt)) as usize % CHALLENGE_TABLE_SIZE
        }
    }

    fn find_or_insert_challenge(
        &mut self,
        address: SocketAddr,
        client_salt: u64,
        token: &ConnectToken,
    ) -> Option<&mut ChallengeEntry> {
        let index = self.challenge_index(address, client_salt);
        let slot = &mut self.challenges[index];

        let reusable = match slot {
            None => true,
            // an expired entry may be overwritten
            Some(entry) => entry.create_time + self.config.challenge_timeout <= self.time,
        };
        if reusable {
            *slot = Some(ChallengeEntry {
                address,
                salts: Salts {
                    client_salt,
                    challenge_salt: OsRng.next_u64(),
                },
                client_id: token.client_id,
                client_to_server_key: token.client_to_server_key.clone(),
                server_to_client_key: token.server_to_client_key.clone(),
                create_time: self.time,
                // backdated so the first challenge goes out immediately
                last_send_time: self.time - self.config.challenge_send_rate * 2.0,
            });
            return slot.as_mut();
        }

        let entry = slot.as_mut().expect("occupied checked above");
        if entry.address == address && entry.salts.client_salt == client_salt {
            return Some(entry);
        }
        // a live challenge owned by someone else is never evicted
        warn!(%address, "challenge table collision, dropping request");
        None
    }

    fn slot_index_by_addr(&self, address: SocketAddr) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref().is_some_and(|slot| slot.address == address)
        })
    }

    fn slot_index_by_request(&self, address: SocketAddr, client_salt: u64) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref().is_some_and(|slot| {
                slot.address == address && slot.salts.client_salt == client_salt
            })
        })
    }

    fn slot_index_by_salts(&self, address: SocketAddr, salts: Salts) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|slot| slot.address == address && slot.salts == salts)
        })
    }

    fn free_slot(&mut self, index: usize) {
        if self.slots[index].take().is_some() {
            self.num_connected -= 1;
        }
    }

    fn queue_cleartext(&mut self, addr: SocketAddr, mut packet: Packet<M>) {
        let Some(payload) = write_packet(&mut packet, &self.config) else {
            warn!("failed to serialize outgoing packet");
            return;
        };
        self.stats.packets_sent += 1;
        self.outbox.push(Transmit { addr, payload });
    }

    fn queue_encrypted_to(
        outbox: &mut Vec<Transmit>,
        stats: &mut EndpointStats,
        config: &Config,
        slot: &mut ClientSlot<M>,
        mut packet: Packet<M>,
        time: f64,
    ) {
        let Some(plaintext) = write_packet_raw(&mut packet, config) else {
            warn!("failed to serialize outgoing packet");
            return;
        };
        let sealed = match crypto::encrypt_packet(&plaintext, slot.send_sequence, &slot.send_key)
        {
            Ok(sealed) => sealed,
            Err(error) => {
                warn!(%error, "failed to encrypt outgoing packet");
                return;
            }
        };
        slot.send_sequence += 1;
        slot.last_send_time = time;
        stats.packets_sent += 1;
        outbox.push(Transmit {
            addr: slot.address,
            payload: sealed,
        });
    }
}
