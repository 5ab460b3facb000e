//! Token issue, handshake, and secure transport scenarios, client and
//! server driven together over a direct (lossless) link.

mod common;

use std::net::SocketAddr;

use common::TestMessage;
use saltnet_proto::{
    Client, ClientState, Config, DisconnectReason, Key, Server, TokenIssuer,
};
use saltnet_proto::packet::DeniedReason;

fn server_addr() -> SocketAddr {
    "[::1]:50000".parse().unwrap()
}

fn client_addr() -> SocketAddr {
    "[::1]:60000".parse().unwrap()
}

/// The wall-clock origin for these scenarios; tokens are stamped against
/// the same timeline the endpoints tick on.
const T0: f64 = 1_000_000.0;

struct Harness {
    config: Config,
    issuer: TokenIssuer,
    server: Server<TestMessage>,
    client: Client<TestMessage>,
    time: f64,
}

impl Harness {
    fn new(config: Config) -> Self {
        let private_key = Key::generate();
        Self {
            issuer: TokenIssuer::new(private_key.clone()),
            server: Server::new(config.clone(), server_addr(), private_key),
            client: Client::new(config.clone()),
            config,
            time: T0,
        }
    }

    fn connect_client(&mut self, client_id: u64) {
        let token = self
            .issuer
            .issue(
                self.config.protocol_id,
                client_id,
                vec![server_addr()],
                self.time as u64,
                self.config.connect_token_expiry_seconds,
            )
            .unwrap();
        self.client.connect(server_addr(), token);
    }

    /// One 100 ms tick: advance both endpoints and deliver every datagram
    /// directly.
    fn tick(&mut self) {
        self.time += 0.1;
        self.client.advance_time(self.time);
        self.server.advance_time(self.time);

        let to_server: Vec<_> = self.client.flush().collect();
        for transmit in to_server {
            assert_eq!(server_addr(), transmit.addr);
            self.server.recv(client_addr(), &transmit.payload);
        }
        let to_client: Vec<_> = self.server.flush().collect();
        for transmit in to_client {
            assert_eq!(client_addr(), transmit.addr);
            self.client.recv(server_addr(), &transmit.payload);
        }
    }

    fn tick_until(&mut self, max_ticks: usize, mut done: impl FnMut(&mut Self) -> bool) {
        for _ in 0..max_ticks {
            self.tick();
            if done(self) {
                return;
            }
        }
        panic!("scenario did not complete within {max_ticks} ticks");
    }
}

#[test]
fn happy_path_connects_within_20_ticks() {
    let mut harness = Harness::new(Config::default());
    harness.connect_client(1);

    harness.tick_until(20, |harness| harness.client.is_connected());

    assert_eq!(ClientState::Connected, harness.client.state());
    assert_eq!(1, harness.server.client_count());
    assert!(harness.server.is_client_connected(0));
    assert_eq!(Some(1), harness.server.client_id(0));
    assert_eq!(Some(client_addr()), harness.server.client_address(0));
    // both sides hold the same salt pair
    assert_eq!(harness.client.salts(), harness.server.client_salts(0));
}

#[test]
fn messages_flow_both_ways_encrypted() {
    let mut harness = Harness::new(Config::default());
    harness.connect_client(7);
    harness.tick_until(20, |harness| harness.client.is_connected());

    for sequence in 0..20u16 {
        harness
            .client
            .send_message(TestMessage::Small { sequence })
            .unwrap();
        harness
            .server
            .send_message(0, TestMessage::Small { sequence })
            .unwrap();
    }

    let mut from_client = Vec::new();
    let mut from_server = Vec::new();
    harness.tick_until(100, |harness| {
        while let Some(message) = harness.server.receive_message(0) {
            from_client.push(message);
        }
        while let Some(message) = harness.client.receive_message() {
            from_server.push(message);
        }
        from_client.len() == 20 && from_server.len() == 20
    });

    let expected: Vec<_> = (0..20).map(|sequence| TestMessage::Small { sequence }).collect();
    assert_eq!(expected, from_client);
    assert_eq!(expected, from_server);
    assert_eq!(None, harness.client.error());
    assert_eq!(None, harness.server.client_error(0));
}

#[test]
fn server_full_denies_with_reason() {
    let config = Config {
        max_clients: 1,
        ..Config::default()
    };
    let mut harness = Harness::new(config.clone());
    harness.connect_client(1);
    harness.tick_until(20, |harness| harness.client.is_connected());

    // a second client from a different address wants in
    let mut second = Client::<TestMessage>::new(config.clone());
    let token = harness
        .issuer
        .issue(
            config.protocol_id,
            2,
            vec![server_addr()],
            harness.time as u64,
            config.connect_token_expiry_seconds,
        )
        .unwrap();
    second.connect(server_addr(), token);

    let second_addr: SocketAddr = "[::1]:60001".parse().unwrap();
    for _ in 0..20 {
        harness.time += 0.1;
        harness.client.advance_time(harness.time);
        second.advance_time(harness.time);
        harness.server.advance_time(harness.time);

        let packets: Vec<_> = second.flush().collect();
        for transmit in packets {
            harness.server.recv(second_addr, &transmit.payload);
        }
        let first_packets: Vec<_> = harness.client.flush().collect();
        for transmit in first_packets {
            harness.server.recv(client_addr(), &transmit.payload);
        }
        let to_clients: Vec<_> = harness.server.flush().collect();
        for transmit in to_clients {
            if transmit.addr == second_addr {
                second.recv(server_addr(), &transmit.payload);
            } else {
                harness.client.recv(server_addr(), &transmit.payload);
            }
        }

        if second.state() == ClientState::Disconnected {
            break;
        }
    }

    assert_eq!(
        Some(DisconnectReason::ConnectionDenied(DeniedReason::ServerFull)),
        second.disconnect_reason()
    );
    assert_eq!(1, harness.server.client_count());
}

#[test]
fn expired_token_fails_fast() {
    let mut harness = Harness::new(Config::default());
    let token = harness
        .issuer
        .issue(
            harness.config.protocol_id,
            1,
            vec![server_addr()],
            // issued half a minute in the past: already dead on arrival
            harness.time as u64 - 60,
            30,
        )
        .unwrap();
    harness.client.connect(server_addr(), token);

    harness.tick();
    assert_eq!(ClientState::Disconnected, harness.client.state());
    assert_eq!(
        Some(DisconnectReason::ConnectTokenExpired),
        harness.client.disconnect_reason()
    );
    assert_eq!(0, harness.server.client_count());
}

#[test]
fn foreign_protocol_token_never_connects() {
    let mut harness = Harness::new(Config::default());
    let token = harness
        .issuer
        .issue(
            harness.config.protocol_id ^ 0xFFFF,
            1,
            vec![server_addr()],
            harness.time as u64,
            2,
        )
        .unwrap();
    harness.client.connect(server_addr(), token);

    // the server drops every request; the client gives up when its token
    // expires
    harness.tick_until(40, |harness| {
        harness.client.state() == ClientState::Disconnected
    });
    assert_eq!(
        Some(DisconnectReason::ConnectTokenExpired),
        harness.client.disconnect_reason()
    );
    assert_eq!(0, harness.server.client_count());
}

#[test]
fn token_for_another_server_rejected() {
    let mut harness = Harness::new(Config::default());
    let elsewhere: SocketAddr = "[::1]:55555".parse().unwrap();
    let token = harness
        .issuer
        .issue(
            harness.config.protocol_id,
            1,
            vec![elsewhere],
            harness.time as u64,
            2,
        )
        .unwrap();
    harness.client.connect(server_addr(), token);

    harness.tick_until(40, |harness| {
        harness.client.state() == ClientState::Disconnected
    });
    assert_eq!(0, harness.server.client_count());
}

#[test]
fn forged_token_rejected() {
    let mut harness = Harness::new(Config::default());
    // an issuer with the wrong private key stands in for an attacker
    let mut forger = TokenIssuer::new(Key::generate());
    let token = forger
        .issue(
            harness.config.protocol_id,
            1,
            vec![server_addr()],
            harness.time as u64,
            2,
        )
        .unwrap();
    harness.client.connect(server_addr(), token);

    harness.tick_until(40, |harness| {
        harness.client.state() == ClientState::Disconnected
    });
    assert_eq!(0, harness.server.client_count());
}

#[test]
fn client_disconnect_frees_slot_immediately() {
    let mut harness = Harness::new(Config::default());
    harness.connect_client(1);
    harness.tick_until(20, |harness| harness.client.is_connected());
    assert_eq!(1, harness.server.client_count());

    harness.client.disconnect();
    harness.tick();
    assert_eq!(0, harness.server.client_count());
    assert_eq!(ClientState::Disconnected, harness.client.state());
    assert_eq!(None, harness.client.disconnect_reason());
}

#[test]
fn quiet_client_times_out() {
    let mut harness = Harness::new(Config::default());
    harness.connect_client(1);
    harness.tick_until(20, |harness| harness.client.is_connected());

    // the client vanishes without a disconnect; the server should reap the
    // slot after the timeout window
    let deadline = harness.time + harness.config.connection_timeout + 1.0;
    while harness.time < deadline {
        harness.time += 0.1;
        harness.server.advance_time(harness.time);
        harness.server.flush().count();
    }
    assert_eq!(0, harness.server.client_count());
}

#[test]
fn server_kick_disconnects_client() {
    let mut harness = Harness::new(Config::default());
    harness.connect_client(1);
    harness.tick_until(20, |harness| harness.client.is_connected());

    harness.server.disconnect_client(0);
    harness.tick();

    assert_eq!(0, harness.server.client_count());
    assert_eq!(ClientState::Disconnected, harness.client.state());
    assert_eq!(
        Some(DisconnectReason::DisconnectedByServer),
        harness.client.disconnect_reason()
    );
}

#[test]
fn quiet_connection_idles_on_keepalives() {
    let mut harness = Harness::new(Config::default());
    harness.connect_client(1);
    harness.tick_until(20, |harness| harness.client.is_connected());

    let client_sent_before = harness.client.stats().packets_sent;
    let server_sent_before = harness.server.stats().packets_sent;

    // no application traffic for longer than the connection timeout: only
    // keep-alives should flow, and they must be enough to hold the
    // connection open
    let quiet_ticks = (harness.config.connection_timeout * 16.0) as usize;
    for _ in 0..quiet_ticks {
        harness.tick();
    }
    assert!(harness.client.is_connected());
    assert_eq!(1, harness.server.client_count());

    // roughly one keep-alive per second per side, nowhere near one packet
    // per tick
    let quiet_seconds = quiet_ticks as u64 / 10;
    let client_sent = harness.client.stats().packets_sent - client_sent_before;
    let server_sent = harness.server.stats().packets_sent - server_sent_before;
    for sent in [client_sent, server_sent] {
        assert!(
            sent >= quiet_seconds / 2 && sent <= quiet_seconds * 2,
            "{sent} packets over {quiet_seconds}s is not keep-alive cadence"
        );
    }
}

#[test]
fn slot_is_stable_under_continued_traffic() {
    let mut harness = Harness::new(Config::default());
    harness.connect_client(1);
    harness.tick_until(20, |harness| harness.client.is_connected());
    let salts = harness.client.salts().unwrap();

    // keep-alives and payload packets keep flowing; the slot and its salt
    // binding must not move or duplicate
    for _ in 0..30 {
        harness.tick();
    }
    assert_eq!(1, harness.server.client_count());
    assert_eq!(Some(salts), harness.server.client_salts(0));
}
