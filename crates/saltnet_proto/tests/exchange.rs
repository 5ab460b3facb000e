//! End-to-end reliable delivery through the full wire codec over a lossy
//! link.

mod common;

use std::net::SocketAddr;

use common::{block_payload, LinkConditions, Simulator, TestMessage};
use saltnet_proto::{
    packet::{read_packet, write_packet, Packet},
    Config, Connection, Transmit,
};

fn addr_a() -> SocketAddr {
    "[::1]:5000".parse().unwrap()
}

fn addr_b() -> SocketAddr {
    "[::1]:6000".parse().unwrap()
}

struct Endpoint {
    addr: SocketAddr,
    connection: Connection<TestMessage>,
}

impl Endpoint {
    fn new(addr: SocketAddr, config: &Config) -> Self {
        Self {
            addr,
            connection: Connection::new(config),
        }
    }

    fn emit(&mut self, config: &Config, sim: &mut Simulator) {
        let Some(packet) = self.connection.write_packet() else {
            return;
        };
        let data = write_packet(&mut Packet::Payload(packet), config)
            .expect("connection packets fit the max packet size");
        let to = if self.addr == addr_a() {
            addr_b()
        } else {
            addr_a()
        };
        sim.send(
            self.addr,
            &Transmit {
                addr: to,
                payload: data,
            },
        );
    }

    fn take(&mut self, config: &Config, datagram: &[u8]) {
        let Ok(Packet::Payload(payload)) = read_packet::<TestMessage>(datagram, config) else {
            panic!("simulator only carries payload packets");
        };
        self.connection
            .read_packet(payload)
            .expect("no desync expected in these scenarios");
    }
}

/// Runs both endpoints until `done` says so, panicking if the tick budget
/// runs out first.
fn run(
    config: &Config,
    sim: &mut Simulator,
    a: &mut Endpoint,
    b: &mut Endpoint,
    max_ticks: usize,
    mut on_tick: impl FnMut(&mut Endpoint, &mut Endpoint) -> bool,
) {
    let dt = 0.1;
    for tick in 0..max_ticks {
        #[allow(clippy::cast_precision_loss)]
        let time = tick as f64 * dt;
        a.connection.advance_time(time);
        b.connection.advance_time(time);

        a.emit(config, sim);
        b.emit(config, sim);

        for (_, to, payload) in sim.advance(time) {
            if to == a.addr {
                a.take(config, &payload);
            } else {
                b.take(config, &payload);
            }
        }

        if on_tick(a, b) {
            return;
        }
    }
    panic!("scenario did not complete within {max_ticks} ticks");
}

#[test]
fn reliable_delivery_under_heavy_loss() {
    const NUM_MESSAGES: u64 = 1000;

    let config = Config::default();
    let mut sim = Simulator::new(
        7,
        LinkConditions {
            loss: 0.9,
            duplicate: 0.1,
            latency: 1.0,
            jitter: 1.0,
        },
    );
    let mut sender = Endpoint::new(addr_a(), &config);
    let mut receiver = Endpoint::new(addr_b(), &config);

    let mut num_sent = 0u64;
    let mut num_received = 0u64;
    run(
        &config,
        &mut sim,
        &mut sender,
        &mut receiver,
        20_000,
        |sender, receiver| {
            while num_sent < NUM_MESSAGES && sender.connection.can_send_message() {
                sender
                    .connection
                    .send_message(TestMessage::Small {
                        sequence: num_sent as u16,
                    })
                    .unwrap();
                num_sent += 1;
            }

            while let Some(message) = receiver.connection.receive_message() {
                assert_eq!(
                    TestMessage::Small {
                        sequence: num_received as u16
                    },
                    message,
                    "message {num_received} out of order or corrupted"
                );
                num_received += 1;
            }

            num_received == NUM_MESSAGES
                && !sender.connection.has_messages_to_send()
        },
    );

    assert_eq!(NUM_MESSAGES, num_received);
    assert_eq!(None, sender.connection.error());
    assert_eq!(None, receiver.connection.error());
}

#[test]
fn large_block_delivered_in_order() {
    const BLOCK_SIZE: usize = 100 * 1024;

    let config = Config::default();
    let mut sim = Simulator::new(
        11,
        LinkConditions {
            loss: 0.1,
            duplicate: 0.0,
            latency: 0.01,
            jitter: 0.01,
        },
    );
    let mut sender = Endpoint::new(addr_a(), &config);
    let mut receiver = Endpoint::new(addr_b(), &config);

    // message 1 of 3 is the block; small messages bracket it
    sender
        .connection
        .send_message(TestMessage::Small { sequence: 0 })
        .unwrap();
    sender
        .connection
        .send_message(TestMessage::Block(block_payload(1, BLOCK_SIZE)))
        .unwrap();
    sender
        .connection
        .send_message(TestMessage::Small { sequence: 2 })
        .unwrap();

    let mut received = Vec::new();
    run(
        &config,
        &mut sim,
        &mut sender,
        &mut receiver,
        5_000,
        |_, receiver| {
            while let Some(message) = receiver.connection.receive_message() {
                received.push(message);
            }
            received.len() == 3
        },
    );

    assert_eq!(TestMessage::Small { sequence: 0 }, received[0]);
    assert_eq!(TestMessage::Block(block_payload(1, BLOCK_SIZE)), received[1]);
    assert_eq!(TestMessage::Small { sequence: 2 }, received[2]);
}

#[test]
fn mixed_blocks_and_messages_under_loss() {
    const NUM_MESSAGES: u64 = 50;

    let config = Config::default();
    let mut sim = Simulator::new(
        23,
        LinkConditions {
            loss: 0.3,
            duplicate: 0.1,
            latency: 0.05,
            jitter: 0.05,
        },
    );
    let mut sender = Endpoint::new(addr_a(), &config);
    let mut receiver = Endpoint::new(addr_b(), &config);

    let expected_message = |index: u64| {
        if index % 10 == 9 {
            let size = 1 + (index as usize * 33) % (Config::default().max_block_size / 10);
            TestMessage::Block(block_payload(index, size))
        } else {
            TestMessage::Small {
                sequence: index as u16,
            }
        }
    };

    let mut num_sent = 0u64;
    let mut num_received = 0u64;
    run(
        &config,
        &mut sim,
        &mut sender,
        &mut receiver,
        20_000,
        |sender, receiver| {
            while num_sent < NUM_MESSAGES && sender.connection.can_send_message() {
                sender
                    .connection
                    .send_message(expected_message(num_sent))
                    .unwrap();
                num_sent += 1;
            }

            while let Some(message) = receiver.connection.receive_message() {
                assert_eq!(
                    expected_message(num_received),
                    message,
                    "message {num_received} out of order or corrupted"
                );
                num_received += 1;
            }

            num_received == NUM_MESSAGES
        },
    );

    assert_eq!(None, sender.connection.error());
    assert_eq!(None, receiver.connection.error());
}
