#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod ack;
pub mod bits;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod msg;
pub mod packet;
pub mod seq;
pub mod seq_buf;
pub mod server;
pub mod stats;
pub mod token;

pub use {
    client::{Client, ClientState, DisconnectReason, Transmit},
    config::Config,
    connection::{Connection, ConnectionError, ConnectionPacket},
    crypto::Key,
    msg::Message,
    seq::Seq,
    server::Server,
    token::{ConnectToken, IssuedToken, TokenIssuer},
};
