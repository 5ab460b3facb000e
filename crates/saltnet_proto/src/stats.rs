//! See [`EndpointStats`].

/// Datagram counters for a protocol endpoint.
///
/// Transient failures (checksum mismatch, failed decryption, unknown types,
/// short datagrams) silently drop the offending datagram; these counters are
/// the only place such drops are visible, which makes them the first thing to
/// look at when a connection misbehaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Datagrams handed to the transport.
    pub packets_sent: u64,
    /// Datagrams received from the transport, before validation.
    pub packets_received: u64,
    /// Datagrams dropped for any transient reason.
    pub packets_dropped: u64,
    /// Subset of drops caused by AEAD authentication failure.
    pub decrypt_failures: u64,
}
