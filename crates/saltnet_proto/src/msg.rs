//! See [`Message`].

use bytes::Bytes;

use crate::bits::Stream;

/// An application-defined message deliverable over a connection.
///
/// Implementors are expected to be a tagged enum of the application's concrete
/// message types: [`Message::kind`] returns the tag, [`Message::create`] is a
/// total constructor over tags, and [`Message::serialize`] runs the same body
/// for writing, reading, and measuring via [`Stream`]'s mode dispatch.
///
/// # Block messages
///
/// A message kind may carry an opaque byte payload up to the configured
/// maximum block size instead of an inline body. Such kinds return `true`
/// from [`Message::is_block`] and expose the payload through
/// [`Message::block_data`] / [`Message::attach_block`]; their `serialize` is
/// never called, because the payload travels through the fragment
/// sub-protocol rather than inline in packets.
///
/// # Cloning
///
/// A packet under construction holds clones of the queued messages it
/// carries. Keep clones cheap: back block payloads with [`Bytes`] and keep
/// inline bodies small value types.
pub trait Message: Clone {
    /// Number of distinct message kinds. Kind tags are serialized in
    /// `ceil(log2(kind_count))` bits.
    fn kind_count() -> u32;

    /// Tag of this message, in `0..Self::kind_count()`.
    fn kind(&self) -> u32;

    /// Creates a default-initialized message of the given kind, or `None` if
    /// the tag is out of range.
    fn create(kind: u32) -> Option<Self>;

    /// Serializes the inline body through the stream. Returns `false` on
    /// stream failure.
    fn serialize(&mut self, stream: &mut Stream) -> bool;

    /// Whether this message carries a block payload.
    fn is_block(&self) -> bool {
        false
    }

    /// The block payload. Empty for non-block messages.
    fn block_data(&self) -> &Bytes {
        static EMPTY: Bytes = Bytes::new();
        &EMPTY
    }

    /// Hands a reassembled block payload to this message.
    fn attach_block(&mut self, data: Bytes) {
        let _ = data;
    }
}
