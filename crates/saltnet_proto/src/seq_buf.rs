//! See [`SequenceBuffer`].

use crate::seq::{sequence_greater_than, sequence_less_than, Seq};

/// Rolling buffer associating per-sequence data with bounded memory.
///
/// This provides constant-time insertion, query, and removal of items keyed
/// by a wrap-around [`Seq`]. Two parallel arrays are used:
/// - `entry_seqs`, an array of slot tags recording which sequence currently
///   occupies each slot
/// - `entries`, an array holding the actual data
///
/// A key `k` maps to slot `k % N`, so multiple keys share a slot; an access
/// only succeeds if the slot tag equals the full key, which means inserting a
/// newer sequence silently evicts whatever older entry shared its slot. This
/// is exactly the behavior the protocol wants: data older than one window is
/// dead weight.
///
/// The capacity must divide 65536 so that the slot mapping stays consistent
/// across sequence wraparound.
///
/// This implementation is based on the article in [*Gaffer On Games*].
///
/// [*Gaffer On Games*]: https://gafferongames.com/post/reliable_ordered_messages#sequence-buffers
#[derive(Debug, Clone)]
pub struct SequenceBuffer<T> {
    /// One past the newest sequence ever inserted.
    sequence: Seq,
    entry_seqs: Box<[u32]>,
    entries: Box<[Option<T>]>,
}

const EMPTY: u32 = u32::MAX;

impl<T> SequenceBuffer<T> {
    /// Creates an empty buffer with the given number of slots.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or does not divide 65536.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        assert!(65536 % capacity == 0, "capacity must divide 65536");
        Self {
            sequence: Seq(0),
            entry_seqs: vec![EMPTY; capacity].into_boxed_slice(),
            entries: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Number of slots in this buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// One past the newest sequence ever inserted; the sequence a new item
    /// would naturally take next.
    #[must_use]
    pub const fn sequence(&self) -> Seq {
        self.sequence
    }

    fn index(&self, seq: Seq) -> usize {
        usize::from(seq.0) % self.entries.len()
    }

    /// Whether the slot that `seq` maps to is unoccupied.
    #[must_use]
    pub fn available(&self, seq: Seq) -> bool {
        self.entry_seqs[self.index(seq)] == EMPTY
    }

    /// Whether an entry tagged exactly `seq` is present.
    #[must_use]
    pub fn exists(&self, seq: Seq) -> bool {
        self.entry_seqs[self.index(seq)] == u32::from(seq.0)
    }

    /// Inserts a value at `seq`, evicting any prior entry sharing its slot
    /// and advancing [`SequenceBuffer::sequence`] if `seq` is newer.
    ///
    /// Returns `None` without inserting if `seq` is older than the window
    /// ending at the newest inserted sequence.
    pub fn insert(&mut self, seq: Seq, value: T) -> Option<&mut T> {
        #[allow(clippy::cast_possible_truncation)]
        let capacity = self.entries.len() as u16;
        if sequence_greater_than(seq.add(1).0, self.sequence.0) {
            self.sequence = seq.add(1);
        } else if sequence_less_than(seq.0, self.sequence.sub(capacity).0) {
            return None;
        }
        let index = self.index(seq);
        self.entry_seqs[index] = u32::from(seq.0);
        self.entries[index] = Some(value);
        self.entries[index].as_mut()
    }

    /// Gets the entry tagged `seq`, if present.
    #[must_use]
    pub fn find(&self, seq: Seq) -> Option<&T> {
        if self.exists(seq) {
            self.entries[self.index(seq)].as_ref()
        } else {
            None
        }
    }

    /// Gets the entry tagged `seq` mutably, if present.
    #[must_use]
    pub fn find_mut(&mut self, seq: Seq) -> Option<&mut T> {
        if self.exists(seq) {
            let index = self.index(seq);
            self.entries[index].as_mut()
        } else {
            None
        }
    }

    /// Removes and returns the entry tagged `seq`, if present.
    pub fn remove(&mut self, seq: Seq) -> Option<T> {
        if self.exists(seq) {
            let index = self.index(seq);
            self.entry_seqs[index] = EMPTY;
            self.entries[index].take()
        } else {
            None
        }
    }

    /// Invalidates every entry older than one full window behind the newest
    /// inserted sequence.
    ///
    /// Entries this old can never be found again through [`find`], but would
    /// otherwise hold their values (and heap allocations) alive until their
    /// slot is reused.
    ///
    /// [`find`]: SequenceBuffer::find
    pub fn remove_old(&mut self) {
        #[allow(clippy::cast_possible_truncation)]
        let capacity = self.entries.len() as u16;
        let oldest = self.sequence.sub(capacity);
        for index in 0..self.entries.len() {
            let tag = self.entry_seqs[index];
            #[allow(clippy::cast_possible_truncation)]
            if tag != EMPTY && sequence_less_than(tag as u16, oldest.0) {
                self.entry_seqs[index] = EMPTY;
                self.entries[index] = None;
            }
        }
    }

    /// Clears all entries and rewinds the sequence to zero.
    pub fn reset(&mut self) {
        self.sequence = Seq(0);
        self.entry_seqs.fill(EMPTY);
        self.entries.fill_with(|| None);
    }
}
