//! Bit-level serialization: see [`Stream`].
//!
//! The wire format packs values into exactly the number of bits their range
//! requires, so the same serialize code must be expressible in three modes:
//! writing bits out, reading them back, and *measuring* - computing how many
//! bits a value would take without touching a buffer. [`Stream`] is the sum of
//! those three modes behind one surface; protocol objects implement a single
//! `serialize` function and work in all of them.
//!
//! Internally both the writer and reader work on a 64-bit scratch register
//! over a buffer of 32-bit little-endian words, accumulating high bits first.
//! See <https://gafferongames.com/post/reading-and-writing-packets/>.

use bytes::Bytes;

/// Number of bits needed to represent every value in `[0, max]`.
#[must_use]
pub const fn bits_required(max: u32) -> u32 {
    if max == 0 {
        0
    } else {
        32 - max.leading_zeros()
    }
}

const WORD_BITS: usize = 32;

/// Packs values bit-by-bit into a buffer of 32-bit little-endian words.
#[derive(Debug)]
pub struct BitWriter {
    words: Vec<u32>,
    scratch: u64,
    /// Bits accumulated into the current (unflushed) word, in `0..32`.
    bit_index: usize,
    bits_written: usize,
    num_bits: usize,
    overflowed: bool,
}

impl BitWriter {
    /// Creates a writer with capacity for exactly `bytes` bytes. The backing
    /// word buffer is rounded up to a whole word, but writes past the byte
    /// capacity still overflow.
    #[must_use]
    pub fn new(bytes: usize) -> Self {
        Self {
            words: Vec::with_capacity((bytes + 3) / 4),
            scratch: 0,
            bit_index: 0,
            bits_written: 0,
            num_bits: bytes * 8,
            overflowed: false,
        }
    }

    /// Whether a write has run past the buffer capacity. Once set, all
    /// subsequent writes are no-ops.
    #[must_use]
    pub const fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Writes the low `bits` bits of `value`. `bits` must be in `[1, 32]`.
    pub fn write_bits(&mut self, value: u32, bits: usize) -> bool {
        debug_assert!(bits >= 1 && bits <= 32);
        if self.overflowed || self.bits_written + bits > self.num_bits {
            self.overflowed = true;
            return false;
        }

        let value = u64::from(value) & ((1u64 << bits) - 1);
        self.scratch |= value << (64 - self.bit_index - bits);
        self.bit_index += bits;

        if self.bit_index >= WORD_BITS {
            self.words.push((self.scratch >> 32) as u32);
            self.scratch <<= 32;
            self.bit_index -= WORD_BITS;
        }

        self.bits_written += bits;
        true
    }

    /// Pads with zero bits up to the next byte boundary.
    pub fn write_align(&mut self) -> bool {
        let remainder = self.bits_written % 8;
        if remainder != 0 {
            return self.write_bits(0, 8 - remainder);
        }
        true
    }

    /// Writes a run of bytes. The writer must be aligned to a byte boundary.
    ///
    /// Bytes up to the next word boundary go through the bit path; whole
    /// words are stored directly; the tail goes back through the bit path.
    pub fn write_bytes(&mut self, data: &[u8]) -> bool {
        debug_assert!(self.align_bits() == 0);
        if self.overflowed || self.bits_written + data.len() * 8 > self.num_bits {
            self.overflowed = true;
            return false;
        }

        let head_bytes = ((4 - self.bit_index / 8) % 4).min(data.len());
        for &byte in &data[..head_bytes] {
            self.write_bits(u32::from(byte), 8);
        }
        if head_bytes == data.len() {
            return true;
        }

        debug_assert!(self.bit_index == 0 && self.scratch == 0);

        let middle = data[head_bytes..].chunks_exact(4);
        let tail = middle.remainder();
        for chunk in middle {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.words.push(word);
            self.bits_written += WORD_BITS;
        }

        for &byte in tail {
            self.write_bits(u32::from(byte), 8);
        }

        true
    }

    /// Flushes the partial scratch word to the buffer, if any.
    pub fn flush(&mut self) {
        if self.bit_index != 0 {
            self.words.push((self.scratch >> 32) as u32);
            self.scratch = 0;
            self.bit_index = 0;
        }
    }

    /// Bits written so far.
    #[must_use]
    pub const fn bits_written(&self) -> usize {
        self.bits_written
    }

    /// Bytes written so far, rounded up.
    #[must_use]
    pub const fn bytes_written(&self) -> usize {
        (self.bits_written + 7) / 8
    }

    /// Zero bits between the write head and the next byte boundary.
    #[must_use]
    pub const fn align_bits(&self) -> usize {
        (8 - self.bits_written % 8) % 8
    }

    /// Flushes and returns the written bytes.
    #[must_use]
    pub fn into_bytes(mut self) -> Bytes {
        self.flush();
        let bytes_written = self.bytes_written();
        let mut buf = Vec::with_capacity(self.words.len() * 4);
        for word in &self.words {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf.truncate(bytes_written);
        Bytes::from(buf)
    }
}

/// Unpacks values bit-by-bit from a buffer of 32-bit little-endian words.
#[derive(Debug)]
pub struct BitReader {
    words: Vec<u32>,
    scratch: u64,
    /// Bits consumed from the current word, in `0..32`.
    bit_index: usize,
    word_index: usize,
    bits_read: usize,
    num_bits: usize,
    overflowed: bool,
}

impl BitReader {
    /// Creates a reader over a copy of `data`, padded out to a whole number
    /// of words.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        let mut words = Vec::with_capacity((data.len() + 3) / 4);
        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            words.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        let tail = chunks.remainder();
        if !tail.is_empty() {
            let mut last = [0u8; 4];
            last[..tail.len()].copy_from_slice(tail);
            words.push(u32::from_le_bytes(last));
        }

        let scratch = u64::from(words.first().copied().unwrap_or(0));
        Self {
            words,
            scratch,
            bit_index: 0,
            word_index: 0,
            bits_read: 0,
            num_bits: data.len() * 8,
            overflowed: false,
        }
    }

    /// Whether a read has run past the end of the data. Once set, all
    /// subsequent reads are no-ops returning zero.
    #[must_use]
    pub const fn overflowed(&self) -> bool {
        self.overflowed
    }

    fn word(&self, index: usize) -> u64 {
        u64::from(self.words.get(index).copied().unwrap_or(0))
    }

    /// Reads `bits` bits. `bits` must be in `[1, 32]`.
    pub fn read_bits(&mut self, bits: usize) -> Option<u32> {
        debug_assert!(bits >= 1 && bits <= 32);
        if self.overflowed || self.bits_read + bits > self.num_bits {
            self.overflowed = true;
            return None;
        }
        self.bits_read += bits;

        if self.bit_index + bits < WORD_BITS {
            self.scratch <<= bits;
            self.bit_index += bits;
        } else {
            self.word_index += 1;
            let a = WORD_BITS - self.bit_index;
            let b = bits - a;
            self.scratch <<= a;
            self.scratch |= self.word(self.word_index);
            self.scratch <<= b;
            self.bit_index = b;
        }

        let output = (self.scratch >> 32) as u32;
        self.scratch &= 0xFFFF_FFFF;
        Some(output)
    }

    /// Skips up to the next byte boundary, failing if the padding bits are
    /// not zero.
    pub fn read_align(&mut self) -> bool {
        let remainder = self.bits_read % 8;
        if remainder != 0 {
            match self.read_bits(8 - remainder) {
                Some(0) => {}
                _ => return false,
            }
        }
        true
    }

    /// Reads `out.len()` bytes. The reader must be aligned to a byte
    /// boundary.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> bool {
        debug_assert!(self.align_bits() == 0);
        if self.overflowed || self.bits_read + out.len() * 8 > self.num_bits {
            self.overflowed = true;
            return false;
        }

        let head_bytes = ((4 - self.bit_index / 8) % 4).min(out.len());
        for slot in &mut out[..head_bytes] {
            match self.read_bits(8) {
                Some(value) => *slot = value as u8,
                None => return false,
            }
        }
        if head_bytes == out.len() {
            return true;
        }

        debug_assert!(self.bit_index == 0);

        let num_words = (out.len() - head_bytes) / 4;
        for i in 0..num_words {
            let word = self.word(self.word_index + i) as u32;
            out[head_bytes + i * 4..head_bytes + i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        self.word_index += num_words;
        self.bits_read += num_words * WORD_BITS;
        self.scratch = self.word(self.word_index);

        let tail_start = head_bytes + num_words * 4;
        for slot in &mut out[tail_start..] {
            match self.read_bits(8) {
                Some(value) => *slot = value as u8,
                None => return false,
            }
        }
        true
    }

    /// Bits read so far.
    #[must_use]
    pub const fn bits_read(&self) -> usize {
        self.bits_read
    }

    /// Bits left before the end of the data.
    #[must_use]
    pub const fn bits_remaining(&self) -> usize {
        self.num_bits - self.bits_read
    }

    /// Zero bits between the read head and the next byte boundary.
    #[must_use]
    pub const fn align_bits(&self) -> usize {
        (8 - self.bits_read % 8) % 8
    }
}

/// One serialize surface over three modes: writing, reading, measuring.
///
/// Every operation returns `bool`; `false` means the stream has failed
/// (overflow or invalid data) and the caller should unwind without partial
/// commits. The failure is sticky - check [`Stream::ok`] once at the end of
/// a serialize pass.
#[derive(Debug)]
pub enum Stream {
    /// Writes values into an owned buffer.
    Write(WriteStream),
    /// Reads values back out of a received buffer.
    Read(ReadStream),
    /// Counts bits without a buffer.
    Measure(MeasureStream),
}

/// Write-mode stream. See [`Stream`].
#[derive(Debug)]
pub struct WriteStream {
    writer: BitWriter,
}

/// Read-mode stream. See [`Stream`].
#[derive(Debug)]
pub struct ReadStream {
    reader: BitReader,
    invalid: bool,
}

/// Measure-mode stream. See [`Stream`].
///
/// Alignment cost is unknowable without a real write position, so it is
/// counted at the worst case of 7 bits; measurements are an upper bound.
#[derive(Debug)]
pub struct MeasureStream {
    bits_written: usize,
    num_bits: usize,
    overflowed: bool,
}

impl Stream {
    /// Creates a write-mode stream with capacity for `bytes` bytes.
    #[must_use]
    pub fn writer(bytes: usize) -> Self {
        Self::Write(WriteStream {
            writer: BitWriter::new(bytes),
        })
    }

    /// Creates a read-mode stream over `data`.
    #[must_use]
    pub fn reader(data: &[u8]) -> Self {
        Self::Read(ReadStream {
            reader: BitReader::new(data),
            invalid: false,
        })
    }

    /// Creates a measure-mode stream bounded at `bytes` bytes.
    #[must_use]
    pub fn measure(bytes: usize) -> Self {
        Self::Measure(MeasureStream {
            bits_written: 0,
            num_bits: bytes * 8,
            overflowed: false,
        })
    }

    /// Whether this stream writes values (write or measure mode).
    #[must_use]
    pub const fn is_writing(&self) -> bool {
        !matches!(self, Self::Read(_))
    }

    /// Whether this stream fills values in from a buffer.
    #[must_use]
    pub const fn is_reading(&self) -> bool {
        matches!(self, Self::Read(_))
    }

    /// Serializes the low `bits` bits of `value`.
    pub fn serialize_bits(&mut self, value: &mut u32, bits: usize) -> bool {
        debug_assert!(bits >= 1 && bits <= 32);
        match self {
            Self::Write(s) => s.writer.write_bits(*value, bits),
            Self::Read(s) => match s.reader.read_bits(bits) {
                Some(read) => {
                    *value = read;
                    true
                }
                None => false,
            },
            Self::Measure(s) => s.count(bits),
        }
    }

    /// Serializes `value` packed into `ceil(log2(max - min + 1))` bits.
    ///
    /// On read, a raw value decoding outside `[min, max]` marks the stream
    /// invalid.
    pub fn serialize_int(&mut self, value: &mut i32, min: i32, max: i32) -> bool {
        debug_assert!(min < max);
        let bits = bits_required((i64::from(max) - i64::from(min)) as u32) as usize;
        match self {
            Self::Write(s) => {
                debug_assert!(*value >= min && *value <= max);
                let unsigned = (i64::from(*value) - i64::from(min)) as u32;
                s.writer.write_bits(unsigned, bits)
            }
            Self::Read(s) => match s.reader.read_bits(bits) {
                Some(raw) => {
                    let decoded = i64::from(min) + i64::from(raw);
                    if decoded < i64::from(min) || decoded > i64::from(max) {
                        s.invalid = true;
                        false
                    } else {
                        *value = decoded as i32;
                        true
                    }
                }
                None => false,
            },
            Self::Measure(s) => s.count(bits),
        }
    }

    /// Serializes a single bit.
    pub fn serialize_bool(&mut self, value: &mut bool) -> bool {
        let mut bits = u32::from(*value);
        if !self.serialize_bits(&mut bits, 1) {
            return false;
        }
        *value = bits != 0;
        true
    }

    /// Serializes a full 64-bit value as two 32-bit halves.
    pub fn serialize_u64(&mut self, value: &mut u64) -> bool {
        let mut lo = (*value & 0xFFFF_FFFF) as u32;
        let mut hi = (*value >> 32) as u32;
        if !self.serialize_bits(&mut lo, 32) || !self.serialize_bits(&mut hi, 32) {
            return false;
        }
        *value = (u64::from(hi) << 32) | u64::from(lo);
        true
    }

    /// Aligns to a byte boundary, then serializes a run of raw bytes.
    pub fn serialize_bytes(&mut self, data: &mut [u8]) -> bool {
        if !self.serialize_align() {
            return false;
        }
        match self {
            Self::Write(s) => s.writer.write_bytes(data),
            Self::Read(s) => s.reader.read_bytes(data),
            Self::Measure(s) => s.count(data.len() * 8),
        }
    }

    /// Serializes zero padding up to the next byte boundary.
    pub fn serialize_align(&mut self) -> bool {
        match self {
            Self::Write(s) => s.writer.write_align(),
            Self::Read(s) => {
                if s.reader.read_align() {
                    true
                } else {
                    s.invalid = true;
                    false
                }
            }
            Self::Measure(s) => {
                // can't know the real position; assume worst case
                let bits = 7;
                s.count(bits)
            }
        }
    }

    /// Aligns, then serializes a 32-bit magic value, failing the read if it
    /// does not match. Cheap post-hoc detection of a desynced serializer.
    pub fn serialize_check(&mut self, magic: u32) -> bool {
        if !self.serialize_align() {
            return false;
        }
        let mut value = magic;
        if !self.serialize_bits(&mut value, 32) {
            return false;
        }
        if let Self::Read(s) = self {
            if value != magic {
                s.invalid = true;
                return false;
            }
        }
        true
    }

    /// Whether the stream has failed (overflow or invalid data).
    #[must_use]
    pub const fn ok(&self) -> bool {
        match self {
            Self::Write(s) => !s.writer.overflowed(),
            Self::Read(s) => !s.reader.overflowed() && !s.invalid,
            Self::Measure(s) => !s.overflowed,
        }
    }

    /// Bits processed so far.
    #[must_use]
    pub const fn bits_processed(&self) -> usize {
        match self {
            Self::Write(s) => s.writer.bits_written(),
            Self::Read(s) => s.reader.bits_read(),
            Self::Measure(s) => s.bits_written,
        }
    }

    /// Bytes processed so far, rounded up.
    #[must_use]
    pub const fn bytes_processed(&self) -> usize {
        (self.bits_processed() + 7) / 8
    }

    /// Bits left to read. Zero in write and measure modes.
    #[must_use]
    pub const fn bits_remaining(&self) -> usize {
        match self {
            Self::Read(s) => s.reader.bits_remaining(),
            _ => 0,
        }
    }

    /// Finishes a write-mode stream, returning the serialized bytes.
    ///
    /// Returns `None` if the stream is not in write mode or has overflowed.
    #[must_use]
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Write(s) => {
                if s.writer.overflowed() {
                    None
                } else {
                    Some(s.writer.into_bytes())
                }
            }
            _ => None,
        }
    }
}

impl MeasureStream {
    fn count(&mut self, bits: usize) -> bool {
        if self.bits_written + bits > self.num_bits {
            self.overflowed = true;
            return false;
        }
        self.bits_written += bits;
        true
    }
}
