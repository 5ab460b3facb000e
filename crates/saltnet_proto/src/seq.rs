//! See [`Seq`].

use core::{cmp::Ordering, fmt};

/// Sequence number uniquely identifying an item sent across a network.
///
/// The same type numbers packets, messages, and block ids. It is stored as a
/// [`u16`], which wraps around quickly under sustained traffic, so all
/// comparisons must go through the wrap-aware [`Seq::cmp`] rather than
/// comparing the raw integers.
///
/// # Wraparound
///
/// The sequence space is a circle: [`u16::MAX`] sits right before `0`.
///
/// ```text
///     65534  65535    0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// `a < b` iff `b - a (mod 65536)` lies in `(0, 32768)` - that is, `b` is at
/// most half the sequence space ahead of `a`. Two values exactly half the
/// space apart compare as neither less nor greater; at that distance the
/// ordering is meaningless anyway (it would mean ~32k packets arrived in
/// between).
///
/// See <https://gafferongames.com/post/reliability_ordering_and_congestion_avoidance_over_udp/>,
/// *Handling Sequence Number Wrap-Around*.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct Seq(pub u16);

impl Seq {
    /// Sequence number with value [`u16::MAX`].
    pub const MAX: Seq = Seq(u16::MAX);

    /// Returns this sequence advanced by `n`, wrapping.
    #[must_use]
    pub const fn add(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// Returns this sequence moved back by `n`, wrapping.
    #[must_use]
    pub const fn sub(self, n: u16) -> Self {
        Self(self.0.wrapping_sub(n))
    }

    /// Advances this sequence by one and returns the value it had before.
    pub fn get_inc(&mut self) -> Self {
        let old = *self;
        *self = self.add(1);
        old
    }
}

/// Logically compares `s1` to `s2` respecting wrap-around, treating e.g.
/// `1 > 0` (as expected) but also `0 > 65535`.
#[must_use]
pub const fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 < 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

/// Mirror of [`sequence_greater_than`].
#[must_use]
pub const fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        } else if sequence_greater_than(self.0, other.0) {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl PartialOrd for Seq {
    /// See [`Seq::cmp`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Seq {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increasing_wraparound() {
        assert!(Seq(0) < Seq(1));
        assert!(Seq(1) < Seq(2));
        assert!(Seq(u16::MAX - 1) < Seq(u16::MAX));

        assert!(Seq(u16::MAX) < Seq(0));
        assert!(Seq(u16::MAX) < Seq(1));
        assert!(Seq(u16::MAX - 3) < Seq(2));
    }

    #[test]
    fn mirror_property() {
        // less(a, b) must hold exactly when greater(b, a) holds, and neither
        // when a == b
        let cases = [
            (0u16, 0u16),
            (0, 1),
            (1, 0),
            (0, u16::MAX),
            (100, 33000),
            (0, 32768),
            (32768, 0),
        ];
        for (a, b) in cases {
            assert_eq!(
                sequence_less_than(a, b),
                sequence_greater_than(b, a),
                "a = {a}, b = {b}"
            );
            if a == b {
                assert!(!sequence_less_than(a, b));
                assert!(!sequence_greater_than(a, b));
            }
        }
    }

    #[test]
    fn arithmetic_wraps() {
        assert_eq!(Seq(0), Seq(u16::MAX).add(1));
        assert_eq!(Seq(u16::MAX), Seq(0).sub(1));

        let mut seq = Seq(u16::MAX);
        assert_eq!(Seq(u16::MAX), seq.get_inc());
        assert_eq!(Seq(0), seq);
    }
}
