//! Serialized key ranges.
//!
//! Keys are memcomparable byte strings: byte-wise ordering equals key
//! ordering. An empty `from` is minus infinity, a missing `to` is plus
//! infinity.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub from: Vec<u8>,
    pub from_inclusive: bool,
    pub to: Option<Vec<u8>>,
    pub to_inclusive: bool,
}

impl KeyRange {
    pub fn new(from: Vec<u8>, from_inclusive: bool, to: Option<Vec<u8>>, to_inclusive: bool) -> Self {
        Self {
            from,
            from_inclusive,
            to,
            to_inclusive,
        }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(Vec::new(), true, None, false)
    }

    pub fn point(key: Vec<u8>) -> Self {
        Self::new(key.clone(), true, Some(key), true)
    }

    pub fn is_empty(&self) -> bool {
        match &self.to {
            None => false,
            Some(to) => match self.from.as_slice().cmp(to.as_slice()) {
                Ordering::Less => false,
                Ordering::Equal => !(self.from_inclusive && self.to_inclusive),
                Ordering::Greater => true,
            },
        }
    }

    /// Intersects with the half-open partition interval `[lo, hi)`.
    ///
    /// Returns `None` when the intersection is empty.
    pub fn clip(&self, lo: &[u8], hi: Option<&[u8]>) -> Option<KeyRange> {
        let (from, from_inclusive) = if self.from.as_slice() >= lo {
            (self.from.clone(), self.from_inclusive)
        } else {
            (lo.to_vec(), true)
        };

        let (to, to_inclusive) = match (&self.to, hi) {
            (to, None) => (to.clone(), self.to_inclusive),
            (None, Some(hi)) => (Some(hi.to_vec()), false),
            (Some(to), Some(hi)) => {
                if to.as_slice() < hi {
                    (Some(to.clone()), self.to_inclusive)
                } else {
                    (Some(hi.to_vec()), false)
                }
            }
        };

        let clipped = KeyRange::new(from, from_inclusive, to, to_inclusive);
        if clipped.is_empty() {
            None
        } else {
            Some(clipped)
        }
    }

    pub fn right_border(&self) -> RightBorder<'_> {
        RightBorder {
            key: self.to.as_deref(),
            inclusive: self.to_inclusive,
        }
    }
}

/// Right end of a range, ordered with plus infinity last and an exclusive
/// border before an inclusive one on the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RightBorder<'a> {
    pub key: Option<&'a [u8]>,
    pub inclusive: bool,
}

impl Ord for RightBorder<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.key, other.key) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a
                .cmp(b)
                .then_with(|| self.inclusive.cmp(&other.inclusive)),
        }
    }
}

impl PartialOrd for RightBorder<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(from: &[u8], to: Option<&[u8]>) -> KeyRange {
        KeyRange::new(from.to_vec(), true, to.map(|t| t.to_vec()), true)
    }

    #[test]
    fn clip_inside_partition_keeps_range() {
        let r = range(b"b", Some(&b"c"[..]));
        assert_eq!(r.clip(b"a", Some(&b"d"[..])), Some(r.clone()));
    }

    #[test]
    fn clip_cuts_at_partition_borders() {
        let r = range(b"a", Some(&b"z"[..]));
        let clipped = r.clip(b"m", Some(&b"p"[..])).unwrap();
        assert_eq!(clipped.from, b"m".to_vec());
        assert!(clipped.from_inclusive);
        assert_eq!(clipped.to, Some(b"p".to_vec()));
        assert!(!clipped.to_inclusive);
    }

    #[test]
    fn clip_outside_partition_is_none() {
        let r = range(b"a", Some(&b"c"[..]));
        assert_eq!(r.clip(b"d", None), None);
        // Partition is [c, ...): only the inclusive point c survives.
        let point = r.clip(b"c", None).unwrap();
        assert_eq!(point, KeyRange::point(b"c".to_vec()));
    }

    #[test]
    fn clip_range_ending_at_partition_start_is_empty() {
        let r = KeyRange::new(b"a".to_vec(), true, Some(b"c".to_vec()), false);
        assert_eq!(r.clip(b"c", None), None);
    }

    #[test]
    fn full_range_clips_to_partition() {
        let clipped = KeyRange::full().clip(b"", Some(&b"k"[..])).unwrap();
        assert_eq!(clipped.to, Some(b"k".to_vec()));
    }

    #[test]
    fn right_borders_order_infinity_last() {
        let a = range(b"a", Some(&b"b"[..]));
        let b = KeyRange::new(b"a".to_vec(), true, Some(b"b".to_vec()), false);
        let inf = range(b"a", None);
        assert!(b.right_border() < a.right_border());
        assert!(a.right_border() < inf.right_border());
    }
}
