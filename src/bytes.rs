//! Content-hashed array wrappers used as interning keys, and the
//! visitation stack backing reachability walks.

use std::fmt;
use std::hash::{Hash, Hasher};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Immutable byte array with content equality and a hash computed once at
/// construction.
///
/// Ordinal maps and parameter dedup tables key on these; caching the hash
/// keeps repeated map probes from rescanning the content.
#[derive(Clone, Eq)]
pub struct Bytes {
    data: Box<[u8]>,
    hash: u64,
}

impl Bytes {
    /// Wrap a byte sequence.
    pub fn new<B: Into<Box<[u8]>>>(data: B) -> Self {
        let data = data.into();
        let hash = fnv1a(&data);
        Self { data, hash }
    }

    /// Content view.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Content length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Flag whether the content is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy the content into an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Lossy UTF-8 rendition, for diagnostics.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl PartialEq for Bytes {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.data == other.data
    }
}

impl Hash for Bytes {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes({:?})", String::from_utf8_lossy(&self.data))
    }
}

impl From<&[u8]> for Bytes {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Immutable `i64` array with content equality and a cached hash.
///
/// Keys the equivalence-reduction map (one entry per transition column) and
/// the effector-vector dedup map.
#[derive(Clone, Eq)]
pub struct Ints {
    data: Box<[i64]>,
    hash: u64,
}

impl Ints {
    /// Wrap an integer sequence.
    pub fn new<V: Into<Box<[i64]>>>(data: V) -> Self {
        let data = data.into();
        let mut hash = FNV_OFFSET;
        for v in data.iter() {
            for b in v.to_le_bytes() {
                hash = (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME);
            }
        }
        Self { data, hash }
    }

    /// Content view.
    pub fn as_slice(&self) -> &[i64] {
        &self.data
    }

    /// Content length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Flag whether the content is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PartialEq for Ints {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.data == other.data
    }
}

impl Hash for Ints {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for Ints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ints({:?})", &self.data)
    }
}

/// Monotone non-duplicating stack of state ordinals.
///
/// Push records an ordinal at most once over the stack's lifetime, so a
/// reachability walk that pushes successors unconditionally still visits
/// each state exactly once.
#[derive(Debug)]
pub struct Visits {
    stack: Vec<u32>,
    seen: Vec<bool>,
}

impl Visits {
    /// Create a visitation stack over the ordinal domain `0..domain`.
    pub fn new(domain: usize) -> Self {
        Self {
            stack: Vec::with_capacity(domain.min(64)),
            seen: vec![false; domain],
        }
    }

    /// Push `ordinal` unless it was ever pushed before.
    pub fn push(&mut self, ordinal: u32) {
        let slot = &mut self.seen[ordinal as usize];
        if !*slot {
            *slot = true;
            self.stack.push(ordinal);
        }
    }

    /// Pop the most recently pushed ordinal.
    pub fn pop(&mut self) -> Option<u32> {
        self.stack.pop()
    }

    /// Flag whether `ordinal` was ever pushed.
    pub fn visited(&self, ordinal: u32) -> bool {
        self.seen[ordinal as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn bytes_content_equality() {
        let a = Bytes::new(vec![1u8, 2, 3]);
        let b = Bytes::from(&[1u8, 2, 3][..]);
        let c = Bytes::new(vec![1u8, 2, 4]);

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn ints_content_equality() {
        let a = Ints::new(vec![-1i64, 7, i64::MAX]);
        let b = Ints::new(vec![-1i64, 7, i64::MAX]);
        let c = Ints::new(vec![-1i64, 7]);

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn visits_never_duplicates() {
        let mut visits = Visits::new(4);
        visits.push(2);
        visits.push(2);
        visits.push(0);
        visits.push(2);

        assert_eq!(visits.pop(), Some(0));
        assert_eq!(visits.pop(), Some(2));
        assert_eq!(visits.pop(), None);
        assert!(visits.visited(2));
        assert!(!visits.visited(3));
    }
}
