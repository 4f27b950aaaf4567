//! Persistent label and LM-token histories.
//!
//! Histories are immutable shared chains: extending one allocates a single
//! node, cloning is a reference-count bump. Every node carries the running
//! hash of its full sequence so `hash_key` is O(1); reduced keys walk back
//! at most `limit` nodes.

use std::sync::Arc;

use crate::hash::update_hash_key;
use crate::types::{LabelIndex, TokenId};

/// Key reserved for the empty (order-0) reduction.
const EMPTY_HASH: u64 = 0;

#[derive(Debug)]
struct Link<T> {
    value: T,
    hash: u64,
    len: u32,
    prev: Option<Arc<Link<T>>>,
}

#[derive(Clone, Debug, Default)]
struct Chain<T>(Option<Arc<Link<T>>>);

impl<T: Copy + PartialEq + Into<u64>> Chain<T> {
    fn extended(&self, value: T) -> Self {
        let (hash, len) = match &self.0 {
            Some(link) => (link.hash, link.len),
            None => (EMPTY_HASH, 0),
        };
        Chain(Some(Arc::new(Link {
            value,
            hash: update_hash_key(hash, value.into().wrapping_add(1)),
            len: len + 1,
            prev: self.0.clone(),
        })))
    }

    fn hash_key(&self) -> u64 {
        self.0.as_ref().map_or(EMPTY_HASH, |link| link.hash)
    }

    fn len(&self) -> u32 {
        self.0.as_ref().map_or(0, |link| link.len)
    }

    fn last(&self) -> Option<T> {
        self.0.as_ref().map(|link| link.value)
    }

    /// Values of the last `limit` entries, oldest first.
    fn suffix(&self, limit: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(limit.min(self.len() as usize));
        let mut cursor = &self.0;
        while let Some(link) = cursor {
            if out.len() == limit {
                break;
            }
            out.push(link.value);
            cursor = &link.prev;
        }
        out.reverse();
        out
    }

    /// Hash over the last `limit` entries only.
    fn suffix_hash(&self, limit: usize) -> u64 {
        self.suffix(limit)
            .into_iter()
            .fold(EMPTY_HASH, |h, v| update_hash_key(h, v.into().wrapping_add(1)))
    }

    fn sequence_eq(&self, other: &Self) -> bool {
        let (mut a, mut b) = (&self.0, &other.0);
        loop {
            match (a, b) {
                (None, None) => return true,
                (Some(la), Some(lb)) => {
                    if Arc::ptr_eq(la, lb) {
                        return true;
                    }
                    if la.len != lb.len || la.hash != lb.hash || la.value != lb.value {
                        return false;
                    }
                    a = &la.prev;
                    b = &lb.prev;
                }
                _ => return false,
            }
        }
    }
}

/// Sequence of emitted acoustic labels, owned by label hypotheses.
#[derive(Clone, Debug, Default)]
pub struct LabelHistory {
    chain: Chain<LabelIndex>,
}

impl LabelHistory {
    /// History before any label was emitted.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn extended(&self, label: LabelIndex) -> Self {
        Self {
            chain: self.chain.extended(label),
        }
    }

    /// Hash of the full sequence.
    pub fn hash_key(&self) -> u64 {
        self.chain.hash_key()
    }

    /// Hash of the last `limit` labels; `0` is the distinguished empty key,
    /// negative means the full sequence.
    pub fn reduced_hash_key(&self, limit: i32) -> u64 {
        match limit {
            0 => EMPTY_HASH,
            l if l < 0 => self.hash_key(),
            l => self.chain.suffix_hash(l as usize),
        }
    }

    /// Hash of the last `limit - 1` labels extended by `label`, without
    /// materialising the extension.
    pub fn reduced_extended_hash_key(&self, limit: i32, label: LabelIndex) -> u64 {
        let base = match limit {
            l if l < 0 => self.hash_key(),
            0 | 1 => EMPTY_HASH,
            l => self.chain.suffix_hash(l as usize - 1),
        };
        update_hash_key(base, u64::from(label).wrapping_add(1))
    }

    pub fn last_label(&self) -> Option<LabelIndex> {
        self.chain.last()
    }

    pub fn len(&self) -> u32 {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.len() == 0
    }

    /// The emitted labels, oldest first.
    pub fn labels(&self) -> Vec<LabelIndex> {
        self.chain.suffix(self.chain.len() as usize)
    }
}

/// Sequence of LM tokens; keys tree instances and recombination groups.
#[derive(Clone, Debug, Default)]
pub struct LmHistory {
    chain: Chain<TokenId>,
}

impl LmHistory {
    /// Sentence-start history.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn extended(&self, token: TokenId) -> Self {
        Self {
            chain: self.chain.extended(token),
        }
    }

    pub fn hash_key(&self) -> u64 {
        self.chain.hash_key()
    }

    /// Truncate to the last `order` tokens; negative keeps the full history.
    pub fn reduced(&self, order: i32) -> Self {
        if order < 0 || self.chain.len() <= order as u32 {
            return self.clone();
        }
        let mut reduced = LmHistory::root();
        for token in self.chain.suffix(order as usize) {
            reduced = reduced.extended(token);
        }
        reduced
    }

    /// Hash of the last `order` tokens; negative means the full sequence.
    pub fn reduced_hash_key(&self, order: i32) -> u64 {
        if order < 0 {
            self.hash_key()
        } else {
            self.chain.suffix_hash(order as usize)
        }
    }

    pub fn len(&self) -> u32 {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.len() == 0
    }

    /// The last `limit` tokens, oldest first.
    pub fn suffix(&self, limit: usize) -> Vec<TokenId> {
        self.chain.suffix(limit)
    }

    /// All tokens, oldest first.
    pub fn tokens(&self) -> Vec<TokenId> {
        self.chain.suffix(self.chain.len() as usize)
    }
}

impl PartialEq for LmHistory {
    fn eq(&self, other: &Self) -> bool {
        self.chain.sequence_eq(&other.chain)
    }
}

impl Eq for LmHistory {}

impl std::hash::Hash for LmHistory {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.chain.hash_key());
    }
}

#[cfg(test)]
mod history_tests {
    use super::*;

    #[test]
    fn extension_is_persistent() {
        let root = LabelHistory::root();
        let a = root.extended(3);
        let ab = a.extended(7);
        assert_eq!(root.len(), 0);
        assert_eq!(a.len(), 1);
        assert_eq!(ab.labels(), vec![3, 7]);
        assert_eq!(a.labels(), vec![3]);
    }

    #[test]
    fn reduced_hash_keys_see_only_the_suffix() {
        let h1 = LabelHistory::root().extended(1).extended(5).extended(9);
        let h2 = LabelHistory::root().extended(2).extended(5).extended(9);
        assert_ne!(h1.hash_key(), h2.hash_key());
        assert_eq!(h1.reduced_hash_key(2), h2.reduced_hash_key(2));
        assert_eq!(h1.reduced_hash_key(0), h2.reduced_hash_key(0));
        assert_ne!(h1.reduced_hash_key(3), h2.reduced_hash_key(3));
        assert_eq!(h1.reduced_hash_key(-1), h1.hash_key());
    }

    #[test]
    fn reduced_extended_matches_extend_then_reduce() {
        let h = LabelHistory::root().extended(4).extended(6);
        let extended = h.extended(8);
        assert_eq!(
            h.reduced_extended_hash_key(2, 8),
            extended.reduced_hash_key(2)
        );
        // first-order key depends on the new label only
        assert_eq!(
            h.reduced_extended_hash_key(1, 8),
            LabelHistory::root().extended(8).reduced_hash_key(1)
        );
    }

    #[test]
    fn lm_history_equality_is_structural() {
        let a = LmHistory::root().extended(1).extended(2);
        let b = LmHistory::root().extended(1).extended(2);
        let c = LmHistory::root().extended(2).extended(2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.reduced(1), b.reduced(1));
        assert_eq!(a.reduced(1).tokens(), vec![2]);
        assert_eq!(a.reduced(-1), a);
    }

    #[test]
    fn zero_and_distinct_labels_do_not_collide() {
        let zero = LabelHistory::root().extended(0);
        assert_ne!(zero.hash_key(), LabelHistory::root().hash_key());
    }
}
