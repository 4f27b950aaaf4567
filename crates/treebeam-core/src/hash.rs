//! Hash-key mixing for recombination keys.

/// Fold `x` into an existing 64-bit key.
///
/// splitmix64-style finalisation; associative enough in practice for
/// combining history hashes with node ids and positions.
#[inline]
pub fn update_hash_key(key: u64, x: u64) -> u64 {
    let mut z = key
        .rotate_left(23)
        .wrapping_add(x)
        .wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod hash_tests {
    use super::*;

    #[test]
    fn distinct_inputs_produce_distinct_keys() {
        let a = update_hash_key(0, 1);
        let b = update_hash_key(0, 2);
        let c = update_hash_key(1, 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn order_matters() {
        let ab = update_hash_key(update_hash_key(0, 1), 2);
        let ba = update_hash_key(update_hash_key(0, 2), 1);
        assert_ne!(ab, ba);
    }
}
