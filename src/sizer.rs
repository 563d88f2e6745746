//! Address-set capacity sizing.
//!
//! Country lists range from a handful of prefixes to hundreds of thousands,
//! so the set's hash table and element cap are derived from the list length
//! instead of using fixed kernel defaults.

use serde::{Deserialize, Serialize};

/// Floor for the hash table size.
pub const MIN_HASH_SIZE: u32 = 512;

/// Largest element cap we will ever request (2^31).
const MAX_ELEMENTS_CAP: u32 = 1 << 31;

/// Capacity parameters for one address set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSizing {
    pub hash_size: u32,
    pub max_elements: u32,
}

/// Compute sizing for a set that must hold `prefix_count` entries.
///
/// `max_elements` is the smallest power of two not below the count (never
/// less than 2), and `hash_size` is a quarter of it, floored at 512.
pub fn size(prefix_count: usize) -> SetSizing {
    let max_elements = u32::try_from(prefix_count.max(2))
        .ok()
        .and_then(u32::checked_next_power_of_two)
        .unwrap_or(MAX_ELEMENTS_CAP);
    let hash_size = (max_elements / 4).max(MIN_HASH_SIZE);

    SetSizing {
        hash_size,
        max_elements,
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_max_elements_is_covering_power_of_two(n in 0usize..5_000_000) {
            let s = size(n);
            prop_assert!(s.max_elements.is_power_of_two());
            prop_assert!(s.max_elements as usize >= n);
            // smallest such power: half of it no longer covers n (or we're at the floor of 2)
            prop_assert!(s.max_elements == 2 || ((s.max_elements / 2) as usize) < n);
        }

        #[test]
        fn prop_hash_size_formula(n in 0usize..5_000_000) {
            let s = size(n);
            prop_assert_eq!(s.hash_size, std::cmp::max(MIN_HASH_SIZE, s.max_elements / 4));
        }
    }
}
