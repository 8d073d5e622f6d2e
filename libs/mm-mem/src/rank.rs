//! The size-class ("rank") ladder.
//!
//! Four ranks per power-of-two interval, giving roughly 25% internal
//! fragmentation in the worst case. Ranks 0..=19 are small (4..112 B),
//! 20..=39 are medium (128..3584 B), 40..=75 are large (4096..1 835 008 B);
//! anything requiring rank 76 or above is allocated as its own span
//! ("huge").

use std::sync::OnceLock;

pub const SMALL_MAX_RANK: u32 = 19;
pub const MEDIUM_MAX_RANK: u32 = 39;
pub const LARGE_MAX_RANK: u32 = 75;
pub const HUGE_RANK: u32 = 76;
pub const LARGE_MIN_RANK: u32 = 40;

/// Computes the rank of the smallest size class that can hold `n` bytes.
pub fn encode_size(n: usize) -> u32 {
    if n <= 4 {
        return 0;
    }
    let msb = usize::BITS - 1 - (n - 1).leading_zeros();
    debug_assert!(msb >= 2);
    let step = (n - 1) >> (msb - 2);
    let rank = (i64::from(msb) << 2) + step as i64 - 11;
    debug_assert!(rank >= 0);
    rank as u32
}

/// Returns the maximum number of bytes a chunk of `rank` can satisfy, for
/// ranks `< HUGE_RANK`. Huge ranks have no fixed ceiling; callers size them
/// directly from the requested length.
pub fn rank_size(rank: u32) -> usize {
    debug_assert!(rank < HUGE_RANK);
    size_table()[rank as usize]
}

pub fn is_small(rank: u32) -> bool {
    rank <= SMALL_MAX_RANK
}

pub fn is_medium(rank: u32) -> bool {
    (SMALL_MAX_RANK + 1..=MEDIUM_MAX_RANK).contains(&rank)
}

pub fn is_large(rank: u32) -> bool {
    (LARGE_MIN_RANK..=LARGE_MAX_RANK).contains(&rank)
}

fn size_table() -> &'static [usize; 76] {
    static TABLE: OnceLock<[usize; 76]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0usize; 76];
        let mut n = 1usize;
        loop {
            let rank = encode_size(n);
            if rank >= HUGE_RANK {
                break;
            }
            table[rank as usize] = n;
            n += 1;
        }
        table
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_sizes_are_rank_zero() {
        assert_eq!(encode_size(1), 0);
        assert_eq!(encode_size(4), 0);
    }

    #[test]
    fn rank_is_monotonic() {
        let mut last = 0;
        for n in 1..2_000_000 {
            let r = encode_size(n);
            assert!(r >= last);
            last = r;
        }
    }

    #[test]
    fn rank_size_covers_requested_size() {
        for n in [1usize, 5, 64, 100, 112, 113, 3584, 3585, 1_835_008] {
            let rank = encode_size(n);
            if rank < HUGE_RANK {
                assert!(
                    rank_size(rank) >= n,
                    "rank {rank} size {} < requested {n}",
                    rank_size(rank)
                );
            }
        }
    }

    #[test]
    fn boundary_ranks_match_spec() {
        assert!(encode_size(112) <= SMALL_MAX_RANK);
        assert!(encode_size(113) > SMALL_MAX_RANK);
        assert!(encode_size(3584) <= MEDIUM_MAX_RANK);
        assert!(encode_size(3585) > MEDIUM_MAX_RANK);
        assert!(encode_size(1_835_008) <= LARGE_MAX_RANK);
        assert_eq!(encode_size(1_835_009), HUGE_RANK);
    }
}
