use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Cheap randomness based on std, no `rand` crate.
// xorshift64 seeded from the clock, mixed with a process-wide counter so
// calls within the same nanosecond still diverge.
// ---------------------------------------------------------------------------

static COUNTER: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

fn next_u64() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let salt = COUNTER.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    let mut x = nanos ^ salt;
    if x == 0 {
        x = 0x2545_F491_4F6C_DD1D;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Random value in `[0, max)`. Returns 0 when `max` is 0.
pub fn random_below(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    next_u64() % max
}

/// Cache-busting token: current epoch millis plus a random suffix.
pub fn cache_buster() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("{millis}{}", random_below(1_000_000))
}

/// Short random alphanumeric token.
pub fn random_token() -> String {
    format!("{:x}", next_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_below_is_bounded() {
        for _ in 0..1000 {
            assert!(random_below(7) < 7);
        }
        assert_eq!(random_below(0), 0);
    }

    #[test]
    fn cache_busters_differ_within_a_burst() {
        let tokens: HashSet<String> = (0..50).map(|_| random_token()).collect();
        assert_eq!(tokens.len(), 50);
    }

    #[test]
    fn cache_buster_is_numeric() {
        assert!(cache_buster().chars().all(|c| c.is_ascii_digit()));
    }
}
