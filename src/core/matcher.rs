//! Constant-time credential matching
//!
//! Every comparison walks the full length of both inputs so the time taken
//! does not depend on where the first differing byte sits.

use subtle::{Choice, ConstantTimeEq};

/// Fixed-time equality of two byte slices.
///
/// Slices of different length never match.
#[inline]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    // subtle returns 0 for a length mismatch without touching the contents
    bool::from(a.ct_eq(b))
}

/// Match `candidate` against every entry of `accepted`.
///
/// All entries are compared even after a hit, so the caller learns only
/// whether some entry matched, never which one or how many were checked.
pub fn ct_contains<T: AsRef<[u8]>>(candidate: &[u8], accepted: &[T]) -> bool {
    let mut found = Choice::from(0u8);
    for entry in accepted {
        found |= candidate.ct_eq(entry.as_ref());
    }
    bool::from(found)
}

/// Fixed-time equality where ASCII letters in `candidate` are folded to
/// lowercase first. `expected` must already be lowercase.
pub fn ct_eq_ignore_ascii_case(candidate: &[u8], expected: &[u8]) -> bool {
    if candidate.len() != expected.len() {
        return false;
    }
    let mut acc = Choice::from(1u8);
    for (c, e) in candidate.iter().zip(expected) {
        acc &= c.to_ascii_lowercase().ct_eq(e);
    }
    bool::from(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_ct_eq_equal() {
        assert!(ct_eq(b"0123456789abcdef", b"0123456789abcdef"));
        assert!(ct_eq(b"", b""));
    }

    #[test]
    fn test_ct_eq_same_length_different_content() {
        assert!(!ct_eq(b"0123456789abcdef", b"0123456789abcdeX"));
        assert!(!ct_eq(b"X123456789abcdef", b"0123456789abcdef"));
    }

    #[test]
    fn test_ct_eq_length_mismatch() {
        assert!(!ct_eq(b"abc", b"abcd"));
        assert!(!ct_eq(b"abcd", b"abc"));
        assert!(!ct_eq(b"", b"a"));
    }

    #[test]
    fn test_ct_contains() {
        let accepted = vec![[1u8; 16], [2u8; 16], [3u8; 16]];
        assert!(ct_contains(&[2u8; 16], &accepted));
        assert!(ct_contains(&[3u8; 16], &accepted));
        assert!(!ct_contains(&[4u8; 16], &accepted));
        assert!(!ct_contains(&[1u8; 15], &accepted));
        let empty: Vec<[u8; 16]> = Vec::new();
        assert!(!ct_contains(&[1u8; 16], &empty));
    }

    #[test]
    fn test_ct_eq_ignore_ascii_case() {
        assert!(ct_eq_ignore_ascii_case(b"ABCdef0123", b"abcdef0123"));
        assert!(ct_eq_ignore_ascii_case(b"abcdef0123", b"abcdef0123"));
        assert!(!ct_eq_ignore_ascii_case(b"abcdef0124", b"abcdef0123"));
        assert!(!ct_eq_ignore_ascii_case(b"abcdef012", b"abcdef0123"));
    }

    /// Best of several batches, to filter scheduler noise.
    fn min_batch_time(a: &[u8], b: &[u8], batches: usize, iters: usize) -> Duration {
        let mut best = Duration::MAX;
        for _ in 0..batches {
            let start = Instant::now();
            for _ in 0..iters {
                std::hint::black_box(ct_eq(std::hint::black_box(a), std::hint::black_box(b)));
            }
            best = best.min(start.elapsed());
        }
        best
    }

    #[test]
    fn test_ct_eq_timing_independent_of_first_difference() {
        const LEN: usize = 4096;
        let base = vec![0x5au8; LEN];
        let mut early = base.clone();
        early[0] ^= 0xff;
        let mut late = base.clone();
        late[LEN - 1] ^= 0xff;

        let t_early = min_batch_time(&base, &early, 15, 300);
        let t_late = min_batch_time(&base, &late, 15, 300);

        let ratio = t_early.as_secs_f64() / t_late.as_secs_f64().max(f64::EPSILON);
        assert!(
            (0.33..3.0).contains(&ratio),
            "timing depends on mismatch position: early={:?} late={:?}",
            t_early,
            t_late
        );
    }
}
