//! Fractional order-by index encoding (§4.6, §9 Open Question "Fractional-
//! index collision").
//!
//! The spec requires a lexically-comparable string per row such that
//! string comparison reproduces the configured row order, but leaves the
//! exact scheme unspecified. This module picks one: the standard
//! Figma/Realm-style base-62 "insert between" midpoint encoding, attested
//! independently in this corpus's order-sensitive stream operators. Given
//! two neighboring indices `lo < hi`, [`between`] returns a new string
//! `s` with `lo < s < hi`, growing the string's length only when the
//! digit budget between the neighbors is exhausted at the current depth.

/// Base-62 alphabet, chosen in ascending ASCII order so that byte-wise
/// (and therefore `str`) comparison agrees with the digit's numeric rank.
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn digit_value(b: u8) -> usize {
    ALPHABET.iter().position(|&c| c == b).expect("fractional index byte outside base-62 alphabet")
}

fn digit_char(v: usize) -> u8 {
    ALPHABET[v]
}

/// Returns a string strictly between `lo` and `hi` (either bound may be
/// absent, meaning "no lower/upper neighbor yet"). Panics only if callers
/// violate the precondition `lo < hi` (both present) or feed a byte outside
/// the base-62 alphabet — both are programmer errors, never data-dependent.
pub fn between(lo: Option<&str>, hi: Option<&str>) -> String {
    if let (Some(l), Some(h)) = (lo, hi) {
        debug_assert!(l < h, "fractional::between requires lo < hi, got {l:?} >= {h:?}");
    }
    let mut out = Vec::new();
    between_rec(lo.map(str::as_bytes), hi.map(str::as_bytes), 0, &mut out);
    String::from_utf8(out).expect("base-62 alphabet is valid ASCII")
}

fn between_rec(lo: Option<&[u8]>, hi: Option<&[u8]>, depth: usize, out: &mut Vec<u8>) {
    let lo_d = lo.and_then(|s| s.get(depth)).map(|&b| digit_value(b)).unwrap_or(0);
    let hi_d = hi.and_then(|s| s.get(depth)).map(|&b| digit_value(b));
    const MAX: usize = ALPHABET.len() - 1;
    match hi_d {
        None => {
            // No upper neighbor (or, defensively, hi exhausted at this depth
            // without lo also exhausting — cannot happen when lo < hi holds,
            // but we fall back to "unbounded above" rather than panic).
            if lo_d < MAX {
                out.push(digit_char(lo_d + 1 + (MAX - lo_d - 1) / 2));
            } else {
                out.push(digit_char(lo_d));
                between_rec(None, None, depth + 1, out);
            }
        }
        Some(h) if h > lo_d + 1 => {
            out.push(digit_char(lo_d + (h - lo_d) / 2));
        }
        Some(_) => {
            // Either adjacent (no room at this digit) or an equal shared
            // prefix digit — either way, copy `lo_d` and recurse one level
            // deeper. In the adjacent case the upper bound no longer
            // constrains anything below this digit.
            out.push(digit_char(lo_d));
            let next_hi = if hi_d == Some(lo_d + 1) { None } else { hi };
            between_rec(lo, next_hi, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn between_none_none_is_midpoint() {
        let s = between(None, None);
        assert!(!s.is_empty());
    }

    #[test]
    fn between_respects_ordering() {
        let first = between(None, None);
        let second = between(Some(&first), None);
        assert!(first.as_str() < second.as_str());
        let third = between(Some(&first), Some(&second));
        assert!(first.as_str() < third.as_str());
        assert!(third.as_str() < second.as_str());
    }

    #[test]
    fn repeated_inserts_between_same_neighbors_stay_ordered() {
        let mut lo: Option<String> = None;
        let hi = "z".to_string();
        let mut values = Vec::new();
        for _ in 0..50 {
            let mid = between(lo.as_deref(), Some(&hi));
            assert!(lo.as_deref().unwrap_or("") < mid.as_str());
            assert!(mid.as_str() < hi.as_str());
            values.push(mid.clone());
            lo = Some(mid);
        }
        let mut sorted = values.clone();
        sorted.sort();
        assert_eq!(values, sorted);
    }
}
