//! Numerics for combining negative log-probabilities.

use crate::types::{INVALID_SCORE, Score};

/// Combine two -log probabilities: `-ln(e^-a + e^-b)`.
///
/// Stable for large magnitudes; the invalid sentinel acts as the identity
/// (probability zero).
#[inline]
pub fn score_sum(a: Score, b: Score) -> Score {
    if a >= INVALID_SCORE {
        return b;
    }
    if b >= INVALID_SCORE {
        return a;
    }
    let (min, max) = if a <= b { (a, b) } else { (b, a) };
    let diff = f64::from(min) - f64::from(max);
    (f64::from(min) - diff.exp().ln_1p()) as Score
}

/// Combine a sequence of -log probabilities.
pub fn score_sum_all<I: IntoIterator<Item = Score>>(scores: I) -> Score {
    scores.into_iter().fold(INVALID_SCORE, score_sum)
}

/// `-ln(1 - e^-x)` for `x > 0`, the per-step non-ending mass.
///
/// `x = 0` (all hypotheses ended) maps to the invalid sentinel.
#[inline]
pub fn neg_log_one_minus_exp_neg(x: Score) -> Score {
    if x <= 0.0 {
        return INVALID_SCORE;
    }
    let e = (-f64::from(x)).exp();
    (-(-e).ln_1p()) as Score
}

#[cfg(test)]
mod math_tests {
    use super::*;

    #[test]
    fn score_sum_of_equal_scores_halves_cost() {
        // p + p = 2p, so -ln(2p) = -ln(p) - ln(2)
        let s = score_sum(3.0, 3.0);
        assert!((s - (3.0 - std::f32::consts::LN_2)).abs() < 1e-6);
    }

    #[test]
    fn score_sum_is_commutative_and_dominated_by_the_better_path() {
        let s1 = score_sum(1.0, 20.0);
        let s2 = score_sum(20.0, 1.0);
        assert_eq!(s1, s2);
        assert!(s1 < 1.0 && s1 > 0.99);
    }

    #[test]
    fn invalid_sentinel_is_identity() {
        assert_eq!(score_sum(INVALID_SCORE, 2.5), 2.5);
        assert_eq!(score_sum(2.5, INVALID_SCORE), 2.5);
        assert_eq!(score_sum_all([]), INVALID_SCORE);
    }

    #[test]
    fn score_sum_all_matches_pairwise() {
        let all = score_sum_all([2.0, 3.0, 4.0]);
        let pair = score_sum(score_sum(2.0, 3.0), 4.0);
        assert!((all - pair).abs() < 1e-6);
    }

    #[test]
    fn non_ending_mass_is_small_when_little_ends() {
        // Large x: almost nothing ended, the non-ending mass is ~1 (cost ~0).
        assert!(neg_log_one_minus_exp_neg(20.0) < 1e-6);
        // x -> 0: everything ended, the non-ending mass vanishes.
        assert_eq!(neg_log_one_minus_exp_neg(0.0), INVALID_SCORE);
        assert!(neg_log_one_minus_exp_neg(1e-3) > 5.0);
    }
}
