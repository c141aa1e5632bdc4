//! Reveal policy.
//!
//! Which path points of a batch are disclosed. The selection depends only
//! on the batch length and the reveal ratio, so a verifier recomputes the
//! slot of every revealed point without extra data.
//!
//! For `n` path points and `k = round(ratio * n)` reveals, point `p_{i+1}`
//! is disclosed for `i = j * n / k`, `j in 0..k`. At ratio 0.5 this is every
//! other point starting with the first one.

/// Number of revealed points for a batch of `n` moves.
pub fn reveal_count(n: usize, ratio: f64) -> usize {
    let k = (ratio * n as f64).round();
    if k <= 0.0 {
        0
    } else {
        (k as usize).min(n)
    }
}

/// Zero-based path indices of revealed points, ascending.
pub fn reveal_indices(n: usize, ratio: f64) -> Vec<usize> {
    let k = reveal_count(n, ratio);
    (0..k).map(|j| j * n / k).collect()
}

/// Zero-based path indices that are neither revealed nor final.
///
/// These positions are only range-proven.
pub fn hidden_indices(n: usize, revealed: &[usize]) -> Vec<usize> {
    (0..n.saturating_sub(1))
        .filter(|i| revealed.binary_search(i).is_err())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_half_ratio_every_other() {
        assert_eq!(reveal_indices(10, 0.5), vec![0, 2, 4, 6, 8]);
        assert_eq!(reveal_indices(3, 0.5), vec![0, 1]);
        assert_eq!(reveal_indices(1, 0.5), vec![0]);
        assert!(reveal_indices(0, 0.5).is_empty());
    }

    #[test]
    fn test_extremes() {
        assert!(reveal_indices(8, 0.0).is_empty());
        assert_eq!(reveal_indices(4, 1.0), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_hidden_excludes_final() {
        let revealed = reveal_indices(10, 0.5);
        assert_eq!(hidden_indices(10, &revealed), vec![1, 3, 5, 7]);
        assert!(hidden_indices(0, &[]).is_empty());
        assert!(hidden_indices(1, &[0]).is_empty());
    }

    proptest! {
        #[test]
        fn prop_reveal_count_matches_rounding(n in 0usize..200) {
            let indices = reveal_indices(n, 0.5);
            prop_assert_eq!(indices.len(), (0.5 * n as f64).round() as usize);
        }

        #[test]
        fn prop_indices_strictly_increasing(n in 1usize..200, ratio in 0.0f64..=1.0) {
            let indices = reveal_indices(n, ratio);
            prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(indices.iter().all(|i| *i < n));
        }
    }
}
