// Collapse a round's votes into a single published estimate.

/// Values a closed round can publish, in scan order.
pub const CONSENSUS_SCALE: [u32; 10] = [1, 2, 3, 5, 8, 13, 21, 34, 55, 89];

/// Return the scale entry nearest to the arithmetic mean of `points`.
///
/// An empty round yields `0`. On an exact tie the earlier (smaller) entry
/// wins: the scan only moves to a later entry when it is strictly closer.
pub fn compute_consensus(points: &[u32]) -> u32 {
    if points.is_empty() {
        return 0;
    }

    let sum: f64 = points.iter().map(|&p| f64::from(p)).sum();
    let mean = sum / points.len() as f64;
    nearest_on_scale(mean)
}

fn nearest_on_scale(mean: f64) -> u32 {
    let mut best = CONSENSUS_SCALE[0];
    for &candidate in &CONSENSUS_SCALE[1..] {
        if (f64::from(candidate) - mean).abs() < (f64::from(best) - mean).abs() {
            best = candidate;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_round_is_zero() {
        assert_eq!(compute_consensus(&[]), 0);
    }

    #[test]
    fn unanimous_round() {
        assert_eq!(compute_consensus(&[1, 1, 1]), 1);
        assert_eq!(compute_consensus(&[13, 13]), 13);
    }

    #[test]
    fn mean_rounds_to_nearest_scale_entry() {
        // mean 5.33
        assert_eq!(compute_consensus(&[3, 5, 8]), 5);
        // mean 11.33
        assert_eq!(compute_consensus(&[8, 13, 13]), 13);
        // mean 7
        assert_eq!(compute_consensus(&[5, 8, 8]), 8);
    }

    #[test]
    fn tie_goes_to_the_smaller_entry() {
        assert_eq!(compute_consensus(&[1, 2]), 1);
        assert_eq!(compute_consensus(&[5, 8, 8, 5]), 5);
        // mean 4 sits exactly between 3 and 5
        assert_eq!(compute_consensus(&[3, 5]), 3);
    }

    #[test]
    fn means_beyond_the_scale_clamp_to_its_ends() {
        assert_eq!(compute_consensus(&[200, 200]), 89);
        assert_eq!(nearest_on_scale(0.2), 1);
    }
}
