//! Size gate: post-encode check that the output actually saves space.

use serde::{Deserialize, Serialize};

/// Result of the size gate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SizeGateResult {
    /// Output is smaller than the threshold
    Accept,
    /// Output is at or above `source_bytes * max_ratio`
    Reject {
        source_bytes: u64,
        output_bytes: u64,
        ratio: f64,
    },
}

impl SizeGateResult {
    /// Human-readable rejection reason, recorded on the skipped job.
    pub fn reason(&self) -> Option<String> {
        match self {
            SizeGateResult::Accept => None,
            SizeGateResult::Reject {
                source_bytes,
                output_bytes,
                ratio,
            } => Some(format!(
                "output not smaller than source ({} >= {} bytes, ratio {:.3})",
                output_bytes, source_bytes, ratio
            )),
        }
    }
}

/// Returns `Reject` if `output_bytes >= source_bytes * max_ratio`, otherwise `Accept`.
pub fn check_size_gate(source_bytes: u64, output_bytes: u64, max_ratio: f64) -> SizeGateResult {
    let threshold = (source_bytes as f64 * max_ratio) as u64;

    if output_bytes >= threshold {
        let ratio = if source_bytes > 0 {
            output_bytes as f64 / source_bytes as f64
        } else {
            f64::INFINITY
        };
        SizeGateResult::Reject {
            source_bytes,
            output_bytes,
            ratio,
        }
    } else {
        SizeGateResult::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_larger_output_rejected() {
        let result = check_size_gate(1_000, 1_200, 1.0);
        assert!(matches!(result, SizeGateResult::Reject { output_bytes: 1_200, .. }));
        assert!(result.reason().unwrap().contains("not smaller"));
    }

    #[test]
    fn test_equal_size_rejected_smaller_accepted() {
        assert!(matches!(check_size_gate(1_000, 1_000, 1.0), SizeGateResult::Reject { .. }));
        assert_eq!(check_size_gate(1_000, 999, 1.0), SizeGateResult::Accept);
        assert_eq!(check_size_gate(1_000, 999, 1.0).reason(), None);
    }

    #[test]
    fn test_ratio_below_one_tightens_gate() {
        assert!(matches!(check_size_gate(1_000, 950, 0.9), SizeGateResult::Reject { .. }));
        assert_eq!(check_size_gate(1_000, 850, 0.9), SizeGateResult::Accept);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_size_gate_threshold(
            source_bytes in 1u64..=u64::MAX / 2,
            output_bytes in 0u64..=u64::MAX / 2,
            max_ratio in 0.01f64..=1.0f64,
        ) {
            let result = check_size_gate(source_bytes, output_bytes, max_ratio);
            let threshold = (source_bytes as f64 * max_ratio) as u64;

            match result {
                SizeGateResult::Accept => prop_assert!(output_bytes < threshold),
                SizeGateResult::Reject { source_bytes: s, output_bytes: o, .. } => {
                    prop_assert!(output_bytes >= threshold);
                    prop_assert_eq!(s, source_bytes);
                    prop_assert_eq!(o, output_bytes);
                }
            }
        }
    }
}
