use anyhow;

use crate::dehash::ClassCounts;

/// Fraction of singlets among the classified barcodes; fails if it is
/// below `thresh`, which usually means the hashtag thresholds are off.
pub(crate) fn likely_valid_singlet_rate(counts: &ClassCounts, thresh: f64) -> anyhow::Result<f64> {
    let total = counts.total();
    if total > 0 {
        let singlet_frac = (counts.singlet as f64) / (total as f64);
        if singlet_frac >= thresh {
            anyhow::Ok(singlet_frac)
        } else {
            anyhow::bail!(
                "Percentage of barcodes assigned as singlets ({:.2}%) is < the suggested fraction ({:.2}%)",
                singlet_frac * 100.0f64,
                thresh * 100.0f64
            )
        }
    } else {
        anyhow::bail!("Cannot determine the singlet rate if no barcodes were classified")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singlet_rate() {
        let cc = ClassCounts {
            debris: 1,
            singlet: 3,
            multiplet: 0,
        };
        assert_eq!(likely_valid_singlet_rate(&cc, 0.5).unwrap(), 0.75);
        assert!(likely_valid_singlet_rate(&cc, 0.8).is_err());
        assert!(likely_valid_singlet_rate(&ClassCounts::default(), 0.1).is_err());
    }
}
