//! Density classification.
//!
//! Maps a population weight to one of seven visual buckets. The thresholds are
//! fixed and shared by every map view so cantons, parishes and raw points use
//! the same scale.
//!
//! | Weight | Bucket | Color | Opacity |
//! |--------|--------|-------|---------|
//! | < 5 | [`DensityColor::VeryLow`] | `#0066cc` | 0.3 |
//! | 5 - 25 | [`DensityColor::Low`] | `#00aa44` | 0.4 |
//! | 25 - 100 | [`DensityColor::ModerateLow`] | `#88dd00` | 0.5 |
//! | 100 - 500 | [`DensityColor::Moderate`] | `#ffff00` | 0.6 |
//! | 500 - 1500 | [`DensityColor::High`] | `#ffaa00` | 0.7 |
//! | 1500 - 5000 | [`DensityColor::VeryHigh`] | `#ff5500` | 0.8 |
//! | >= 5000 | [`DensityColor::Extreme`] | `#cc0000` | 0.9 |
//!
//! Lower bounds are inclusive.

use serde::{Deserialize, Serialize};

/// Lower bounds of buckets 1 through 6.
pub const THRESHOLDS: [f64; 6] = [5.0, 25.0, 100.0, 500.0, 1500.0, 5000.0];

/// Density bucket, ordered from lightest to most intense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DensityColor {
    VeryLow,
    Low,
    ModerateLow,
    Moderate,
    High,
    VeryHigh,
    Extreme,
}

impl DensityColor {
    const ALL: [DensityColor; 7] = [
        DensityColor::VeryLow,
        DensityColor::Low,
        DensityColor::ModerateLow,
        DensityColor::Moderate,
        DensityColor::High,
        DensityColor::VeryHigh,
        DensityColor::Extreme,
    ];

    /// Bucket position, 0 (lightest) to 6.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn hex(self) -> &'static str {
        match self {
            DensityColor::VeryLow => "#0066cc",
            DensityColor::Low => "#00aa44",
            DensityColor::ModerateLow => "#88dd00",
            DensityColor::Moderate => "#ffff00",
            DensityColor::High => "#ffaa00",
            DensityColor::VeryHigh => "#ff5500",
            DensityColor::Extreme => "#cc0000",
        }
    }

    pub fn opacity(self) -> f32 {
        match self {
            DensityColor::VeryLow => 0.3,
            DensityColor::Low => 0.4,
            DensityColor::ModerateLow => 0.5,
            DensityColor::Moderate => 0.6,
            DensityColor::High => 0.7,
            DensityColor::VeryHigh => 0.8,
            DensityColor::Extreme => 0.9,
        }
    }
}

/// Classify a weight into its bucket and opacity.
///
/// Total over all inputs: negative values and NaN fall into the lowest bucket,
/// infinity into the highest.
///
/// # Example
/// ```
/// use density_atlas::{classify, DensityColor};
/// assert_eq!(classify(0.0), (DensityColor::VeryLow, 0.3));
/// assert_eq!(classify(5000.0).0, DensityColor::Extreme);
/// ```
pub fn classify(weight: f64) -> (DensityColor, f32) {
    let bucket = THRESHOLDS.iter().take_while(|t| weight >= **t).count();
    let color = DensityColor::ALL[bucket];
    (color, color.opacity())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_boundaries() {
        assert_eq!(classify(4.999).0, DensityColor::VeryLow);
        assert_eq!(classify(5.0).0, DensityColor::Low);
        assert_eq!(classify(24.9).0, DensityColor::Low);
        assert_eq!(classify(25.0).0, DensityColor::ModerateLow);
        assert_eq!(classify(100.0).0, DensityColor::Moderate);
        assert_eq!(classify(500.0).0, DensityColor::High);
        assert_eq!(classify(1500.0).0, DensityColor::VeryHigh);
        assert_eq!(classify(4999.0).0, DensityColor::VeryHigh);
        assert_eq!(classify(5000.0), (DensityColor::Extreme, 0.9));
    }

    #[test]
    fn test_total_over_odd_inputs() {
        assert_eq!(classify(f64::NAN).0, DensityColor::VeryLow);
        assert_eq!(classify(-3.0).0, DensityColor::VeryLow);
        assert_eq!(classify(1e300).0, DensityColor::Extreme);
        assert_eq!(classify(f64::INFINITY).0, DensityColor::Extreme);
    }

    #[test]
    fn test_monotonic() {
        let mut last = 0;
        let mut w = 0.0;
        while w < 10_000.0 {
            let idx = classify(w).0.index();
            assert!(idx >= last, "bucket decreased at {}", w);
            last = idx;
            w += 0.5;
        }
        assert_eq!(last, 6);
    }

    #[test]
    fn test_opacity_rises_with_bucket() {
        for pair in DensityColor::ALL.windows(2) {
            assert!(pair[0].opacity() < pair[1].opacity());
            assert_ne!(pair[0].hex(), pair[1].hex());
        }
    }
}
