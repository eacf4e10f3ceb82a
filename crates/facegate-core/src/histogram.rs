//! Colour/grey histogram comparison of face crops.

use image::DynamicImage;

use crate::preprocess::is_grayscale;

pub const BINS: usize = 256;

/// Channel weights for R, G, B.
const CHANNEL_WEIGHTS: [f64; 3] = [0.6, 0.3, 0.1];

const EPS: f64 = f64::EPSILON;

/// Histogram comparison measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Correlation,
    /// Symmetric chi-square: `2 Σ (a−b)² / (a+b)`, not OpenCV's `Σ (a−b)² / a`.
    ChiSquareAlt,
    /// `Σ min(a, b)` divided by the larger histogram mass, so identical inputs give 1.
    NormalizedIntersection,
    Bhattacharyya,
}

impl Comparison {
    pub const ALL: [Comparison; 4] = [
        Comparison::Correlation,
        Comparison::ChiSquareAlt,
        Comparison::NormalizedIntersection,
        Comparison::Bhattacharyya,
    ];

    pub fn higher_is_better(&self) -> bool {
        matches!(self, Comparison::Correlation | Comparison::NormalizedIntersection)
    }

    pub fn compare(&self, a: &[f64], b: &[f64]) -> f64 {
        match self {
            Comparison::Correlation => {
                let n = a.len().max(1) as f64;
                let ma = a.iter().sum::<f64>() / n;
                let mb = b.iter().sum::<f64>() / n;
                let (mut num, mut va, mut vb) = (0f64, 0f64, 0f64);
                for (x, y) in a.iter().zip(b) {
                    let (dx, dy) = (x - ma, y - mb);
                    num += dx * dy;
                    va += dx * dx;
                    vb += dy * dy;
                }
                let den = va * vb;
                if den.abs() > EPS {
                    num / den.sqrt()
                } else {
                    1.0
                }
            }
            Comparison::ChiSquareAlt => a
                .iter()
                .zip(b)
                .filter(|(x, y)| (*x + *y).abs() > EPS)
                .map(|(x, y)| 2.0 * (x - y).powi(2) / (x + y))
                .sum(),
            Comparison::NormalizedIntersection => {
                let overlap: f64 = a.iter().zip(b).map(|(x, y)| x.min(*y)).sum();
                let mass = a.iter().sum::<f64>().max(b.iter().sum::<f64>());
                if mass > EPS {
                    overlap / mass
                } else {
                    1.0
                }
            }
            Comparison::Bhattacharyya => {
                let overlap: f64 = a.iter().zip(b).map(|(x, y)| (x * y).sqrt()).sum();
                let mass = a.iter().sum::<f64>() * b.iter().sum::<f64>();
                let scale = if mass.abs() > EPS { 1.0 / mass.sqrt() } else { 1.0 };
                (1.0 - overlap * scale).max(0.0).sqrt()
            }
        }
    }

    /// Comparison value turned into a similarity (higher is better).
    fn similarity(&self, a: &[f64], b: &[f64]) -> f64 {
        let v = self.compare(a, b);
        if self.higher_is_better() {
            v
        } else {
            1.0 - v
        }
    }
}

/// 256-bin histogram scaled so its smallest bin is 0 and largest 1.
pub fn normalized_histogram(values: impl Iterator<Item = u8>) -> Vec<f64> {
    let mut hist = vec![0f64; BINS];
    for v in values {
        hist[v as usize] += 1.0;
    }
    let min = hist.iter().copied().fold(f64::INFINITY, f64::min);
    let max = hist.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    for h in hist.iter_mut() {
        *h = if range > 0.0 { (*h - min) / range } else { 0.0 };
    }
    hist
}

/// Best weighted histogram similarity of two crops in [0, 1], or `None` for empty crops.
///
/// Greyscale pairs compare one luminance histogram. If either crop has colour,
/// both are compared per RGB channel with R/G/B weighted 0.6/0.3/0.1.
pub fn histogram_score(a: &DynamicImage, b: &DynamicImage) -> Option<f32> {
    if a.width() == 0 || a.height() == 0 || b.width() == 0 || b.height() == 0 {
        return None;
    }

    let best = if is_grayscale(a) && is_grayscale(b) {
        let ha = normalized_histogram(a.to_luma8().into_raw().into_iter());
        let hb = normalized_histogram(b.to_luma8().into_raw().into_iter());
        Comparison::ALL
            .iter()
            .map(|c| c.similarity(&ha, &hb))
            .fold(f64::NEG_INFINITY, f64::max)
    } else {
        let (ra, rb) = (a.to_rgb8(), b.to_rgb8());
        let channels: Vec<(Vec<f64>, Vec<f64>)> = (0..3)
            .map(|c| {
                (
                    normalized_histogram(ra.pixels().map(|p| p.0[c])),
                    normalized_histogram(rb.pixels().map(|p| p.0[c])),
                )
            })
            .collect();
        let total_weight: f64 = CHANNEL_WEIGHTS.iter().sum();

        Comparison::ALL
            .iter()
            .map(|cmp| {
                let weighted: f64 = channels
                    .iter()
                    .zip(CHANNEL_WEIGHTS)
                    .map(|((ha, hb), w)| w * cmp.compare(ha, hb))
                    .sum();
                if cmp.higher_is_better() {
                    weighted
                } else {
                    1.0 - weighted / total_weight
                }
            })
            .fold(f64::NEG_INFINITY, f64::max)
    };

    best.is_finite().then(|| best.clamp(0.0, 1.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};

    fn gradient_rgb() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(32, 32, |x, y| image::Rgb([(x * 8) as u8, (y * 8) as u8, ((x + y) * 4) as u8])))
    }

    #[test]
    fn test_normalized_histogram_range() {
        let h = normalized_histogram([0u8, 0, 0, 5, 5, 9].into_iter());
        assert_eq!(h[0], 1.0);
        assert!((h[5] - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(h[200], 0.0);
    }

    #[test]
    fn test_flat_histogram_normalizes_to_zero() {
        let h = normalized_histogram((0..=255u8).collect::<Vec<_>>().into_iter());
        assert!(h.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_identical_crops_score_one() {
        let a = gradient_rgb();
        assert_eq!(histogram_score(&a, &a), Some(1.0));
        let g = DynamicImage::ImageLuma8(GrayImage::from_fn(20, 20, |x, y| image::Luma([(x * y) as u8])));
        assert_eq!(histogram_score(&g, &g), Some(1.0));
    }

    #[test]
    fn test_disjoint_crops_score_zero() {
        let black = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, image::Luma([0])));
        let white = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, image::Luma([255])));
        assert_eq!(histogram_score(&black, &white), Some(0.0));
    }

    #[test]
    fn test_channel_weights() {
        // Only the blue channel differs; it carries 10% of the weight.
        let a = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, image::Rgb([50, 100, 0])));
        let b = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, image::Rgb([50, 100, 255])));
        let s = histogram_score(&a, &b).unwrap();
        assert!((s - 0.9).abs() < 1e-6, "got {s}");
    }

    #[test]
    fn test_order_insensitive() {
        let a = gradient_rgb();
        let b = DynamicImage::ImageRgb8(RgbImage::from_fn(32, 32, |x, y| image::Rgb([(y * 7) as u8, 90, (x * 3) as u8])));
        assert_eq!(histogram_score(&a, &b), histogram_score(&b, &a));
    }

    #[test]
    fn test_mixed_grey_and_colour_compare_as_colour() {
        let g = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, image::Luma([77])));
        let c = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, image::Rgb([77, 77, 77])));
        assert_eq!(histogram_score(&g, &c), Some(1.0));
    }

    #[test]
    fn test_empty_crop_is_absent() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(histogram_score(&empty, &gradient_rgb()).is_none());
    }

    #[test]
    fn test_comparison_measures_on_identical() {
        let h = normalized_histogram([1u8, 2, 2, 3, 3, 3].into_iter());
        assert!((Comparison::Correlation.compare(&h, &h) - 1.0).abs() < 1e-12);
        assert_eq!(Comparison::ChiSquareAlt.compare(&h, &h), 0.0);
        assert!((Comparison::NormalizedIntersection.compare(&h, &h) - 1.0).abs() < 1e-12);
        assert!(Comparison::Bhattacharyya.compare(&h, &h) < 1e-6);
    }

    #[test]
    fn test_chi_square_alt_and_normalized_intersection_forms() {
        let a = [1.0, 0.0, 3.0];
        let b = [0.0, 2.0, 1.0];
        // 2 * (1/1 + 4/2 + 4/4)
        assert!((Comparison::ChiSquareAlt.compare(&a, &b) - 8.0).abs() < 1e-12);
        assert!((Comparison::ChiSquareAlt.compare(&b, &a) - 8.0).abs() < 1e-12);
        // min mass 1 over the larger total 4.
        assert!((Comparison::NormalizedIntersection.compare(&a, &b) - 0.25).abs() < 1e-12);
        assert!((Comparison::NormalizedIntersection.compare(&b, &a) - 0.25).abs() < 1e-12);
        assert_eq!(Comparison::NormalizedIntersection.compare(&[0.0; 3], &[0.0; 3]), 1.0);
    }
}
