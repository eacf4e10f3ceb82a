//! Oriented FAST keypoints with rotated BRIEF descriptors, and Hamming matching.
//!
//! Detection runs FAST-9 on the face crop, keeps local maxima, and orders them
//! by corner score. Each keypoint gets an intensity-centroid orientation and a
//! 256-bit binary descriptor sampled from a fixed random pair pattern, rotated
//! to that orientation on a lightly smoothed copy of the image.

use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::image_ops::gaussian_blur;

/// Descriptor length in bytes (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// Keypoints closer than this to the image edge are discarded.
const EDGE_BORDER: u32 = 19;
/// Radius of the orientation patch.
const ORIENTATION_RADIUS: i32 = 15;
/// Sampling pairs are drawn from `[-PATCH_HALF, PATCH_HALF]²`.
const PATCH_HALF: i32 = 13;
/// Contiguous arc length for a FAST corner.
const FAST_ARC: usize = 9;

/// Bresenham circle of radius 3, clockwise from twelve o'clock.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3), (1, -3), (2, -2), (3, -1), (3, 0), (3, 1), (2, 2), (1, 3),
    (0, 3), (-1, 3), (-2, 2), (-3, 1), (-3, 0), (-3, -1), (-2, -2), (-1, -3),
];

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("k-NN matching with k={k} needs at least {k} train descriptors, got {got}")]
    TooFewCandidates { k: usize, got: usize },
    #[error("no query descriptors")]
    EmptyQuery,
}

/// A detected corner in crop coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Orientation in radians.
    pub angle: f32,
    /// FAST corner score.
    pub response: f32,
}

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// One query→train correspondence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

/// Local-feature detector/descriptor.
pub trait KeypointExtractor: Send + Sync {
    fn detect_and_compute(&self, gray: &GrayImage) -> (Vec<Keypoint>, Vec<Descriptor>);

    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct OrbConfig {
    pub fast_threshold: u8,
    pub max_features: usize,
    /// Seed for the sampling-pair pattern. Descriptors are only comparable
    /// between extractors built with the same seed.
    pub pattern_seed: u64,
}

impl Default for OrbConfig {
    fn default() -> Self {
        Self {
            fast_threshold: 20,
            max_features: 500,
            pattern_seed: 0x0b5e_55ed,
        }
    }
}

pub struct OrbExtractor {
    config: OrbConfig,
    pattern: Vec<[(i32, i32); 2]>,
}

impl OrbExtractor {
    pub fn new(config: OrbConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.pattern_seed);
        let pattern = (0..DESCRIPTOR_BYTES * 8)
            .map(|_| {
                let mut point = || (rng.gen_range(-PATCH_HALF..=PATCH_HALF), rng.gen_range(-PATCH_HALF..=PATCH_HALF));
                [point(), point()]
            })
            .collect();
        Self { config, pattern }
    }

    /// FAST-9 corners with 3×3 non-maximum suppression, strongest first.
    pub fn detect(&self, gray: &GrayImage) -> Vec<Keypoint> {
        let (w, h) = gray.dimensions();
        if w <= 2 * EDGE_BORDER || h <= 2 * EDGE_BORDER {
            return Vec::new();
        }

        let t = self.config.fast_threshold as i32;
        let wu = w as usize;
        let mut scores = vec![0f32; (w * h) as usize];
        for y in EDGE_BORDER..h - EDGE_BORDER {
            for x in EDGE_BORDER..w - EDGE_BORDER {
                scores[y as usize * wu + x as usize] = fast_score(gray, x, y, t);
            }
        }

        let mut keypoints = Vec::new();
        for y in EDGE_BORDER..h - EDGE_BORDER {
            for x in EDGE_BORDER..w - EDGE_BORDER {
                let idx = y as usize * wu + x as usize;
                let s = scores[idx];
                if s <= 0.0 {
                    continue;
                }
                let mut is_max = true;
                'nms: for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let n = ((y as i32 + dy) as usize) * wu + (x as i32 + dx) as usize;
                        // Ties go to the first pixel in raster order.
                        let earlier = dy < 0 || (dy == 0 && dx < 0);
                        if scores[n] > s || (earlier && scores[n] == s) {
                            is_max = false;
                            break 'nms;
                        }
                    }
                }
                if is_max {
                    keypoints.push(Keypoint {
                        x: x as f32,
                        y: y as f32,
                        angle: intensity_centroid_angle(gray, x, y),
                        response: s,
                    });
                }
            }
        }

        keypoints.sort_by(|a, b| {
            b.response
                .total_cmp(&a.response)
                .then(a.y.total_cmp(&b.y))
                .then(a.x.total_cmp(&b.x))
        });
        keypoints.truncate(self.config.max_features);
        keypoints
    }

    /// Rotated-BRIEF descriptors for the given keypoints, in order.
    pub fn compute(&self, gray: &GrayImage, keypoints: &[Keypoint]) -> Vec<Descriptor> {
        let smoothed = gaussian_blur(gray, 5);
        keypoints
            .iter()
            .map(|kp| {
                let (sin, cos) = kp.angle.sin_cos();
                let mut bytes = [0u8; DESCRIPTOR_BYTES];
                for (bit, [p, q]) in self.pattern.iter().enumerate() {
                    let a = sample_rotated(&smoothed, kp, *p, sin, cos);
                    let b = sample_rotated(&smoothed, kp, *q, sin, cos);
                    if a < b {
                        bytes[bit / 8] |= 1 << (bit % 8);
                    }
                }
                Descriptor(bytes)
            })
            .collect()
    }
}

impl Default for OrbExtractor {
    fn default() -> Self {
        Self::new(OrbConfig::default())
    }
}

impl KeypointExtractor for OrbExtractor {
    fn detect_and_compute(&self, gray: &GrayImage) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let keypoints = self.detect(gray);
        let descriptors = self.compute(gray, &keypoints);
        (keypoints, descriptors)
    }

    fn name(&self) -> &str {
        "orb"
    }
}

/// Sum of excess contrast over the strongest qualifying arc; 0 when not a corner.
fn fast_score(gray: &GrayImage, x: u32, y: u32, t: i32) -> f32 {
    let center = gray.get_pixel(x, y).0[0] as i32;
    let ring: Vec<i32> = CIRCLE
        .iter()
        .map(|(dx, dy)| gray.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[0] as i32 - center)
        .collect();

    let mut best = 0i32;
    for sign in [1i32, -1] {
        let mut run = 0usize;
        let mut run_sum = 0i32;
        // Walk the ring twice so arcs wrapping past twelve o'clock are seen.
        for i in 0..CIRCLE.len() * 2 {
            let d = ring[i % CIRCLE.len()] * sign;
            if d > t {
                run += 1;
                run_sum += d - t;
                if run >= FAST_ARC {
                    best = best.max(run_sum);
                }
                if run == CIRCLE.len() {
                    break;
                }
            } else {
                run = 0;
                run_sum = 0;
            }
        }
    }
    best as f32
}

fn intensity_centroid_angle(gray: &GrayImage, x: u32, y: u32) -> f32 {
    let (w, h) = gray.dimensions();
    let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;
    let mut m01 = 0f64;
    let mut m10 = 0f64;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let px = x as i32 + dx;
            let py = y as i32 + dy;
            if px < 0 || py < 0 || px >= w as i32 || py >= h as i32 {
                continue;
            }
            let v = gray.get_pixel(px as u32, py as u32).0[0] as f64;
            m10 += dx as f64 * v;
            m01 += dy as f64 * v;
        }
    }
    m01.atan2(m10) as f32
}

fn sample_rotated(img: &GrayImage, kp: &Keypoint, (px, py): (i32, i32), sin: f32, cos: f32) -> u8 {
    let rx = px as f32 * cos - py as f32 * sin;
    let ry = px as f32 * sin + py as f32 * cos;
    let sx = (kp.x + rx).round().clamp(0.0, (img.width() - 1) as f32) as u32;
    let sy = (kp.y + ry).round().clamp(0.0, (img.height() - 1) as f32) as u32;
    img.get_pixel(sx, sy).0[0]
}

/// For each query descriptor, its `k` nearest train descriptors by Hamming distance.
///
/// Ties keep the lower train index first.
pub fn knn_match(query: &[Descriptor], train: &[Descriptor], k: usize) -> Result<Vec<Vec<DescriptorMatch>>, MatchError> {
    if query.is_empty() {
        return Err(MatchError::EmptyQuery);
    }
    if train.len() < k {
        return Err(MatchError::TooFewCandidates { k, got: train.len() });
    }

    Ok(query
        .iter()
        .enumerate()
        .map(|(qi, q)| {
            let mut all: Vec<DescriptorMatch> = train
                .iter()
                .enumerate()
                .map(|(ti, t)| DescriptorMatch { query: qi, train: ti, distance: q.hamming(t) })
                .collect();
            all.sort_by_key(|m| (m.distance, m.train));
            all.truncate(k);
            all
        })
        .collect())
}

/// Count k-NN results whose best distance is below `ratio` × the second best.
pub fn ratio_test(knn: &[Vec<DescriptorMatch>], ratio: f32) -> usize {
    knn.iter()
        .filter(|pair| match pair.as_slice() {
            [best, second, ..] => (best.distance as f32) < ratio * second.distance as f32,
            _ => false,
        })
        .count()
}
