//! Structural similarity between normalised face planes.
//!
//! Mean SSIM uses a 7×7 uniform window with sample covariance, K1 = 0.01,
//! K2 = 0.03 and a data range of 1.0, averaged over the windows that fit
//! entirely inside the image.

use ndarray::Array2;

use crate::image_ops::{from_unit_plane, gaussian_blur_plane, to_unit_plane};

const WINDOW: usize = 7;
const K1: f64 = 0.01;
const K2: f64 = 0.03;
const DATA_RANGE: f64 = 1.0;
const BLUR_KSIZE: usize = 5;
const CANNY_LOW: f32 = 100.0;
const CANNY_HIGH: f32 = 200.0;

/// Summed-area table with a zero top row and left column.
struct Integral {
    stride: usize,
    table: Vec<f64>,
}

impl Integral {
    fn new(h: usize, w: usize, value: impl Fn(usize, usize) -> f64) -> Self {
        let stride = w + 1;
        let mut table = vec![0f64; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0f64;
            for x in 0..w {
                row += value(y, x);
                table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row;
            }
        }
        Self { stride, table }
    }

    fn window(&self, y: usize, x: usize, size: usize) -> f64 {
        let s = self.stride;
        let (y1, x1) = (y + size, x + size);
        self.table[y1 * s + x1] - self.table[y * s + x1] - self.table[y1 * s + x] + self.table[y * s + x]
    }
}

/// Mean SSIM of two equally sized planes. `None` if shapes differ or are smaller than the window.
pub fn ssim(a: &Array2<f32>, b: &Array2<f32>) -> Option<f32> {
    if a.dim() != b.dim() {
        return None;
    }
    let (h, w) = a.dim();
    if h < WINDOW || w < WINDOW {
        return None;
    }

    let sa = Integral::new(h, w, |y, x| a[[y, x]] as f64);
    let sb = Integral::new(h, w, |y, x| b[[y, x]] as f64);
    let saa = Integral::new(h, w, |y, x| (a[[y, x]] as f64).powi(2));
    let sbb = Integral::new(h, w, |y, x| (b[[y, x]] as f64).powi(2));
    let sab = Integral::new(h, w, |y, x| a[[y, x]] as f64 * b[[y, x]] as f64);

    let np = (WINDOW * WINDOW) as f64;
    let cov_norm = np / (np - 1.0);
    let c1 = (K1 * DATA_RANGE).powi(2);
    let c2 = (K2 * DATA_RANGE).powi(2);

    let mut total = 0f64;
    let mut count = 0usize;
    for y in 0..=h - WINDOW {
        for x in 0..=w - WINDOW {
            let ux = sa.window(y, x, WINDOW) / np;
            let uy = sb.window(y, x, WINDOW) / np;
            let vx = cov_norm * (saa.window(y, x, WINDOW) / np - ux * ux);
            let vy = cov_norm * (sbb.window(y, x, WINDOW) / np - uy * uy);
            let vxy = cov_norm * (sab.window(y, x, WINDOW) / np - ux * uy);

            let num = (2.0 * ux * uy + c1) * (2.0 * vxy + c2);
            let den = (ux * ux + uy * uy + c1) * (vx + vy + c2);
            total += num / den;
            count += 1;
        }
    }

    let mean = (total / count as f64) as f32;
    mean.is_finite().then_some(mean)
}

/// Best SSIM over the raw, Gaussian-blurred and Canny-edge versions, clamped to [0, 1].
pub fn structural_score(a: &Array2<f32>, b: &Array2<f32>) -> Option<f32> {
    let raw = ssim(a, b);
    let blurred = ssim(&gaussian_blur_plane(a, BLUR_KSIZE), &gaussian_blur_plane(b, BLUR_KSIZE));
    let edges = ssim(&canny_plane(a), &canny_plane(b));

    [raw, blurred, edges]
        .into_iter()
        .flatten()
        .reduce(f32::max)
        .map(|s| s.clamp(0.0, 1.0))
}

/// `1 − min(1, mean squared error)` on raw pixels.
pub fn mse_score(a: &Array2<f32>, b: &Array2<f32>) -> Option<f32> {
    if a.dim() != b.dim() || a.is_empty() {
        return None;
    }
    let mse = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| ((x - y) as f64).powi(2))
        .sum::<f64>()
        / a.len() as f64;
    Some((1.0 - mse.min(1.0)) as f32)
}

fn canny_plane(plane: &Array2<f32>) -> Array2<f32> {
    let edges = imageproc::edges::canny(&from_unit_plane(plane), CANNY_LOW, CANNY_HIGH);
    to_unit_plane(&edges)
}
