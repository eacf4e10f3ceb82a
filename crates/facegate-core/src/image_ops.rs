//! Pixel kernels shared by preprocessing, extraction and scoring.
//!
//! Everything operates on packed `u8`/`f32` buffers in row-major order. Border
//! handling mirrors without repeating the edge pixel (`gfedcb|abcdefgh|gfedcba`).

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array2;

use crate::types::Rect;

/// Tile grid used for every CLAHE pass.
pub const CLAHE_TILES: u32 = 8;
/// Clip limit in OpenCV units (multiples of the mean bin height).
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place.
///
/// Divides the image into a `tiles` × `tiles` grid, clips each tile histogram
/// at `clip_limit × tile_pixels / 256`, redistributes the excess, and maps
/// every pixel by bilinear interpolation between the four nearest tile CDFs.
/// Images smaller than the grid are left untouched.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || tiles == 0 || gray.len() < w * h {
        return;
    }

    let tx = tiles as usize;
    let ty = tiles as usize;
    let tile_w = w / tx;
    let tile_h = h / ty;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(tx * ty);

    for row in 0..ty {
        for col in 0..tx {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[gray[y * w + x] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            // Tile mapping: scaled CDF so the brightest occupied bin lands on 255.
            let mut cdf = [0f32; 256];
            let mut acc = 0f32;
            let scale = 255.0 / tile_pixels as f32;
            for (i, &count) in hist.iter().enumerate() {
                acc += count as f32;
                cdf[i] = (acc * scale).clamp(0.0, 255.0);
            }
            cdfs.push(cdf);
        }
    }

    for y in 0..h {
        for x in 0..w {
            let pixel = gray[y * w + x] as usize;

            let fy = ((y as f32 + 0.5) / tile_h as f32 - 0.5).clamp(0.0, (ty - 1) as f32);
            let fx = ((x as f32 + 0.5) / tile_w as f32 - 0.5).clamp(0.0, (tx - 1) as f32);

            let r0 = fy as usize;
            let c0 = fx as usize;
            let r1 = (r0 + 1).min(ty - 1);
            let c1 = (c0 + 1).min(tx - 1);

            let dy = fy - r0 as f32;
            let dx = fx - c0 as f32;

            let tl = cdfs[r0 * tx + c0][pixel];
            let tr = cdfs[r0 * tx + c1][pixel];
            let bl = cdfs[r1 * tx + c0][pixel];
            let br = cdfs[r1 * tx + c1][pixel];

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bot * dy;

            gray[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Global histogram equalization.
pub fn equalize(gray: &GrayImage) -> GrayImage {
    imageproc::contrast::equalize_histogram(gray)
}

/// Mirror an out-of-range index back into `0..n` without repeating the edge.
pub(crate) fn reflect101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let last = n as isize - 1;
    let mut i = i;
    loop {
        if i < 0 {
            i = -i;
        } else if i > last {
            i = 2 * last - i;
        } else {
            return i as usize;
        }
    }
}

/// 1-D Gaussian kernel for an odd aperture with sigma derived from its size.
///
/// Apertures up to 7 use the fixed binomial tables OpenCV uses for `sigma = 0`,
/// so blurs match the classical pipeline bit for bit on integer inputs.
pub fn gaussian_kernel(ksize: usize) -> Vec<f32> {
    match ksize {
        0 | 1 => vec![1.0],
        3 => vec![0.25, 0.5, 0.25],
        5 => vec![0.0625, 0.25, 0.375, 0.25, 0.0625],
        7 => vec![0.03125, 0.109375, 0.21875, 0.28125, 0.21875, 0.109375, 0.03125],
        _ => {
            let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
            let half = (ksize / 2) as isize;
            let raw: Vec<f32> = (-half..=half)
                .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
                .collect();
            let total: f32 = raw.iter().sum();
            raw.into_iter().map(|v| v / total).collect()
        }
    }
}

/// Separable convolution of a single-channel float plane.
pub fn convolve_separable(plane: &[f32], width: usize, height: usize, kernel: &[f32]) -> Vec<f32> {
    if width == 0 || height == 0 || plane.len() < width * height || kernel.is_empty() {
        return plane.to_vec();
    }
    let half = (kernel.len() / 2) as isize;

    let mut horizontal = vec![0f32; width * height];
    for y in 0..height {
        let row = &plane[y * width..(y + 1) * width];
        for x in 0..width {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = reflect101(x as isize + k as isize - half, width);
                acc += row[sx] * weight;
            }
            horizontal[y * width + x] = acc;
        }
    }

    let mut out = vec![0f32; width * height];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = reflect101(y as isize + k as isize - half, height);
                acc += horizontal[sy * width + x] * weight;
            }
            out[y * width + x] = acc;
        }
    }
    out
}

/// Gaussian blur of an 8-bit greyscale image.
pub fn gaussian_blur(gray: &GrayImage, ksize: usize) -> GrayImage {
    let (w, h) = gray.dimensions();
    let plane: Vec<f32> = gray.as_raw().iter().map(|&p| p as f32).collect();
    let blurred = convolve_separable(&plane, w as usize, h as usize, &gaussian_kernel(ksize));
    let data = blurred.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect();
    GrayImage::from_raw(w, h, data).unwrap_or_else(|| gray.clone())
}

/// Gaussian blur of a float plane.
pub fn gaussian_blur_plane(plane: &Array2<f32>, ksize: usize) -> Array2<f32> {
    let (h, w) = plane.dim();
    let flat: Vec<f32> = plane.iter().copied().collect();
    let blurred = convolve_separable(&flat, w, h, &gaussian_kernel(ksize));
    Array2::from_shape_vec((h, w), blurred).unwrap_or_else(|_| plane.clone())
}

/// 3×3 Laplacian (`[2 0 2; 0 -8 0; 2 0 2]`) saturated to 8 bits; negative responses clip to 0.
pub fn laplacian(gray: &GrayImage) -> GrayImage {
    const KERNEL: [[i32; 3]; 3] = [[2, 0, 2], [0, -8, 0], [2, 0, 2]];
    let (w, h) = gray.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let src = gray.as_raw();
    let mut out = vec![0u8; wu * hu];

    for y in 0..hu {
        for x in 0..wu {
            let mut acc = 0i32;
            for (ky, row) in KERNEL.iter().enumerate() {
                let sy = reflect101(y as isize + ky as isize - 1, hu);
                for (kx, &k) in row.iter().enumerate() {
                    if k == 0 {
                        continue;
                    }
                    let sx = reflect101(x as isize + kx as isize - 1, wu);
                    acc += k * src[sy * wu + sx] as i32;
                }
            }
            out[y * wu + x] = acc.clamp(0, 255) as u8;
        }
    }
    GrayImage::from_raw(w, h, out).unwrap_or_else(|| gray.clone())
}

/// Edge-preserving bilateral filter over interleaved 8-bit channels.
///
/// Neighbours lie on a disc of radius `diameter / 2`; colour distance is the
/// L1 sum over channels. Supports 1–4 channels; anything else is returned as is.
pub fn bilateral_filter(
    data: &[u8],
    width: u32,
    height: u32,
    channels: usize,
    diameter: u32,
    sigma_color: f32,
    sigma_space: f32,
) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || channels == 0 || channels > 4 || data.len() < w * h * channels {
        return data.to_vec();
    }

    let radius = (diameter / 2).max(1) as isize;
    let space_coeff = -0.5 / (sigma_space * sigma_space);
    let color_coeff = -0.5 / (sigma_color * sigma_color);

    let mut offsets: Vec<(isize, isize, f32)> = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f32;
            if r2.sqrt() > radius as f32 {
                continue;
            }
            offsets.push((dx, dy, (r2 * space_coeff).exp()));
        }
    }

    let color_lut: Vec<f32> = (0..=255 * channels)
        .map(|d| {
            let d = d as f32;
            (d * d * color_coeff).exp()
        })
        .collect();

    let mut out = vec![0u8; w * h * channels];
    for y in 0..h {
        for x in 0..w {
            let center = (y * w + x) * channels;
            let mut sum = [0f32; 4];
            let mut weight_sum = 0f32;

            for &(dx, dy, space_weight) in &offsets {
                let nx = reflect101(x as isize + dx, w);
                let ny = reflect101(y as isize + dy, h);
                let n = (ny * w + nx) * channels;

                let diff: usize = (0..channels)
                    .map(|c| (data[n + c] as i32 - data[center + c] as i32).unsigned_abs() as usize)
                    .sum();
                let weight = space_weight * color_lut[diff];
                for c in 0..channels {
                    sum[c] += weight * data[n + c] as f32;
                }
                weight_sum += weight;
            }

            for c in 0..channels {
                out[center + c] = (sum[c] / weight_sum).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Split RGB into BT.601 Y, U, V planes (U/V offset by 128).
pub fn rgb_to_yuv(rgb: &RgbImage) -> [Vec<u8>; 3] {
    let n = (rgb.width() * rgb.height()) as usize;
    let mut planes = [vec![0u8; n], vec![0u8; n], vec![0u8; n]];
    for (i, px) in rgb.pixels().enumerate() {
        let [r, g, b] = px.0.map(|c| c as f32);
        let y = 0.299 * r + 0.587 * g + 0.114 * b;
        let u = 0.492 * (b - y) + 128.0;
        let v = 0.877 * (r - y) + 128.0;
        planes[0][i] = y.round().clamp(0.0, 255.0) as u8;
        planes[1][i] = u.round().clamp(0.0, 255.0) as u8;
        planes[2][i] = v.round().clamp(0.0, 255.0) as u8;
    }
    planes
}

/// Inverse of [`rgb_to_yuv`].
pub fn yuv_to_rgb(planes: &[Vec<u8>; 3], width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let i = (y * width + x) as usize;
        let yy = planes[0][i] as f32;
        let u = planes[1][i] as f32 - 128.0;
        let v = planes[2][i] as f32 - 128.0;
        let r = yy + 1.140 * v;
        let g = yy - 0.395 * u - 0.581 * v;
        let b = yy + 2.032 * u;
        image::Rgb([r, g, b].map(|c| c.round().clamp(0.0, 255.0) as u8))
    })
}

// D65 white point used by both Lab directions.
const XN: f32 = 0.950456;
const ZN: f32 = 1.088754;
const LAB_EPSILON: f32 = 0.008856;

fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        12.92 * c
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

fn lab_f(t: f32) -> f32 {
    if t > LAB_EPSILON {
        t.cbrt()
    } else {
        7.787 * t + 16.0 / 116.0
    }
}

fn lab_f_inv(f: f32) -> f32 {
    let cube = f * f * f;
    if cube > LAB_EPSILON {
        cube
    } else {
        (f - 16.0 / 116.0) / 7.787
    }
}

/// Split RGB into 8-bit CIE L*a*b* planes (L scaled to 0–255, a/b offset by 128).
pub fn rgb_to_lab(rgb: &RgbImage) -> [Vec<u8>; 3] {
    let n = (rgb.width() * rgb.height()) as usize;
    let mut planes = [vec![0u8; n], vec![0u8; n], vec![0u8; n]];
    for (i, px) in rgb.pixels().enumerate() {
        let [r, g, b] = px.0.map(|c| srgb_to_linear(c as f32 / 255.0));
        let x = (0.412453 * r + 0.357580 * g + 0.180423 * b) / XN;
        let y = 0.212671 * r + 0.715160 * g + 0.072169 * b;
        let z = (0.019334 * r + 0.119193 * g + 0.950227 * b) / ZN;

        let l = if y > LAB_EPSILON { 116.0 * y.cbrt() - 16.0 } else { 903.3 * y };
        let a = 500.0 * (lab_f(x) - lab_f(y));
        let bb = 200.0 * (lab_f(y) - lab_f(z));

        planes[0][i] = (l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8;
        planes[1][i] = (a + 128.0).round().clamp(0.0, 255.0) as u8;
        planes[2][i] = (bb + 128.0).round().clamp(0.0, 255.0) as u8;
    }
    planes
}

/// Inverse of [`rgb_to_lab`].
pub fn lab_to_rgb(planes: &[Vec<u8>; 3], width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let i = (y * width + x) as usize;
        let l = planes[0][i] as f32 * 100.0 / 255.0;
        let a = planes[1][i] as f32 - 128.0;
        let b = planes[2][i] as f32 - 128.0;

        let fy = (l + 16.0) / 116.0;
        let fx = fy + a / 500.0;
        let fz = fy - b / 200.0;

        let yy = if l > 7.9996 { fy * fy * fy } else { l / 903.3 };
        let xx = lab_f_inv(fx) * XN;
        let zz = lab_f_inv(fz) * ZN;

        let r = 3.240479 * xx - 1.537150 * yy - 0.498535 * zz;
        let g = -0.969256 * xx + 1.875992 * yy + 0.041556 * zz;
        let bl = 0.055648 * xx - 0.204043 * yy + 1.057311 * zz;

        image::Rgb([r, g, bl].map(|c| (linear_to_srgb(c.clamp(0.0, 1.0)) * 255.0).round().clamp(0.0, 255.0) as u8))
    })
}

/// Greyscale 8-bit image as a float plane scaled to [0, 1].
pub fn to_unit_plane(gray: &GrayImage) -> Array2<f32> {
    let (w, h) = gray.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| gray.get_pixel(x as u32, y as u32).0[0] as f32 / 255.0)
}

/// Float plane in [0, 1] back to 8 bits (truncating, like a `uint8` cast of `v × 255`).
pub fn from_unit_plane(plane: &Array2<f32>) -> GrayImage {
    let (h, w) = plane.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let v = plane[[y as usize, x as usize]] * 255.0;
        image::Luma([v.clamp(0.0, 255.0) as u8])
    })
}

/// Bilinear resize of a greyscale image.
pub fn resize_gray(gray: &GrayImage, width: u32, height: u32) -> GrayImage {
    image::imageops::resize(gray, width, height, FilterType::Triangle)
}

/// Crop a rectangle out of any image; the rectangle is clipped to the image first.
pub fn crop(image: &DynamicImage, rect: Rect) -> Option<DynamicImage> {
    let r = rect.clamp_to(image.width(), image.height())?;
    Some(image.crop_imm(r.x, r.y, r.width, r.height))
}

/// Crop a rectangle out of a greyscale image.
pub fn crop_gray(gray: &GrayImage, rect: Rect) -> Option<GrayImage> {
    let r = rect.clamp_to(gray.width(), gray.height())?;
    Some(image::imageops::crop_imm(gray, r.x, r.y, r.width, r.height).to_image())
}
