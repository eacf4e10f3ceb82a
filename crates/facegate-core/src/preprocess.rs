//! Lighting normalisation applied to every input image and again to face crops.

use image::{DynamicImage, GrayImage, RgbImage};

use crate::image_ops::{
    bilateral_filter, clahe_enhance, lab_to_rgb, rgb_to_lab, rgb_to_yuv, yuv_to_rgb, CLAHE_CLIP_LIMIT, CLAHE_TILES,
};

const BILATERAL_DIAMETER: u32 = 9;
const BILATERAL_SIGMA_COLOR: f32 = 75.0;
const BILATERAL_SIGMA_SPACE: f32 = 75.0;

/// CLAHE on luminance, bilateral denoise, CLAHE on Lab lightness.
///
/// Greyscale inputs stay greyscale (CLAHE then bilateral); everything else is
/// processed as 8-bit RGB. Never fails: degenerate inputs come back unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    pub fn enhance(&self, image: &DynamicImage) -> DynamicImage {
        if image.width() == 0 || image.height() == 0 {
            return image.clone();
        }
        if is_grayscale(image) {
            DynamicImage::ImageLuma8(enhance_gray(&image.to_luma8()))
        } else {
            DynamicImage::ImageRgb8(enhance_rgb(&image.to_rgb8()))
        }
    }
}

pub(crate) fn is_grayscale(image: &DynamicImage) -> bool {
    matches!(
        image,
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLumaA16(_)
    )
}

fn enhance_gray(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    let mut data = gray.as_raw().clone();
    clahe_enhance(&mut data, w, h, CLAHE_TILES, CLAHE_CLIP_LIMIT);
    let filtered = bilateral_filter(&data, w, h, 1, BILATERAL_DIAMETER, BILATERAL_SIGMA_COLOR, BILATERAL_SIGMA_SPACE);
    GrayImage::from_raw(w, h, filtered).unwrap_or_else(|| gray.clone())
}

fn enhance_rgb(rgb: &RgbImage) -> RgbImage {
    let (w, h) = rgb.dimensions();

    let mut yuv = rgb_to_yuv(rgb);
    clahe_enhance(&mut yuv[0], w, h, CLAHE_TILES, CLAHE_CLIP_LIMIT);
    let equalized = yuv_to_rgb(&yuv, w, h);

    let filtered = bilateral_filter(
        equalized.as_raw(),
        w,
        h,
        3,
        BILATERAL_DIAMETER,
        BILATERAL_SIGMA_COLOR,
        BILATERAL_SIGMA_SPACE,
    );
    let Some(denoised) = RgbImage::from_raw(w, h, filtered) else {
        return equalized;
    };

    let mut lab = rgb_to_lab(&denoised);
    clahe_enhance(&mut lab[0], w, h, CLAHE_TILES, CLAHE_CLIP_LIMIT);
    lab_to_rgb(&lab, w, h)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean(img: &GrayImage) -> f32 {
        img.pixels().map(|p| p.0[0] as f32).sum::<f32>() / (img.width() * img.height()) as f32
    }

    #[test]
    fn test_grayscale_stays_grayscale() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |x, y| image::Luma([((x + y) % 50 + 90) as u8])));
        let out = ImagePreprocessor.enhance(&img);
        assert!(matches!(out, DynamicImage::ImageLuma8(_)));
        assert_eq!((out.width(), out.height()), (64, 64));
    }

    #[test]
    fn test_colour_output_is_rgb_same_size() {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(48, 40, image::Rgba([120, 80, 60, 255])));
        let out = ImagePreprocessor.enhance(&img);
        assert!(matches!(out, DynamicImage::ImageRgb8(_)));
        assert_eq!((out.width(), out.height()), (48, 40));
    }

    #[test]
    fn test_dark_noisy_image_is_lifted() {
        let mut state = 12345u32;
        let gray = GrayImage::from_fn(64, 64, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            image::Luma([30 + ((state >> 16) % 16) as u8])
        });
        let before = mean(&gray);
        let out = ImagePreprocessor.enhance(&DynamicImage::ImageLuma8(gray)).to_luma8();
        assert!(mean(&out) > before + 50.0, "{} -> {}", before, mean(&out));
    }

    #[test]
    fn test_empty_image_unchanged() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        let out = ImagePreprocessor.enhance(&img);
        assert_eq!((out.width(), out.height()), (0, 0));
    }

    #[test]
    fn test_deterministic() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(40, 40, |x, y| image::Rgb([(x * 6) as u8, (y * 6) as u8, 90])));
        let a = ImagePreprocessor.enhance(&img);
        let b = ImagePreprocessor.enhance(&img);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
