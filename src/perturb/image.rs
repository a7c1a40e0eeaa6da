use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageReader, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::Rng;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use super::PerturbError;

/// Randomized adjustments for one image. Crop is only drawn for images
/// larger than 100 px on both sides.
struct Plan {
    brightness: f32,
    contrast: f32,
    saturation: f32,
    sharpness: f32,
    /// Pixels to trim per edge: left, top, right, bottom.
    crop: Option<[u32; 4]>,
    rotate: Option<f32>,
    blur: Option<f32>,
    noise: bool,
    quality: u8,
}

impl Plan {
    fn draw(rng: &mut StdRng, width: u32, height: u32) -> Self {
        let crop = (width > 100 && height > 100).then(|| {
            [
                rng.random_range(1..=5),
                rng.random_range(1..=5),
                rng.random_range(1..=5),
                rng.random_range(1..=5),
            ]
        });
        Self {
            brightness: rng.random_range(0.95..=1.05),
            contrast: rng.random_range(0.95..=1.05),
            saturation: rng.random_range(0.97..=1.03),
            sharpness: rng.random_range(0.95..=1.05),
            crop,
            rotate: rng.random_bool(0.5).then(|| rng.random_range(-0.5..=0.5)),
            blur: rng.random_bool(0.5).then(|| rng.random_range(0.1..=0.3)),
            noise: rng.random_bool(0.5),
            quality: rng.random_range(82..=92),
        }
    }

    fn describe(&self) -> String {
        let mut parts = vec![
            format!("brightness:{:.3}", self.brightness),
            format!("contrast:{:.3}", self.contrast),
            format!("saturation:{:.3}", self.saturation),
            format!("sharpness:{:.3}", self.sharpness),
        ];
        if let Some([l, t, r, b]) = self.crop {
            parts.push(format!("crop:{l},{t},{r},{b}"));
        }
        if let Some(angle) = self.rotate {
            parts.push(format!("rotate:{angle:.2}"));
        }
        if let Some(sigma) = self.blur {
            parts.push(format!("blur:{sigma:.2}"));
        }
        if self.noise {
            parts.push("noise:minimal".into());
        }
        parts.push(format!("quality:{}", self.quality));
        parts.join(" | ")
    }
}

/// Apply a freshly drawn plan to `input` and write the result as JPEG to
/// `output`. The output keeps the input's dimensions.
pub(super) fn make_unique(
    rng: &mut StdRng,
    input: &Path,
    output: &Path,
) -> Result<PathBuf, PerturbError> {
    if !input.exists() {
        return Err(PerturbError::NotFound(input.to_path_buf()));
    }

    let img = ImageReader::open(input)?.with_guessed_format()?.decode()?;
    let mut img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let plan = Plan::draw(rng, width, height);

    adjust_colors(&mut img, plan.brightness, plan.contrast, plan.saturation);
    let mut img = adjust_sharpness(&img, plan.sharpness);
    if let Some([left, top, right, bottom]) = plan.crop {
        let cropped = imageops::crop_imm(
            &img,
            left,
            top,
            width - left - right,
            height - top - bottom,
        )
        .to_image();
        // resample back to the original size so new pixel values appear
        img = imageops::resize(&cropped, width, height, FilterType::Lanczos3);
    }
    if let Some(angle) = plan.rotate {
        img = micro_rotate(&img, angle);
    }
    if let Some(sigma) = plan.blur {
        img = imageops::blur(&img, sigma);
    }
    if plan.noise {
        sprinkle_noise(&mut img, rng);
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = fs::File::create(output)?;
    let mut writer = BufWriter::new(file);
    img.write_with_encoder(JpegEncoder::new_with_quality(&mut writer, plan.quality))?;
    writer.flush()?;

    info!(file = %output.display(), changes = %plan.describe(), "image perturbed");
    Ok(output.to_path_buf())
}

/// One pass applying multiplicative brightness, midpoint contrast, and
/// luma-anchored saturation.
fn adjust_colors(img: &mut RgbImage, brightness: f32, contrast: f32, saturation: f32) {
    for pixel in img.pixels_mut() {
        let [r, g, b] = pixel.0;
        let (mut r, mut g, mut b) = (r as f32, g as f32, b as f32);

        r *= brightness;
        g *= brightness;
        b *= brightness;

        r = 128.0 + (r - 128.0) * contrast;
        g = 128.0 + (g - 128.0) * contrast;
        b = 128.0 + (b - 128.0) * contrast;

        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        r = luma + (r - luma) * saturation;
        g = luma + (g - luma) * saturation;
        b = luma + (b - luma) * saturation;

        pixel.0 = [clamp_u8(r), clamp_u8(g), clamp_u8(b)];
    }
}

/// Sharpness as a single 3x3 kernel: identity plus `factor - 1` times the
/// difference from a box blur. The kernel sums to 1, so overall brightness
/// is untouched.
fn adjust_sharpness(img: &RgbImage, factor: f32) -> RgbImage {
    let amount = factor - 1.0;
    let off = -amount / 9.0;
    let center = 1.0 + amount + off;
    let kernel = [off, off, off, off, center, off, off, off, off];
    imageops::filter3x3(img, &kernel)
}

/// Rotate by a fraction of a degree about the center, bilinear resample,
/// white fill at the edges. Dimensions are unchanged.
fn micro_rotate(img: &RgbImage, degrees: f32) -> RgbImage {
    let (width, height) = img.dimensions();
    let rad = degrees.to_radians();
    let (sin, cos) = (rad.sin(), rad.cos());
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    RgbImage::from_fn(width, height, |x, y| {
        let dx = x as f32 + 0.5 - cx;
        let dy = y as f32 + 0.5 - cy;
        let sx = cx + dx * cos + dy * sin - 0.5;
        let sy = cy - dx * sin + dy * cos - 0.5;
        sample_bilinear(img, sx, sy)
    })
}

fn sample_bilinear(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (width - 1) as f32 || y > (height - 1) as f32 {
        return Rgb([255, 255, 255]);
    }
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0).0;
    let p10 = img.get_pixel(x1, y0).0;
    let p01 = img.get_pixel(x0, y1).0;
    let p11 = img.get_pixel(x1, y1).0;

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = clamp_u8(top * (1.0 - fy) + bottom * fy);
    }
    Rgb(out)
}

/// Nudge roughly 0.1% of pixels (at least 10) by up to 3 per channel.
fn sprinkle_noise(img: &mut RgbImage, rng: &mut StdRng) {
    let (width, height) = img.dimensions();
    let total = width as u64 * height as u64;
    let count = (total / 1000).max(10);
    for _ in 0..count {
        let x = rng.random_range(0..width);
        let y = rng.random_range(0..height);
        let pixel = img.get_pixel_mut(x, y);
        for c in 0..3 {
            let delta: i16 = rng.random_range(-3..=3);
            pixel.0[c] = (pixel.0[c] as i16 + delta).clamp(0, 255) as u8;
        }
    }
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn write_test_image(path: &Path, width: u32, height: u32) {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x * 255 / width.max(1)) as u8,
                (y * 255 / height.max(1)) as u8,
                ((x + y) % 256) as u8,
            ])
        });
        img.save(path).unwrap();
    }

    #[test]
    fn output_differs_but_keeps_dimensions() {
        let td = tempdir().unwrap();
        let input = td.path().join("in.jpg");
        let output = td.path().join("in_unique.jpg");
        write_test_image(&input, 160, 120);

        let mut rng = StdRng::seed_from_u64(7);
        let got = make_unique(&mut rng, &input, &output).unwrap();
        assert_eq!(got, output);

        let before = fs::read(&input).unwrap();
        let after = fs::read(&output).unwrap();
        assert_ne!(before, after);

        let reopened = ImageReader::open(&output).unwrap().decode().unwrap();
        assert_eq!(reopened.width(), 160);
        assert_eq!(reopened.height(), 120);
    }

    #[test]
    fn same_seed_reproduces_identical_output() {
        let td = tempdir().unwrap();
        let input = td.path().join("in.jpg");
        write_test_image(&input, 160, 120);

        let out_a = td.path().join("a.jpg");
        let out_b = td.path().join("b.jpg");
        let mut rng = StdRng::seed_from_u64(99);
        make_unique(&mut rng, &input, &out_a).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        make_unique(&mut rng, &input, &out_b).unwrap();

        assert_eq!(fs::read(&out_a).unwrap(), fs::read(&out_b).unwrap());
    }

    #[test]
    fn small_images_skip_crop_but_still_perturb() {
        let td = tempdir().unwrap();
        let input = td.path().join("small.jpg");
        let output = td.path().join("small_unique.jpg");
        write_test_image(&input, 50, 50);

        let mut rng = StdRng::seed_from_u64(3);
        make_unique(&mut rng, &input, &output).unwrap();

        let reopened = ImageReader::open(&output).unwrap().decode().unwrap();
        assert_eq!((reopened.width(), reopened.height()), (50, 50));
        assert_ne!(fs::read(&input).unwrap(), fs::read(&output).unwrap());
    }

    #[test]
    fn decodes_by_content_not_extension() {
        let td = tempdir().unwrap();
        let input = td.path().join("mislabeled.jpg");
        let output = td.path().join("mislabeled_unique.jpg");
        let img = RgbImage::from_fn(160, 120, |x, y| Rgb([x as u8, y as u8, 0]));
        img.save_with_format(&input, image::ImageFormat::Png).unwrap();

        let mut rng = StdRng::seed_from_u64(21);
        make_unique(&mut rng, &input, &output).unwrap();

        let reopened = ImageReader::open(&output).unwrap().decode().unwrap();
        assert_eq!((reopened.width(), reopened.height()), (160, 120));
    }

    #[test]
    fn missing_input_is_reported() {
        let td = tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let err = make_unique(
            &mut rng,
            &td.path().join("absent.jpg"),
            &td.path().join("out.jpg"),
        )
        .unwrap_err();
        assert!(matches!(err, PerturbError::NotFound(_)));
    }

    #[test]
    fn crop_ranges_stay_within_bounds() {
        let mut rng = StdRng::seed_from_u64(123);
        for _ in 0..50 {
            let plan = Plan::draw(&mut rng, 640, 480);
            let crop = plan.crop.unwrap();
            assert!(crop.iter().all(|&px| (1..=5).contains(&px)));
            assert!((82..=92).contains(&plan.quality));
            assert!((0.95..=1.05).contains(&plan.brightness));
            assert!((0.97..=1.03).contains(&plan.saturation));
        }
        let plan = Plan::draw(&mut rng, 100, 300);
        assert!(plan.crop.is_none());
    }
}
