//! Turning character detections into plate strings, and straightening crops
//! before they reach the character model.

use crate::{api::Detection, image::Image};
use image::{GrayImage, Rgb, RgbImage};
use imageproc::{
    edges::canny,
    filter::median_filter,
    geometric_transformations::{Interpolation, rotate_about_center},
    hough::{LineDetectionOptions, PolarLine, detect_lines},
};

/// Plates carry between 7 and 10 characters, anything else is a bad read.
pub const MIN_PLATE_CHARACTERS: usize = 7;
pub const MAX_PLATE_CHARACTERS: usize = 10;
/// Max distance in pixels from the baseline for a one-line plate.
const LINE_TOLERANCE: f32 = 3.0;
const MAX_SKEW_DEGREES: f32 = 30.0;
/// Lines this close to the top edge are ignored when center thresholding.
const CENTER_THRESHOLD_PX: f32 = 7.0;

/// The order deskew settings are tried in, `(change_contrast, center_threshold)`.
pub const DESKEW_VARIANTS: [(bool, bool); 4] =
    [(false, false), (false, true), (true, false), (true, true)];

struct CharacterCenter<'a> {
    x: f32,
    y: f32,
    label: &'a str,
}

/// Assembles a plate string from the character model output.
///
/// Characters whose centers lie on the line through the leftmost and rightmost
/// character form a one-line plate read left to right. Otherwise the plate is
/// treated as two lines split at the mean center height and joined with `-`.
pub fn read_plate(characters: &[Detection]) -> Option<String> {
    if characters.len() < MIN_PLATE_CHARACTERS || characters.len() > MAX_PLATE_CHARACTERS {
        return None;
    }

    let centers: Vec<CharacterCenter> = characters
        .iter()
        .map(|character| {
            let (x, y) = character.center();
            CharacterCenter {
                x,
                y,
                label: character.label.as_str(),
            }
        })
        .collect();

    let mut left = &centers[0];
    let mut right = &centers[0];
    for center in centers.iter() {
        if center.x < left.x {
            left = center;
        }
        if center.x > right.x {
            right = center;
        }
    }

    let two_lines = left.x != right.x
        && centers.iter().any(|center| {
            let slope = (right.y - left.y) / (right.x - left.x);
            let y_on_line = left.y + slope * (center.x - left.x);
            (y_on_line - center.y).abs() > LINE_TOLERANCE
        });

    let sorted_by_x = |mut line: Vec<&CharacterCenter>| -> String {
        line.sort_by(|a, b| a.x.total_cmp(&b.x));
        line.iter().map(|center| center.label).collect()
    };

    if two_lines {
        let y_sum: f32 = centers.iter().map(|center| center.y).sum();
        let y_mean = y_sum as i64 / centers.len() as i64;
        let (bottom, top): (Vec<&CharacterCenter>, Vec<&CharacterCenter>) = centers
            .iter()
            .partition(|center| center.y as i64 > y_mean);
        Some(format!("{}-{}", sorted_by_x(top), sorted_by_x(bottom)))
    } else {
        Some(sorted_by_x(centers.iter().collect()))
    }
}

/// Rotates the crop so its dominant near-horizontal edge becomes level.
pub fn deskew(image: &Image, change_contrast: bool, center_threshold: bool) -> anyhow::Result<Image> {
    let rgb = image.to_rgb_image()?;
    let reference = if change_contrast {
        stretch_contrast(&rgb)
    } else {
        rgb.clone()
    };

    let Some(skew) = estimate_skew_degrees(&reference, center_threshold) else {
        return Ok(image.clone());
    };
    if skew.abs() < f32::EPSILON {
        return Ok(image.clone());
    }

    let rotated = rotate_about_center(
        &rgb,
        -skew.to_radians(),
        Interpolation::Bilinear,
        Rgb([0, 0, 0]),
    );
    Ok(Image::from_rgb_image(image.name.clone(), rotated))
}

/// Skew in degrees of the topmost near-horizontal line, positive when the
/// line descends to the right. `None` when no line is found.
pub fn estimate_skew_degrees(image: &RgbImage, center_threshold: bool) -> Option<f32> {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return None;
    }

    let gray: GrayImage = image::imageops::grayscale(image);
    let gray = median_filter(&gray, 1, 1);
    let edges = canny(&gray, 30.0, 100.0);
    let options = LineDetectionOptions {
        vote_threshold: ((width as f32 / 1.5) as u32).max(1),
        suppression_radius: 8,
    };
    let lines = detect_lines(&edges, options);

    let center_x = width as f32 / 2.0;
    lines
        .iter()
        .filter_map(|line| {
            let skew = line.angle_in_degrees as f32 - 90.0;
            if skew.abs() > MAX_SKEW_DEGREES {
                return None;
            }
            let y = line_y_at(line, center_x)?;
            if center_threshold && y < CENTER_THRESHOLD_PX {
                return None;
            }
            Some((y, skew))
        })
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, skew)| skew)
}

fn line_y_at(line: &PolarLine, x: f32) -> Option<f32> {
    let theta = (line.angle_in_degrees as f32).to_radians();
    let sin = theta.sin();
    if sin.abs() < 1e-3 {
        return None;
    }
    Some((line.r - x * theta.cos()) / sin)
}

/// Linear stretch between the 1st and 99th luminance percentile.
fn stretch_contrast(image: &RgbImage) -> RgbImage {
    let mut histogram = [0usize; 256];
    for pixel in image.pixels() {
        histogram[luminance(pixel) as usize] += 1;
    }
    let total: usize = histogram.iter().sum();
    let percentile = |fraction: f32| -> u8 {
        let target = (total as f32 * fraction) as usize;
        let mut seen = 0;
        for (value, count) in histogram.iter().enumerate() {
            seen += count;
            if seen > target {
                return value as u8;
            }
        }
        255
    };
    let low = percentile(0.01) as f32;
    let high = percentile(0.99) as f32;
    if high <= low {
        return image.clone();
    }

    let mut stretched = image.clone();
    for pixel in stretched.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            let value = (*channel as f32 - low) * 255.0 / (high - low);
            *channel = value.clamp(0.0, 255.0) as u8;
        }
    }
    stretched
}

fn luminance(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) as u8
}
