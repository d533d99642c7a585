use crate::api::PlateRead;
use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use jpeg_encoder::{ColorType, Encoder};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info, warn};
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

const PLATE_BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const PLATE_TEXT_COLOR: Rgb<u8> = Rgb([36, 255, 12]);
const FPS_TEXT_COLOR: Rgb<u8> = Rgb([100, 255, 0]);
const PLATE_TEXT_SIZE: f32 = 22.0;
const FPS_TEXT_SIZE: f32 = 26.0;

const SYSTEM_FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Packed RGB8 image.
#[derive(Clone, Default, PartialEq)]
pub struct Image {
    pub name: Option<String>,
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn from_rgb(width: usize, height: usize, pixels: Vec<u8>) -> anyhow::Result<Self> {
        if pixels.len() != width * height * 3 {
            bail!(
                "Pixel buffer of {} bytes does not match {}x{} RGB",
                pixels.len(),
                width,
                height
            );
        }
        Ok(Self {
            name: None,
            width,
            height,
            pixels,
        })
    }

    pub fn resize(&mut self, size: usize) {
        self.pixels.resize(size, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn to_rgb_image(&self) -> anyhow::Result<RgbImage> {
        ImageBuffer::from_vec(self.width as u32, self.height as u32, self.pixels.clone())
            .ok_or_else(|| anyhow!("Failed to create image buffer"))
    }

    pub fn from_rgb_image(name: Option<String>, image: RgbImage) -> Self {
        Self {
            name,
            width: image.width() as usize,
            height: image.height() as usize,
            pixels: image.into_raw(),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}, Resolution: {}x{}",
            self.name, self.width, self.height
        )
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({self})")
    }
}

pub fn is_jpeg_data(data: &[u8]) -> bool {
    data.len() > 3 && data[0] == 0xFF && data[1] == 0xD8 && data[2] == 0xFF
}

/// Decodes JPEG with zune-jpeg and everything else through the `image` crate.
pub fn decode_image(name: Option<String>, data: Bytes, image: &mut Image) -> anyhow::Result<()> {
    if data.is_empty() {
        bail!("Image data is empty");
    }
    if is_jpeg_data(&data) {
        return decode_jpeg(name, data, image);
    }
    let decoded = image::load_from_memory(&data)?.to_rgb8();
    *image = Image::from_rgb_image(name, decoded);
    Ok(())
}

pub fn decode_jpeg(name: Option<String>, jpeg: Bytes, image: &mut Image) -> anyhow::Result<()> {
    let options = DecoderOptions::default()
        .set_strict_mode(false)
        .jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(jpeg.as_ref(), options);
    // Headers first, they carry the output buffer size
    decoder.decode_headers()?;
    let output_buffer_size = decoder
        .output_buffer_size()
        .ok_or_else(|| anyhow!("Failed to get decoder output buffer size"))?;
    image.resize(output_buffer_size);
    decoder.decode_into(&mut image.pixels)?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| anyhow!("Failed to get image dimensions"))?;
    image.width = width;
    image.height = height;
    image.name = name;
    Ok(())
}

pub fn encode_jpeg(image: &Image, quality: u8) -> anyhow::Result<Bytes> {
    if image.is_empty() {
        bail!("Cannot encode an empty image");
    }
    let (Ok(width), Ok(height)) = (u16::try_from(image.width), u16::try_from(image.height)) else {
        bail!(
            "Cannot encode a {}x{} image as JPEG, sides are limited to {}",
            image.width,
            image.height,
            u16::MAX
        );
    };
    let encode_image_start_time = Instant::now();
    let mut buffer = Vec::with_capacity(image.pixels.len() / 8);
    let encoder = Encoder::new(&mut buffer, quality);
    encoder.encode(&image.pixels, width, height, ColorType::Rgb)?;
    debug!(encode_image_time = ?encode_image_start_time.elapsed(), "Encode image time");
    Ok(Bytes::from(buffer))
}

/// Copies the `[x, y, w, h]` region, clamped to the image bounds.
pub fn crop(image: &Image, x: i32, y: i32, w: i32, h: i32) -> anyhow::Result<Image> {
    let x0 = x.clamp(0, image.width as i32) as usize;
    let y0 = y.clamp(0, image.height as i32) as usize;
    let x1 = (x.saturating_add(w)).clamp(0, image.width as i32) as usize;
    let y1 = (y.saturating_add(h)).clamp(0, image.height as i32) as usize;
    if x1 <= x0 || y1 <= y0 {
        bail!("Crop region [{x}, {y}, {w}, {h}] is outside the image");
    }

    let crop_width = x1 - x0;
    let mut pixels = Vec::with_capacity(crop_width * (y1 - y0) * 3);
    for row in y0..y1 {
        let start = (row * image.width + x0) * 3;
        pixels.extend_from_slice(&image.pixels[start..start + crop_width * 3]);
    }
    Ok(Image {
        name: image.name.clone(),
        width: crop_width,
        height: y1 - y0,
        pixels,
    })
}

pub fn is_jpeg(image_name: &str) -> bool {
    image_name.to_lowercase().ends_with(".jpg") || image_name.to_lowercase().ends_with(".jpeg")
}

pub fn create_random_jpeg_name() -> String {
    format!("image_{}.jpg", uuid::Uuid::new_v4())
}

/// `car.jpg` becomes `car_lpr.jpg`, directories are stripped.
pub fn create_annotated_image_name(image_name: &str) -> anyhow::Result<String> {
    let file_name = Path::new(image_name)
        .file_name()
        .ok_or_else(|| anyhow!("Failed to strip path from image name"))?
        .to_str()
        .ok_or_else(|| anyhow!("Failed to convert image name to string"))?;

    let stem = match file_name.rfind('.') {
        Some(pos) if pos > 0 => &file_name[..pos],
        _ => file_name,
    };
    Ok(format!("{stem}_lpr.jpg"))
}

pub fn save_annotated_jpeg(
    image: &Image,
    plates: &[PlateRead],
    overlay: &Overlay,
    save_image_path: &Path,
) -> anyhow::Result<PathBuf> {
    let image_name = image
        .name
        .clone()
        .unwrap_or_else(create_random_jpeg_name);
    let jpeg_file = save_image_path.join(create_annotated_image_name(&image_name)?);
    let annotated = overlay.annotate(image, plates, None)?;
    std::fs::write(&jpeg_file, encode_jpeg(&annotated, 95)?)?;
    info!(?jpeg_file, "Image saved");
    Ok(jpeg_file)
}

/// Draws plate boxes, plate strings and an optional FPS legend.
pub struct Overlay {
    font: Option<FontArc>,
}

impl Overlay {
    pub fn without_text() -> Self {
        Self { font: None }
    }

    /// Loads `font_path`, or the first font found in the usual system locations.
    pub fn load(font_path: Option<&Path>) -> Self {
        let candidates: Vec<PathBuf> = match font_path {
            Some(path) => vec![path.to_path_buf()],
            None => SYSTEM_FONT_PATHS.iter().map(PathBuf::from).collect(),
        };

        for candidate in candidates {
            let Ok(bytes) = std::fs::read(&candidate) else {
                continue;
            };
            match FontArc::try_from_vec(bytes) {
                Ok(font) => {
                    info!(font = %candidate.display(), "Loaded overlay font");
                    return Self { font: Some(font) };
                }
                Err(e) => warn!(font = %candidate.display(), "Invalid font file: {}", e),
            }
        }

        warn!("No overlay font found, annotations will show boxes only");
        Self::without_text()
    }

    pub fn has_text(&self) -> bool {
        self.font.is_some()
    }

    pub fn annotate(
        &self,
        image: &Image,
        plates: &[PlateRead],
        fps: Option<f32>,
    ) -> anyhow::Result<Image> {
        let mut canvas = image.to_rgb_image()?;

        for plate in plates {
            let [x, y, w, h] = plate.bbox;
            if w > 0 && h > 0 {
                draw_hollow_rect_mut(
                    &mut canvas,
                    Rect::at(x, y).of_size(w as u32, h as u32),
                    PLATE_BOX_COLOR,
                );
                // Second pass makes the outline 2px wide
                if w > 2 && h > 2 {
                    draw_hollow_rect_mut(
                        &mut canvas,
                        Rect::at(x + 1, y + 1).of_size(w as u32 - 2, h as u32 - 2),
                        PLATE_BOX_COLOR,
                    );
                }
            }
            if let Some(font) = self.font.as_ref() {
                let text_y = (y - 10 - PLATE_TEXT_SIZE as i32).max(0);
                draw_text_mut(
                    &mut canvas,
                    PLATE_TEXT_COLOR,
                    x,
                    text_y,
                    PxScale::from(PLATE_TEXT_SIZE),
                    font,
                    &plate.license_plate,
                );
            }
        }

        if let (Some(fps), Some(font)) = (fps, self.font.as_ref()) {
            draw_text_mut(
                &mut canvas,
                FPS_TEXT_COLOR,
                10,
                10,
                PxScale::from(FPS_TEXT_SIZE),
                font,
                &format!("FPS: {}", fps as i32),
            );
        }

        Ok(Image::from_rgb_image(image.name.clone(), canvas))
    }
}

pub struct Resizer {
    resizer: fast_image_resize::Resizer,
    target_width: usize,
    target_height: usize,
}

impl Default for Resizer {
    fn default() -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
            target_width: 640,
            target_height: 640,
        }
    }
}

impl Resizer {
    pub fn new(target_width: usize, target_height: usize) -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
            target_width,
            target_height,
        }
    }

    pub fn target_size(&self) -> (usize, usize) {
        (self.target_width, self.target_height)
    }

    pub fn resize_image(
        &mut self,
        original_image: &Image,
        resized_image: &mut Image,
    ) -> anyhow::Result<()> {
        debug!(
            "Resizing image from {}x{} to {}x{}",
            original_image.width, original_image.height, self.target_width, self.target_height
        );
        let src_image = fast_image_resize::images::ImageRef::new(
            original_image.width as u32,
            original_image.height as u32,
            &original_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        resized_image.height = self.target_height;
        resized_image.width = self.target_width;
        resized_image.resize(self.target_width * self.target_height * 3);

        let mut dst_image = fast_image_resize::images::Image::from_slice_u8(
            resized_image.width as u32,
            resized_image.height as u32,
            &mut resized_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        self.resizer.resize(&src_image, &mut dst_image, None)?;

        Ok(())
    }
}
