//! Adaptive re-encoding of uploads so they fit a provider's payload ceiling.
//!
//! The normalizer walks a two-lever ladder: JPEG quality first, then pixel
//! dimensions, for a bounded number of encode attempts. It either returns a
//! buffer inside both budgets or fails with the full ladder attached.

use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader, Rgb, RgbImage};
use pixelrelay_contracts::config::NormalizeConfig;
use pixelrelay_contracts::request::{ImageAsset, NormalizationResult, NORMALIZED_CONTENT_TYPE};

use crate::error::{EncodeAttempt, RelayError};

/// Decode/encode capability the normalizer drives.
///
/// `decode` must return the image with any embedded orientation already
/// applied, so `dimensions` reports the upright size.
pub trait ImageCodec: Send + Sync {
    type Image;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Image, String>;

    fn dimensions(&self, image: &Self::Image) -> (u32, u32);

    /// Encodes `image` scaled to exactly `width`x`height` at `quality` (1-100).
    fn encode(
        &self,
        image: &Self::Image,
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<Vec<u8>, String>;
}

/// `image`-crate codec producing baseline JPEG.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegCodec;

impl ImageCodec for JpegCodec {
    type Image = DynamicImage;

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, String> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|err| err.to_string())?;
        let mut decoder = reader.into_decoder().map_err(|err| err.to_string())?;
        let orientation = decoder
            .orientation()
            .unwrap_or(Orientation::NoTransforms);
        let mut image = DynamicImage::from_decoder(decoder).map_err(|err| err.to_string())?;
        image.apply_orientation(orientation);
        Ok(image)
    }

    fn dimensions(&self, image: &DynamicImage) -> (u32, u32) {
        (image.width(), image.height())
    }

    fn encode(
        &self,
        image: &DynamicImage,
        width: u32,
        height: u32,
        quality: u8,
    ) -> Result<Vec<u8>, String> {
        let rgb = if image.width() == width && image.height() == height {
            flatten_onto_white(image)
        } else {
            flatten_onto_white(&image.resize_exact(width, height, FilterType::Triangle))
        };
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100))
            .encode_image(&rgb)
            .map_err(|err| err.to_string())?;
        Ok(bytes)
    }
}

// JPEG has no alpha channel; transparent pixels are composited over white.
fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

#[derive(Debug, Clone)]
pub struct Normalizer<C = JpegCodec> {
    codec: C,
    config: NormalizeConfig,
}

impl Normalizer<JpegCodec> {
    pub fn new(config: NormalizeConfig) -> Self {
        Self::with_codec(JpegCodec, config)
    }
}

impl<C: ImageCodec> Normalizer<C> {
    pub fn with_codec(codec: C, config: NormalizeConfig) -> Self {
        Self { codec, config }
    }

    pub fn config(&self) -> &NormalizeConfig {
        &self.config
    }

    /// Re-encodes `bytes` to fit the configured byte and dimension budgets.
    ///
    /// `declared_type` is only used for diagnostics; the decoded pixels decide
    /// what the source actually is.
    pub fn normalize(
        &self,
        bytes: &[u8],
        declared_type: &str,
    ) -> Result<NormalizationResult, RelayError> {
        let image = self
            .codec
            .decode(bytes)
            .map_err(|reason| RelayError::UnsupportedImage {
                declared_type: declared_type.to_string(),
                byte_len: bytes.len(),
                reason,
            })?;
        let (original_width, original_height) = self.codec.dimensions(&image);
        if original_width == 0 || original_height == 0 {
            return Err(RelayError::UnsupportedImage {
                declared_type: declared_type.to_string(),
                byte_len: bytes.len(),
                reason: "image has no pixels".to_string(),
            });
        }

        let max_dim = self.config.max_dimension.max(1);
        let floor_width = self.dimension_floor(original_width);
        let floor_height = self.dimension_floor(original_height);
        let (mut width, mut height) = self.target_dimensions(original_width, original_height);
        let mut quality = self.config.initial_quality;
        let mut attempts = Vec::with_capacity(self.config.max_attempts);

        for _ in 0..self.config.max_attempts {
            let encoded = self
                .codec
                .encode(&image, width, height, quality)
                .map_err(|reason| RelayError::Encode {
                    width,
                    height,
                    quality,
                    reason,
                })?;
            attempts.push(EncodeAttempt {
                width,
                height,
                quality,
                bytes: encoded.len(),
            });
            if encoded.len() <= self.config.max_bytes {
                tracing::debug!(
                    original_width,
                    original_height,
                    width,
                    height,
                    quality,
                    bytes = encoded.len(),
                    attempts = attempts.len(),
                    "image normalized"
                );
                let size = encoded.len();
                return Ok(NormalizationResult {
                    bytes: encoded,
                    content_type: NORMALIZED_CONTENT_TYPE.to_string(),
                    size,
                    width,
                    height,
                });
            }

            if quality > self.config.quality_floor {
                quality = quality
                    .saturating_sub(self.config.quality_step.max(1))
                    .max(self.config.quality_floor);
            } else {
                width = shrink(width, self.config.shrink_ratio, floor_width, max_dim);
                height = shrink(height, self.config.shrink_ratio, floor_height, max_dim);
            }
        }

        Err(RelayError::SizeBudgetExceeded {
            original_width,
            original_height,
            max_bytes: self.config.max_bytes,
            attempts,
        })
    }

    /// Uniform downscale to the dimension budget; never upscales and never
    /// goes below `min(original, min_dimension, max_dimension)` on either axis.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let max_dim = self.config.max_dimension.max(1);
        let long_edge = width.max(height);
        let (scaled_width, scaled_height) = if long_edge <= max_dim {
            (width, height)
        } else {
            // floor(original * max_dim / long_edge) in integer space.
            let scale = |side: u32| (u64::from(side) * u64::from(max_dim) / u64::from(long_edge)) as u32;
            (scale(width), scale(height))
        };
        (
            clamp_side(scaled_width, self.dimension_floor(width), max_dim),
            clamp_side(scaled_height, self.dimension_floor(height), max_dim),
        )
    }

    // A floor above the dimension budget would let shrinking grow the image.
    fn dimension_floor(&self, original: u32) -> u32 {
        original
            .min(self.config.min_dimension)
            .min(self.config.max_dimension.max(1))
    }
}

impl<C: ImageCodec + 'static> Normalizer<C> {
    /// Runs [`Normalizer::normalize`] on the blocking pool so codec work does
    /// not stall other tasks on the runtime.
    pub async fn normalize_offloaded(
        self: &Arc<Self>,
        asset: ImageAsset,
    ) -> Result<NormalizationResult, RelayError> {
        let normalizer = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            normalizer.normalize(&asset.bytes, &asset.content_type)
        })
        .await
        .map_err(|err| RelayError::Worker(err.to_string()))?
    }
}

fn shrink(side: u32, ratio: f64, floor: u32, max_dim: u32) -> u32 {
    let shrunk = (f64::from(side) * ratio).floor() as u32;
    clamp_side(shrunk, floor, max_dim)
}

fn clamp_side(side: u32, floor: u32, max_dim: u32) -> u32 {
    side.max(floor).min(max_dim).max(1)
}
