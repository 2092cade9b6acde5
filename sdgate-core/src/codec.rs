//! Conversions between wire encodings and the uniform [`RawImage`] buffer.
//!
//! Inputs arrive either as base64 data URIs or as filesystem paths and are
//! always normalized to 3-channel interleaved RGB. Outputs leave as PNG or
//! JPEG bytes.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};

use crate::engine::{CannyThresholds, Engine};
use crate::error::{DecodeError, EncodeError};

/// Every decode path produces RGB.
pub const RGB_CHANNELS: u8 = 3;

/// Edge-detection settings applied to control images.
pub const CANNY_PREPROCESS: CannyThresholds = CannyThresholds {
    high: 0.08,
    low: 0.08,
    weak: 0.8,
    strong: 1.0,
    inverse: false,
};

// Payloads are cut at the first `=` before decoding, so padding never reaches the engine.
const DATA_URI_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::RequireNone)
        .with_decode_allow_trailing_bits(true),
);

/// A decoded, interleaved pixel buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Vec<u8>,
}

impl fmt::Debug for RawImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl RawImage {
    pub fn rgb(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels: RGB_CHANNELS,
            data,
        }
    }

    pub fn from_dynamic(image: DynamicImage) -> Self {
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        Self::rgb(width, height, rgb.into_raw())
    }

    /// Number of bytes the buffer must hold for its dimensions.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }

    /// True when the buffer is non-empty and matches its dimensions.
    pub fn is_well_formed(&self) -> bool {
        !self.data.is_empty() && self.data.len() == self.expected_len()
    }

    pub fn into_rgb_image(self) -> Result<RgbImage, EncodeError> {
        if self.channels != RGB_CHANNELS {
            return Err(EncodeError::UnsupportedChannels(self.channels));
        }
        let (width, height, channels, len) =
            (self.width, self.height, self.channels, self.data.len());
        RgbImage::from_raw(width, height, self.data).ok_or(EncodeError::BufferMismatch {
            width,
            height,
            channels,
            len,
        })
    }
}

/// Where an input image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    DataUri(String),
    File(PathBuf),
}

impl ImageSource {
    /// Decodes the image. File sources are read relative to `root`, and
    /// refused when the server has no input directory.
    pub fn decode(&self, root: Option<&Path>) -> Result<RawImage, DecodeError> {
        match (self, root) {
            (ImageSource::DataUri(uri), _) => decode_data_uri(uri),
            (ImageSource::File(path), Some(root)) => decode_file(&root.join(path)),
            (ImageSource::File(path), None) => Err(DecodeError::UnsupportedImageContent(format!(
                "{}: image paths are disabled, no input directory is configured",
                path.display()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    #[default]
    #[serde(rename = "png")]
    Png,
    #[serde(rename = "jpeg", alias = "jpg")]
    Jpeg,
}

serde_plain::derive_fromstr_from_deserialize!(OutputFormat);
serde_plain::derive_display_from_serialize!(OutputFormat);

impl OutputFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }
}

/// Decodes a `data:<meta>,<base64>` string into RGB.
pub fn decode_data_uri(uri: &str) -> Result<RawImage, DecodeError> {
    let (_, payload) = uri
        .split_once(',')
        .ok_or_else(|| DecodeError::MalformedEncoding("data URI has no `,` separator".into()))?;
    let payload = payload.split('=').next().unwrap_or_default();
    let bytes = DATA_URI_BASE64
        .decode(payload)
        .map_err(|e| DecodeError::MalformedEncoding(e.to_string()))?;
    decode_bytes(&bytes)
}

pub fn decode_file(path: &Path) -> Result<RawImage, DecodeError> {
    let image = image::open(path).map_err(|e| {
        DecodeError::UnsupportedImageContent(format!("{}: {e}", path.display()))
    })?;
    Ok(RawImage::from_dynamic(image))
}

fn decode_bytes(bytes: &[u8]) -> Result<RawImage, DecodeError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| DecodeError::UnsupportedImageContent(e.to_string()))?;
    Ok(RawImage::from_dynamic(image))
}

/// Maps a `[0, 1]` quality onto the JPEG encoder's scale.
pub fn jpeg_quality(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

/// Serializes an image; the buffer is consumed.
pub fn encode(image: RawImage, format: OutputFormat, quality: f32) -> Result<Vec<u8>, EncodeError> {
    let image = DynamicImage::ImageRgb8(image.into_rgb_image()?);
    let mut bytes = Vec::new();
    match format {
        OutputFormat::Png => image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?,
        OutputFormat::Jpeg => image.write_with_encoder(JpegEncoder::new_with_quality(
            &mut bytes,
            jpeg_quality(quality),
        ))?,
    }
    Ok(bytes)
}

/// Replaces the image's pixels with the engine's edge map.
pub fn apply_canny_preprocess(
    engine: &mut dyn Engine,
    mut image: RawImage,
) -> anyhow::Result<RawImage> {
    engine.canny(&mut image, CANNY_PREPROCESS)?;
    Ok(image)
}
