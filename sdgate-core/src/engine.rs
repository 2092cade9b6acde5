//! The contract every inference backend fulfils.
//!
//! Engines are not re-entrant; every method takes `&mut self` and callers go
//! through [`EngineGate`](crate::EngineGate) to reach one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::RawImage;
use crate::device_map::DeviceMap;
use crate::loader_factory::SdVersion;

pub type GenerationResult = RawImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleMethod {
    #[default]
    #[serde(rename = "euler_a")]
    EulerA,
    #[serde(rename = "euler")]
    Euler,
    #[serde(rename = "heun")]
    Heun,
    #[serde(rename = "dpm2")]
    Dpm2,
    #[serde(rename = "dpm++2s_a")]
    DpmPP2SA,
    #[serde(rename = "dpm++2m")]
    DpmPP2M,
    #[serde(rename = "dpm++2mv2")]
    DpmPP2Mv2,
    #[serde(rename = "lcm")]
    Lcm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Schedule {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "discrete")]
    Discrete,
    #[serde(rename = "karras")]
    Karras,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RngType {
    #[default]
    #[serde(rename = "std_default")]
    StdDefault,
    #[serde(rename = "cuda")]
    Cuda,
}

/// Target tensor type for model conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightType {
    #[serde(rename = "f32")]
    F32,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "q4_0")]
    Q4_0,
    #[serde(rename = "q4_1")]
    Q4_1,
    #[serde(rename = "q5_0")]
    Q5_0,
    #[serde(rename = "q5_1")]
    Q5_1,
    #[serde(rename = "q8_0")]
    Q8_0,
}

serde_plain::derive_fromstr_from_deserialize!(SampleMethod);
serde_plain::derive_display_from_serialize!(SampleMethod);
serde_plain::derive_fromstr_from_deserialize!(Schedule);
serde_plain::derive_display_from_serialize!(Schedule);
serde_plain::derive_fromstr_from_deserialize!(RngType);
serde_plain::derive_display_from_serialize!(RngType);
serde_plain::derive_fromstr_from_deserialize!(WeightType);
serde_plain::derive_display_from_serialize!(WeightType);

impl WeightType {
    pub fn is_quantized(self) -> bool {
        !matches!(self, WeightType::F32 | WeightType::F16)
    }
}

/// Everything needed to construct an engine.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Local weights directory/file or a Hugging Face repo id.
    pub model_path: String,
    pub vae_path: Option<PathBuf>,
    pub taesd_path: Option<PathBuf>,
    pub control_net_path: Option<PathBuf>,
    pub lora_model_dir: Option<PathBuf>,
    pub embeddings_path: Option<PathBuf>,
    pub stacked_id_embeddings_path: Option<PathBuf>,
    pub sd_version: Option<SdVersion>,
    pub weight_type: Option<WeightType>,
    pub rng_type: RngType,
    pub schedule: Schedule,
    pub vae_tiling: bool,
    pub device_map: DeviceMap,
}

/// Sampling parameters shared by text-to-image and image-to-image.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub clip_skip: i32,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub sample_method: SampleMethod,
    pub sample_steps: u32,
    pub strength: f32,
    pub seed: i64,
    pub batch_count: u32,
    pub style_ratio: f32,
    pub normalize_input: bool,
    pub input_id_images_path: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub width: u32,
    pub height: u32,
    pub min_cfg: f32,
    pub cfg_scale: f32,
    pub sample_method: SampleMethod,
    pub sample_steps: u32,
    pub strength: f32,
    pub seed: i64,
    pub video_frames: u32,
    pub motion_bucket_id: u32,
    pub fps: u32,
    pub augmentation_level: f32,
}

/// A structural conditioning image and how strongly it applies.
#[derive(Debug, Clone, Copy)]
pub struct ControlImage<'a> {
    pub image: &'a RawImage,
    pub strength: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertParams<'a> {
    pub model_path: &'a str,
    pub vae_path: Option<&'a Path>,
    pub output_path: &'a Path,
    pub weight_type: Option<WeightType>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CannyThresholds {
    pub high: f32,
    pub low: f32,
    pub weak: f32,
    pub strong: f32,
    pub inverse: bool,
}

pub trait Engine: Send {
    fn text_to_image(
        &mut self,
        params: &SamplingParams<'_>,
        control: Option<ControlImage<'_>>,
    ) -> anyhow::Result<GenerationResult>;

    fn image_to_image(
        &mut self,
        init: &RawImage,
        params: &SamplingParams<'_>,
    ) -> anyhow::Result<GenerationResult>;

    fn image_to_video(
        &mut self,
        init: &RawImage,
        params: &VideoParams<'_>,
    ) -> anyhow::Result<GenerationResult>;

    fn convert(&mut self, params: &ConvertParams<'_>) -> anyhow::Result<()>;

    /// Rewrites `image` in place with an RGB edge map.
    fn canny(&mut self, image: &mut RawImage, thresholds: CannyThresholds) -> anyhow::Result<()>;
}
