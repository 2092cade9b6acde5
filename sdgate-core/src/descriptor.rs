//! Turns a JSON request body into a validated, fully-defaulted [`JobDescriptor`].
//!
//! Optional fields carrying the wrong JSON type are treated as absent and
//! fall back to their defaults. Required fields (`mode`, `prompt` for the
//! generation modes, an input image for image-conditioned modes, the target
//! path for conversion) must be present and well-typed. Unknown keys are
//! ignored.
//!
//! Paths named in a request are relative to a directory the server was
//! launched with, so they may not be absolute or climb out with `..`.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::{ImageSource, OutputFormat};
use crate::engine::{SampleMethod, SamplingParams, VideoParams};
use crate::error::ValidationError;

pub const DEFAULT_SIZE: u32 = 512;
pub const DEFAULT_SAMPLE_STEPS: u32 = 20;
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.0;
pub const DEFAULT_MIN_GUIDANCE_SCALE: f32 = 1.0;
pub const DEFAULT_STRENGTH: f32 = 0.75;
pub const DEFAULT_CONTROL_STRENGTH: f32 = 0.9;
pub const DEFAULT_STYLE_RATIO: f32 = 20.0;
pub const DEFAULT_OUTPUT_QUALITY: f32 = 0.9;
pub const DEFAULT_VIDEO_FRAMES: u32 = 6;
pub const DEFAULT_FPS: u32 = 6;
pub const DEFAULT_MOTION_BUCKET_ID: u32 = 127;

pub const MAX_SIZE: u32 = 2048;
pub const MAX_SAMPLE_STEPS: u32 = 150;
pub const MAX_BATCH_COUNT: u32 = 8;
pub const MAX_VIDEO_FRAMES: u32 = 64;
pub const MAX_FPS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "txt2img")]
    TextToImage,
    #[serde(rename = "img2img")]
    ImageToImage,
    #[serde(rename = "img2vid")]
    ImageToVideo,
    #[serde(rename = "convert")]
    ConvertModel,
}

serde_plain::derive_fromstr_from_deserialize!(Mode);
serde_plain::derive_display_from_serialize!(Mode);

impl Mode {
    /// Modes that run the diffusion pipeline and therefore need a prompt.
    pub fn generates(self) -> bool {
        !matches!(self, Mode::ConvertModel)
    }

    pub fn needs_input_image(self) -> bool {
        matches!(self, Mode::ImageToImage | Mode::ImageToVideo)
    }
}

/// Server-wide values the request body may override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobDefaults {
    pub sample_method: SampleMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub mode: Mode,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub sample_steps: u32,
    pub guidance_scale: f32,
    pub min_guidance_scale: f32,
    /// Negative means the engine picks.
    pub seed: i64,
    pub batch_count: u32,
    pub strength: f32,
    pub control_strength: f32,
    pub style_ratio: f32,
    /// Zero or negative means unspecified.
    pub clip_skip: i32,
    pub normalize_input: bool,
    pub canny_preprocess: bool,
    pub sample_method: SampleMethod,
    pub output_format: OutputFormat,
    pub output_quality: f32,
    pub input_image: Option<ImageSource>,
    pub control_image: Option<ImageSource>,
    pub input_id_images_path: Option<PathBuf>,
    pub video_frames: u32,
    pub fps: u32,
    pub motion_bucket_id: u32,
    pub augmentation_level: f32,
    pub output_path: Option<PathBuf>,
}

impl JobDescriptor {
    pub fn sampling(&self) -> SamplingParams<'_> {
        SamplingParams {
            prompt: &self.prompt,
            negative_prompt: &self.negative_prompt,
            clip_skip: self.clip_skip,
            cfg_scale: self.guidance_scale,
            width: self.width,
            height: self.height,
            sample_method: self.sample_method,
            sample_steps: self.sample_steps,
            strength: self.strength,
            seed: self.seed,
            batch_count: self.batch_count,
            style_ratio: self.style_ratio,
            normalize_input: self.normalize_input,
            input_id_images_path: self.input_id_images_path.as_deref(),
        }
    }

    pub fn video(&self) -> VideoParams<'_> {
        VideoParams {
            prompt: &self.prompt,
            negative_prompt: &self.negative_prompt,
            width: self.width,
            height: self.height,
            min_cfg: self.min_guidance_scale,
            cfg_scale: self.guidance_scale,
            sample_method: self.sample_method,
            sample_steps: self.sample_steps,
            strength: self.strength,
            seed: self.seed,
            video_frames: self.video_frames,
            motion_bucket_id: self.motion_bucket_id,
            fps: self.fps,
            augmentation_level: self.augmentation_level,
        }
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }
}

/// Parses and validates a request body.
pub fn build(body: &[u8], defaults: &JobDefaults) -> Result<JobDescriptor, ValidationError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ValidationError::MalformedJson(
            "request body must be a JSON object".into(),
        ));
    };
    let fields = Fields(&map);

    let mode = match fields.string(&["mode"]) {
        Some(token) => token
            .parse::<Mode>()
            .map_err(|_| ValidationError::InvalidEnumValue {
                field: "mode",
                value: token.to_owned(),
            })?,
        None => return Err(ValidationError::MissingRequiredField("mode")),
    };

    let prompt = fields.non_empty(&["prompt"]);
    if mode.generates() && prompt.is_none() {
        return Err(ValidationError::MissingRequiredField("prompt"));
    }

    let input_image = fields.image_source("input_image", "input_image_path")?;
    if mode.needs_input_image() && input_image.is_none() {
        return Err(ValidationError::MissingRequiredField("input_image"));
    }

    let output_path = fields.relative_path("output_path")?;
    if mode == Mode::ConvertModel && output_path.is_none() {
        return Err(ValidationError::MissingRequiredField("output_path"));
    }

    let output_format = match fields.string(&["output_format"]) {
        Some(token) => token
            .parse::<OutputFormat>()
            .map_err(|_| ValidationError::InvalidFieldValue {
                field: "output_format",
                reason: format!("`{token}` is not one of png, jpg, jpeg"),
            })?,
        None => OutputFormat::default(),
    };

    let sample_method = match fields.string(&["sample_method"]) {
        Some(token) => token
            .parse::<SampleMethod>()
            .map_err(|_| ValidationError::InvalidFieldValue {
                field: "sample_method",
                reason: format!("unknown sampler `{token}`"),
            })?,
        None => defaults.sample_method,
    };

    Ok(JobDescriptor {
        mode,
        prompt: prompt.unwrap_or_default().to_owned(),
        negative_prompt: fields.string(&["negative_prompt"]).unwrap_or_default().to_owned(),
        width: fields.bounded(&["width"], MAX_SIZE)?.unwrap_or(DEFAULT_SIZE),
        height: fields.bounded(&["height"], MAX_SIZE)?.unwrap_or(DEFAULT_SIZE),
        sample_steps: fields
            .bounded(&["num_inference_steps", "sample_steps"], MAX_SAMPLE_STEPS)?
            .unwrap_or(DEFAULT_SAMPLE_STEPS),
        guidance_scale: fields
            .number(&["guidance_scale", "cfg_scale"])
            .unwrap_or(DEFAULT_GUIDANCE_SCALE),
        min_guidance_scale: fields.number(&["min_cfg"]).unwrap_or(DEFAULT_MIN_GUIDANCE_SCALE),
        seed: fields.integer(&["seed"]).unwrap_or(-1),
        batch_count: fields.bounded(&["batch_count"], MAX_BATCH_COUNT)?.unwrap_or(1),
        strength: fields.unit(&["strength"])?.unwrap_or(DEFAULT_STRENGTH),
        control_strength: fields
            .number(&["control_strength"])
            .unwrap_or(DEFAULT_CONTROL_STRENGTH),
        style_ratio: fields.number(&["style_ratio"]).unwrap_or(DEFAULT_STYLE_RATIO),
        clip_skip: fields
            .integer(&["clip_skip"])
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(-1),
        normalize_input: fields.flag(&["normalize_input"]).unwrap_or(false),
        canny_preprocess: fields.flag(&["canny_preprocess"]).unwrap_or(false),
        sample_method,
        output_format,
        output_quality: fields.unit(&["output_quality"])?.unwrap_or(DEFAULT_OUTPUT_QUALITY),
        input_image,
        control_image: fields.image_source("control_image", "control_image_path")?,
        input_id_images_path: fields.relative_path("input_id_images_path")?,
        video_frames: fields
            .bounded(&["video_frames"], MAX_VIDEO_FRAMES)?
            .unwrap_or(DEFAULT_VIDEO_FRAMES),
        fps: fields.bounded(&["fps"], MAX_FPS)?.unwrap_or(DEFAULT_FPS),
        motion_bucket_id: fields
            .non_negative(&["motion_bucket_id"])?
            .unwrap_or(DEFAULT_MOTION_BUCKET_ID),
        augmentation_level: fields.number(&["augmentation_level"]).unwrap_or(0.0),
        output_path,
    })
}

/// Typed, lenient lookups over the request object. Each lookup takes the
/// accepted keys in priority order.
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    fn find<T>(
        &self,
        keys: &[&'static str],
        pick: impl Fn(&'a Value) -> Option<T>,
    ) -> Option<(&'static str, T)> {
        keys.iter()
            .find_map(|key| self.0.get(*key).and_then(&pick).map(|v| (*key, v)))
    }

    fn string(&self, keys: &[&'static str]) -> Option<&'a str> {
        self.find(keys, Value::as_str).map(|(_, v)| v)
    }

    fn non_empty(&self, keys: &[&'static str]) -> Option<&'a str> {
        self.string(keys).filter(|s| !s.is_empty())
    }

    fn number(&self, keys: &[&'static str]) -> Option<f32> {
        self.find(keys, Value::as_f64).map(|(_, v)| v as f32)
    }

    fn integer(&self, keys: &[&'static str]) -> Option<i64> {
        self.find(keys, Value::as_i64).map(|(_, v)| v)
    }

    fn flag(&self, keys: &[&'static str]) -> Option<bool> {
        self.find(keys, Value::as_bool).map(|(_, v)| v)
    }

    /// A count in `1..=max`.
    fn bounded(&self, keys: &[&'static str], max: u32) -> Result<Option<u32>, ValidationError> {
        match self.find(keys, Value::as_i64) {
            Some((field, v)) if v <= 0 => Err(invalid(field, format!("{v} must be positive"))),
            Some((field, v)) if v > i64::from(max) => {
                Err(invalid(field, format!("{v} exceeds the limit of {max}")))
            }
            Some((_, v)) => Ok(Some(v as u32)),
            None => Ok(None),
        }
    }

    fn non_negative(&self, keys: &[&'static str]) -> Result<Option<u32>, ValidationError> {
        match self.find(keys, Value::as_i64) {
            Some((field, v)) => u32::try_from(v)
                .map(Some)
                .map_err(|_| invalid(field, format!("{v} is out of range"))),
            None => Ok(None),
        }
    }

    /// A number that must lie in `[0, 1]`.
    fn unit(&self, keys: &[&'static str]) -> Result<Option<f32>, ValidationError> {
        match self.find(keys, Value::as_f64) {
            Some((field, v)) if !(0.0..=1.0).contains(&v) => {
                Err(invalid(field, format!("{v} is outside [0, 1]")))
            }
            Some((_, v)) => Ok(Some(v as f32)),
            None => Ok(None),
        }
    }

    /// A path that stays inside whatever directory it is later joined onto.
    fn relative_path(&self, key: &'static str) -> Result<Option<PathBuf>, ValidationError> {
        let Some(raw) = self.non_empty(&[key]) else {
            return Ok(None);
        };
        let path = PathBuf::from(raw);
        let contained = path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained || path.file_name().is_none() {
            return Err(invalid(
                key,
                format!("`{raw}` must be a relative path without `..`"),
            ));
        }
        Ok(Some(path))
    }

    /// An inline data URI wins over a path.
    fn image_source(
        &self,
        inline: &'static str,
        path: &'static str,
    ) -> Result<Option<ImageSource>, ValidationError> {
        if let Some(uri) = self.non_empty(&[inline]) {
            return Ok(Some(ImageSource::DataUri(uri.to_owned())));
        }
        Ok(self.relative_path(path)?.map(ImageSource::File))
    }
}

fn invalid(field: &'static str, reason: String) -> ValidationError {
    ValidationError::InvalidFieldValue { field, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> Result<JobDescriptor, ValidationError> {
        build(body.to_string().as_bytes(), &JobDefaults::default())
    }

    #[test]
    fn txt2img_scenario_fills_defaults() {
        let job = parse(json!({"mode": "txt2img", "prompt": "a cat", "width": 256, "height": 256}))
            .unwrap();
        assert_eq!(job.mode, Mode::TextToImage);
        assert_eq!((job.width, job.height), (256, 256));
        assert_eq!(job.sample_steps, 20);
        assert_eq!(job.guidance_scale, 7.0);
        assert_eq!(job.batch_count, 1);
        assert_eq!(job.output_format, OutputFormat::Png);
        assert_eq!(job.seed, -1);
        assert_eq!(job.clip_skip, -1);
        assert_eq!(job.sample_method, SampleMethod::EulerA);
        assert!(job.input_image.is_none());
        assert!(job.control_image.is_none());
    }

    #[test]
    fn implicit_defaults_equal_explicit_defaults() {
        let implicit = parse(json!({"mode": "img2vid", "prompt": "p", "input_image": "data:,x"}))
            .unwrap();
        let explicit = parse(json!({
            "mode": "img2vid",
            "prompt": "p",
            "input_image": "data:,x",
            "negative_prompt": "",
            "width": 512,
            "height": 512,
            "num_inference_steps": 20,
            "guidance_scale": 7.0,
            "min_cfg": 1.0,
            "seed": -1,
            "batch_count": 1,
            "strength": 0.75,
            "control_strength": 0.9,
            "style_ratio": 20.0,
            "clip_skip": -1,
            "normalize_input": false,
            "canny_preprocess": false,
            "sample_method": "euler_a",
            "output_format": "png",
            "output_quality": 0.9,
            "video_frames": 6,
            "fps": 6,
            "motion_bucket_id": 127,
            "augmentation_level": 0.0,
        }))
        .unwrap();
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn prompt_is_required_for_generation_modes() {
        for mode in ["txt2img", "img2img", "img2vid"] {
            let err = parse(json!({"mode": mode, "input_image": "data:,x"})).unwrap_err();
            assert_eq!(err, ValidationError::MissingRequiredField("prompt"), "{mode}");

            let err = parse(json!({"mode": mode, "prompt": 42, "input_image": "data:,x"}))
                .unwrap_err();
            assert_eq!(err, ValidationError::MissingRequiredField("prompt"), "{mode}");

            let err = parse(json!({"mode": mode, "prompt": "", "input_image": "data:,x"}))
                .unwrap_err();
            assert_eq!(err, ValidationError::MissingRequiredField("prompt"), "{mode}");
        }
    }

    #[test]
    fn mode_is_required_and_must_be_known() {
        assert_eq!(
            parse(json!({"prompt": "x"})).unwrap_err(),
            ValidationError::MissingRequiredField("mode")
        );
        assert_eq!(
            parse(json!({"mode": 3, "prompt": "x"})).unwrap_err(),
            ValidationError::MissingRequiredField("mode")
        );
        assert_eq!(
            parse(json!({"mode": "upscale", "prompt": "x"})).unwrap_err(),
            ValidationError::InvalidEnumValue {
                field: "mode",
                value: "upscale".into()
            }
        );
    }

    #[test]
    fn image_modes_need_an_input_image() {
        for mode in ["img2img", "img2vid"] {
            let err = parse(json!({"mode": mode, "prompt": "x"})).unwrap_err();
            assert_eq!(err, ValidationError::MissingRequiredField("input_image"));
        }
        let job = parse(json!({"mode": "img2img", "prompt": "x", "input_image_path": "in.png"}))
            .unwrap();
        assert_eq!(job.input_image, Some(ImageSource::File("in.png".into())));
    }

    #[test]
    fn inline_image_wins_over_path() {
        let job = parse(json!({
            "mode": "txt2img",
            "prompt": "x",
            "control_image": "data:image/png;base64,AAAA",
            "control_image_path": "edges.png",
        }))
        .unwrap();
        assert_eq!(
            job.control_image,
            Some(ImageSource::DataUri("data:image/png;base64,AAAA".into()))
        );
    }

    #[test]
    fn convert_needs_a_target_but_no_prompt() {
        assert_eq!(
            parse(json!({"mode": "convert"})).unwrap_err(),
            ValidationError::MissingRequiredField("output_path")
        );
        let job = parse(json!({"mode": "convert", "output_path": "model.gguf"})).unwrap();
        assert_eq!(job.mode, Mode::ConvertModel);
        assert_eq!(job.output_path(), Some(Path::new("model.gguf")));
        assert!(job.prompt.is_empty());
    }

    #[test]
    fn output_format_and_quality_are_checked() {
        assert!(matches!(
            parse(json!({"mode": "txt2img", "prompt": "x", "output_format": "bmp"})),
            Err(ValidationError::InvalidFieldValue { field: "output_format", .. })
        ));
        assert!(matches!(
            parse(json!({"mode": "txt2img", "prompt": "x", "output_quality": 1.5})),
            Err(ValidationError::InvalidFieldValue { field: "output_quality", .. })
        ));
        let job = parse(json!({
            "mode": "txt2img",
            "prompt": "x",
            "output_format": "jpg",
            "output_quality": 0.4,
        }))
        .unwrap();
        assert_eq!(job.output_format, OutputFormat::Jpeg);
        assert_eq!(job.output_quality, 0.4);
    }

    #[test]
    fn mistyped_optional_fields_fall_back_to_defaults() {
        let job = parse(json!({
            "mode": "txt2img",
            "prompt": "x",
            "width": "wide",
            "height": 320.5,
            "guidance_scale": "high",
            "seed": "lucky",
            "canny_preprocess": "yes",
            "output_format": 7,
            "output_quality": "best",
            "control_image": {"path": "x.png"},
        }))
        .unwrap();
        assert_eq!((job.width, job.height), (512, 512));
        assert_eq!(job.guidance_scale, 7.0);
        assert_eq!(job.seed, -1);
        assert!(!job.canny_preprocess);
        assert_eq!(job.output_format, OutputFormat::Png);
        assert_eq!(job.output_quality, 0.9);
        assert!(job.control_image.is_none());
    }

    #[test]
    fn out_of_domain_numbers_are_rejected() {
        for (field, value) in [
            ("width", json!(0)),
            ("height", json!(-8)),
            ("num_inference_steps", json!(0)),
            ("batch_count", json!(-1)),
            ("width", json!(5_000_000_000_i64)),
            ("width", json!(65536)),
            ("height", json!(2056)),
            ("num_inference_steps", json!(151)),
            ("sample_steps", json!(10_000)),
            ("batch_count", json!(9)),
            ("video_frames", json!(65)),
            ("fps", json!(61)),
            ("strength", json!(1.01)),
            ("motion_bucket_id", json!(-3)),
        ] {
            let mut body = json!({"mode": "txt2img", "prompt": "x"});
            body[field] = value;
            assert!(
                matches!(parse(body), Err(ValidationError::InvalidFieldValue { .. })),
                "{field}"
            );
        }
    }

    #[test]
    fn limits_are_inclusive() {
        let job = parse(json!({
            "mode": "txt2img",
            "prompt": "x",
            "width": MAX_SIZE,
            "height": MAX_SIZE,
            "num_inference_steps": MAX_SAMPLE_STEPS,
            "batch_count": MAX_BATCH_COUNT,
        }))
        .unwrap();
        assert_eq!((job.width, job.height), (2048, 2048));
        assert_eq!(job.sample_steps, 150);
        assert_eq!(job.batch_count, 8);
    }

    #[test]
    fn request_paths_must_stay_relative() {
        for (field, path) in [
            ("output_path", "/tmp/victim.toml"),
            ("output_path", "../outside.gguf"),
            ("output_path", "models/../../etc/passwd"),
            ("output_path", "."),
            ("input_image_path", "/etc/hosts"),
            ("control_image_path", "../secret.png"),
            ("input_id_images_path", "/home/user/ids"),
        ] {
            let mut body = json!({"mode": "convert", "output_path": "model.gguf"});
            body[field] = json!(path);
            assert!(
                matches!(
                    parse(body),
                    Err(ValidationError::InvalidFieldValue { field: f, .. }) if f == field
                ),
                "{field}={path}"
            );
        }

        let job = parse(json!({"mode": "convert", "output_path": "./sd15/model-q8.gguf"})).unwrap();
        assert_eq!(job.output_path(), Some(Path::new("./sd15/model-q8.gguf")));
    }

    #[test]
    fn aliases_and_sampler_override() {
        let defaults = JobDefaults {
            sample_method: SampleMethod::Lcm,
        };
        let body = json!({"mode": "txt2img", "prompt": "x", "sample_steps": 8, "cfg_scale": 1.5});
        let job = build(body.to_string().as_bytes(), &defaults).unwrap();
        assert_eq!(job.sample_steps, 8);
        assert_eq!(job.guidance_scale, 1.5);
        assert_eq!(job.sample_method, SampleMethod::Lcm);

        let body = json!({"mode": "txt2img", "prompt": "x", "sample_method": "dpm++2m"});
        let job = build(body.to_string().as_bytes(), &defaults).unwrap();
        assert_eq!(job.sample_method, SampleMethod::DpmPP2M);

        let body = json!({"mode": "txt2img", "prompt": "x", "sample_method": "ddim"});
        assert!(build(body.to_string().as_bytes(), &defaults).is_err());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let job = parse(json!({"mode": "txt2img", "prompt": "x", "upscale_repeats": 3, "foo": null}));
        assert!(job.is_ok());
    }

    #[test]
    fn non_object_bodies_are_malformed() {
        for body in [&b"not json"[..], &b"[1, 2]"[..], &b"\"txt2img\""[..], &b""[..]] {
            assert!(matches!(
                build(body, &JobDefaults::default()),
                Err(ValidationError::MalformedJson(_))
            ));
        }
    }

    #[test]
    fn engine_parameter_views() {
        let job = parse(json!({
            "mode": "img2vid",
            "prompt": "waves",
            "input_image": "data:,x",
            "video_frames": 14,
            "min_cfg": 2.5,
            "input_id_images_path": "ids/",
        }))
        .unwrap();
        let video = job.video();
        assert_eq!(video.prompt, "waves");
        assert_eq!(video.video_frames, 14);
        assert_eq!(video.min_cfg, 2.5);
        assert_eq!(video.motion_bucket_id, 127);
        assert_eq!(job.sampling().input_id_images_path, Some(Path::new("ids/")));
    }
}
