use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::DType;
use hf_hub::api::tokio::Api;
use tracing::{debug, info, warn};

mod canny;
mod convert;
mod pipeline;

use pipeline::{ModelFiles, Pipeline};

use crate::codec::RawImage;
use crate::engine::{
    CannyThresholds, ControlImage, ConvertParams, Engine, EngineOptions, GenerationResult,
    RngType, SamplingParams, Schedule, VideoParams, WeightType,
};
use crate::{resolve_version, select_best_device, Loader, SdVersion};

const UNET_FILE: &str = "unet/diffusion_pytorch_model.safetensors";
const VAE_FILE: &str = "vae/diffusion_pytorch_model.safetensors";
const CLIP_FILE: &str = "text_encoder/model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer/tokenizer.json";

pub struct StableDiffusionEngine {
    /// `None` when the model is a single-file checkpoint, which can only be converted.
    pipeline: Option<Pipeline>,
}

impl StableDiffusionEngine {
    fn pipeline(&mut self) -> Result<&mut Pipeline> {
        self.pipeline
            .as_mut()
            .context("the loaded model is a single-file checkpoint, only conversion is available")
    }
}

impl Engine for StableDiffusionEngine {
    fn text_to_image(
        &mut self,
        params: &SamplingParams<'_>,
        control: Option<ControlImage<'_>>,
    ) -> Result<GenerationResult> {
        if control.is_some() {
            bail!("control-net conditioning is not supported by this backend");
        }
        check_single_image(params)?;
        self.pipeline()?.generate(params, None)
    }

    fn image_to_image(&mut self, init: &RawImage, params: &SamplingParams<'_>) -> Result<GenerationResult> {
        check_single_image(params)?;
        self.pipeline()?.generate(params, Some(init))
    }

    fn image_to_video(&mut self, _init: &RawImage, _params: &VideoParams<'_>) -> Result<GenerationResult> {
        bail!("image-to-video needs a video diffusion model, which this backend does not provide")
    }

    fn convert(&mut self, params: &ConvertParams<'_>) -> Result<()> {
        convert::convert(params)
    }

    fn canny(&mut self, image: &mut RawImage, thresholds: CannyThresholds) -> Result<()> {
        canny::canny(image, thresholds)
    }
}

fn check_single_image(params: &SamplingParams<'_>) -> Result<()> {
    if params.input_id_images_path.is_some() {
        bail!("identity-conditioned generation is not supported by this backend");
    }
    if params.clip_skip > 0 || params.normalize_input {
        debug!(clip_skip = params.clip_skip, "clip skip and input normalization have no effect here");
    }
    if params.batch_count > 1 {
        warn!(batch_count = params.batch_count, "only the first image of a batch is produced");
    }
    Ok(())
}

/// Warns about launch options this backend accepts but does not act on.
fn warn_ignored(options: &EngineOptions) {
    let ignored: [(&str, Option<&PathBuf>); 4] = [
        ("taesd", options.taesd_path.as_ref()),
        ("lora_model_dir", options.lora_model_dir.as_ref()),
        ("embeddings", options.embeddings_path.as_ref()),
        ("stacked_id_embeddings", options.stacked_id_embeddings_path.as_ref()),
    ];
    for (option, path) in ignored {
        if let Some(path) = path {
            warn!(option, path = %path.display(), "option not supported, ignoring");
        }
    }
    if let Some(vae) = options.vae_path.as_ref().filter(|p| !p.is_file()) {
        warn!(path = %vae.display(), "vae override is not a file, ignoring");
    }
    if options.vae_tiling {
        warn!("vae tiling not supported, ignoring");
    }
    if options.schedule != Schedule::Default {
        warn!(schedule = %options.schedule, "only the default schedule is supported, ignoring");
    }
    if options.rng_type != RngType::StdDefault {
        warn!(rng = %options.rng_type, "only the device rng is supported, ignoring");
    }
    if options.device_map.control_net_on_cpu {
        warn!("no control-net model is loaded, ignoring control-net placement");
    }
}

async fn resolve_files(options: &EngineOptions, version: SdVersion, api: &Api) -> Result<ModelFiles> {
    let root = Path::new(&options.model_path);
    let mut files = if root.is_dir() {
        let tokenizer = root.join(TOKENIZER_FILE);
        let tokenizer = if tokenizer.is_file() {
            tokenizer
        } else {
            fetch_tokenizer(version, api).await?
        };
        ModelFiles {
            tokenizer,
            clip: root.join(CLIP_FILE),
            unet: root.join(UNET_FILE),
            vae: root.join(VAE_FILE),
        }
    } else {
        let repo = api.model(options.model_path.clone());
        let tokenizer = match repo.get(TOKENIZER_FILE).await {
            Ok(file) => file,
            Err(_) => fetch_tokenizer(version, api).await?,
        };
        ModelFiles {
            tokenizer,
            clip: repo.get(CLIP_FILE).await.context("failed to get CLIP weights")?,
            unet: repo.get(UNET_FILE).await.context("failed to get UNet weights")?,
            vae: repo.get(VAE_FILE).await.context("failed to get VAE weights")?,
        }
    };

    if let Some(vae) = options.vae_path.as_ref().filter(|p| p.is_file()) {
        files.vae = vae.clone();
    }
    for file in [&files.clip, &files.unet, &files.vae] {
        if !file.is_file() {
            bail!("missing weights file {}", file.display());
        }
    }
    Ok(files)
}

async fn fetch_tokenizer(version: SdVersion, api: &Api) -> Result<PathBuf> {
    api.model(version.tokenizer_repo().to_string())
        .get("tokenizer.json")
        .await
        .context("failed to get CLIP tokenizer")
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Engine = StableDiffusionEngine;

    async fn load(options: EngineOptions, api: Api) -> Result<Self::Engine> {
        if let Some(path) = &options.control_net_path {
            bail!(
                "control-net model {} cannot be loaded, this backend has no control-net support",
                path.display()
            );
        }
        warn_ignored(&options);

        if Path::new(&options.model_path).is_file() {
            warn!(
                model = %options.model_path,
                "single-file checkpoint, only conversion requests will succeed"
            );
            return Ok(StableDiffusionEngine { pipeline: None });
        }

        let version = resolve_version(&options);
        let device = select_best_device(options.device_map.placement)
            .context("failed to set up device")?;
        let dtype = match options.weight_type {
            Some(WeightType::F32) => DType::F32,
            Some(WeightType::F16) | None => DType::F16,
            Some(other) => {
                warn!(weight_type = %other, "quantized weights are only used for conversion, loading f16");
                DType::F16
            }
        };

        let files = resolve_files(&options, version, &api).await?;
        let pipeline = Pipeline::load(version, &files, &device, options.device_map, dtype)?;
        info!(%version, device = ?device, "stable diffusion pipeline ready");

        Ok(StableDiffusionEngine {
            pipeline: Some(pipeline),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CANNY_PREPROCESS;
    use crate::DeviceMap;

    fn checkpoint_only() -> StableDiffusionEngine {
        StableDiffusionEngine { pipeline: None }
    }

    fn params() -> SamplingParams<'static> {
        SamplingParams {
            prompt: "a lighthouse",
            negative_prompt: "",
            clip_skip: -1,
            cfg_scale: 7.0,
            width: 64,
            height: 64,
            sample_method: Default::default(),
            sample_steps: 2,
            strength: 0.75,
            seed: 42,
            batch_count: 1,
            style_ratio: 20.0,
            normalize_input: false,
            input_id_images_path: None,
        }
    }

    #[test]
    fn checkpoint_engine_refuses_generation() {
        let mut engine = checkpoint_only();
        let err = engine.text_to_image(&params(), None).unwrap_err();
        assert!(err.to_string().contains("single-file checkpoint"));

        let image = RawImage::rgb(8, 8, vec![0; 192]);
        assert!(engine.image_to_image(&image, &params()).is_err());
    }

    #[test]
    fn unsupported_requests_fail_before_sampling() {
        let mut engine = checkpoint_only();
        let image = RawImage::rgb(8, 8, vec![0; 192]);
        let control = ControlImage {
            image: &image,
            strength: 0.9,
        };
        let err = engine.text_to_image(&params(), Some(control)).unwrap_err();
        assert!(err.to_string().contains("control-net"));

        let ids = Path::new("ids/");
        let with_ids = SamplingParams {
            input_id_images_path: Some(ids),
            ..params()
        };
        let err = engine.text_to_image(&with_ids, None).unwrap_err();
        assert!(err.to_string().contains("identity"));

        let video = VideoParams {
            prompt: "",
            negative_prompt: "",
            width: 64,
            height: 64,
            min_cfg: 1.0,
            cfg_scale: 7.0,
            sample_method: Default::default(),
            sample_steps: 2,
            strength: 0.75,
            seed: -1,
            video_frames: 6,
            motion_bucket_id: 127,
            fps: 6,
            augmentation_level: 0.0,
        };
        assert!(engine.image_to_video(&image, &video).is_err());
    }

    #[test]
    fn canny_runs_without_a_pipeline() {
        let mut engine = checkpoint_only();
        let mut image = RawImage::rgb(8, 8, vec![90; 192]);
        engine.canny(&mut image, CANNY_PREPROCESS).unwrap();
        assert!(image.data.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn loader_rejects_control_net_and_accepts_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let options = EngineOptions {
            model_path: dir.path().join("missing").to_string_lossy().into_owned(),
            control_net_path: Some(dir.path().join("control.safetensors")),
            ..Default::default()
        };
        let api = Api::new().unwrap();
        let err = match StableDiffusionLoader::load(options, api.clone()).await {
            Ok(_) => panic!("control net should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("control-net"));

        let checkpoint = dir.path().join("model.safetensors");
        std::fs::write(&checkpoint, b"").unwrap();
        let options = EngineOptions {
            model_path: checkpoint.to_string_lossy().into_owned(),
            device_map: DeviceMap::cpu(),
            ..Default::default()
        };
        let engine = StableDiffusionLoader::load(options, api).await.unwrap();
        assert!(engine.pipeline.is_none());
    }

    #[tokio::test]
    async fn local_directory_with_missing_weights_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tokenizer")).unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILE), b"{}").unwrap();
        let options = EngineOptions {
            model_path: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let api = Api::new().unwrap();
        let err = resolve_files(&options, SdVersion::V1_5, &api).await.unwrap_err();
        assert!(err.to_string().contains("missing weights file"));
    }
}
