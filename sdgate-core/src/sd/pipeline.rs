use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Error as E, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{PredictionType, Scheduler, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::codec::RawImage;
use crate::engine::{SampleMethod, SamplingParams};
use crate::{image_to_tensor, tensor_to_image, DeviceMap, SdVersion};

const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;

/// Resolved weight and tokenizer files of a diffusers-layout model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub tokenizer: PathBuf,
    pub clip: PathBuf,
    pub unet: PathBuf,
    pub vae: PathBuf,
}

struct Placed {
    device: Device,
    dtype: DType,
}

impl Placed {
    fn new(device: Device, dtype: DType) -> Self {
        // Half precision is only worthwhile off the CPU.
        let dtype = if device.is_cpu() { DType::F32 } else { dtype };
        Self { device, dtype }
    }
}

pub struct Pipeline {
    version: SdVersion,
    config: StableDiffusionConfig,
    unet_at: Placed,
    clip_at: Placed,
    vae_at: Placed,
    tokenizer: Tokenizer,
    pad_id: u32,
    clip: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl Pipeline {
    pub fn load(
        version: SdVersion,
        files: &ModelFiles,
        device: &Device,
        device_map: DeviceMap,
        dtype: DType,
    ) -> Result<Self> {
        let config = match version {
            SdVersion::V1_5 => StableDiffusionConfig::v1_5(None, None, None),
            SdVersion::V2_1 => StableDiffusionConfig::v2_1(None, None, None),
        };
        let pinned = |cpu: bool| Placed::new(if cpu { Device::Cpu } else { device.clone() }, dtype);
        let unet_at = Placed::new(device.clone(), dtype);
        let clip_at = pinned(device_map.clip_on_cpu);
        let vae_at = pinned(device_map.vae_on_cpu);

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(E::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no `{pad_token}` token"))?;

        debug!(file = %files.clip.display(), device = ?clip_at.device, "building CLIP text model");
        let clip = stable_diffusion::build_clip_transformer(
            &config.clip,
            &files.clip,
            &clip_at.device,
            clip_at.dtype,
        )
        .context("failed to load CLIP text model")?;

        debug!(file = %files.vae.display(), device = ?vae_at.device, "building VAE");
        let vae = config
            .build_vae(&files.vae, &vae_at.device, vae_at.dtype)
            .context("failed to load VAE")?;

        debug!(file = %files.unet.display(), device = ?unet_at.device, "building UNet");
        let unet = config
            .build_unet(
                &files.unet,
                &unet_at.device,
                LATENT_CHANNELS,
                cfg!(feature = "flash-attn"),
                unet_at.dtype,
            )
            .context("failed to load UNet")?;

        Ok(Self {
            version,
            config,
            unet_at,
            clip_at,
            vae_at,
            tokenizer,
            pad_id,
            clip,
            unet,
            vae,
        })
    }

    /// Runs the denoising loop from noise, or from `init` noised to `params.strength`.
    pub fn generate(&mut self, params: &SamplingParams<'_>, init: Option<&RawImage>) -> Result<RawImage> {
        let (width, height) = (params.width as usize, params.height as usize);
        if width % 8 != 0 || height % 8 != 0 {
            bail!("width and height must be multiples of 8, got {width}x{height}");
        }
        if params.seed >= 0 {
            if let Err(err) = self.unet_at.device.set_seed(params.seed as u64) {
                warn!(error = %err, "device cannot be seeded, sampling is not reproducible");
            }
        }

        let guided = params.cfg_scale > 1.0;
        let embeddings = self.text_embeddings(params.prompt, params.negative_prompt, guided)?;
        let mut scheduler = self.scheduler(params.sample_method, params.sample_steps as usize)?;
        let timesteps = scheduler.timesteps().to_vec();
        if timesteps.is_empty() {
            bail!("scheduler produced no timesteps for {} steps", params.sample_steps);
        }

        let (mut latents, t_start) = match init {
            Some(image) => {
                let n = timesteps.len();
                let t_start = (n - (n as f64 * params.strength as f64) as usize).min(n - 1);
                let latents = self.encode(image, params.width, params.height)?;
                let noise = latents.randn_like(0f64, 1f64)?;
                (scheduler.add_noise(&latents, noise, timesteps[t_start])?, t_start)
            }
            None => {
                let shape = (1, LATENT_CHANNELS, height / 8, width / 8);
                let latents = Tensor::randn(0f32, 1f32, shape, &self.unet_at.device)?;
                let latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.unet_at.dtype)?;
                (latents, 0)
            }
        };

        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let started = Instant::now();
            let input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = self.unet.forward(&input, timestep as f64, &embeddings)?;
            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * params.cfg_scale as f64)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(
                step = index + 1,
                total = timesteps.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "denoising step"
            );
        }

        self.decode(&latents)
    }

    fn scheduler(&self, method: SampleMethod, steps: usize) -> Result<Box<dyn Scheduler>> {
        let scheduler = match method {
            SampleMethod::EulerA => {
                let prediction_type = match self.version {
                    SdVersion::V1_5 => PredictionType::Epsilon,
                    SdVersion::V2_1 => PredictionType::VPrediction,
                };
                EulerAncestralDiscreteSchedulerConfig {
                    prediction_type,
                    ..Default::default()
                }
                .build(steps)?
            }
            other => {
                debug!(sampler = %other, "no native sampler, using DDIM");
                self.config.build_scheduler(steps)?
            }
        };
        Ok(scheduler)
    }

    /// Conditional embeddings, preceded by the unconditional ones when guided.
    fn text_embeddings(&self, prompt: &str, negative: &str, guided: bool) -> Result<Tensor> {
        let cond = self.encode_prompt(prompt)?;
        let embeddings = if guided {
            let uncond = self.encode_prompt(negative)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings
            .to_device(&self.unet_at.device)?
            .to_dtype(self.unet_at.dtype)?)
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            warn!(tokens = tokens.len(), max_len, "prompt truncated");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.clip_at.device)?.unsqueeze(0)?;
        Ok(self.clip.forward(&tokens)?)
    }

    fn encode(&self, image: &RawImage, width: u32, height: u32) -> Result<Tensor> {
        let pixels = image_to_tensor(image, width, height, &self.vae_at.device)?
            .to_dtype(self.vae_at.dtype)?;
        let latents = (self.vae.encode(&pixels)?.sample()? * VAE_SCALE)?;
        Ok(latents
            .to_device(&self.unet_at.device)?
            .to_dtype(self.unet_at.dtype)?)
    }

    fn decode(&self, latents: &Tensor) -> Result<RawImage> {
        let latents = latents
            .to_device(&self.vae_at.device)?
            .to_dtype(self.vae_at.dtype)?;
        let images = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let images = ((images / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let images = (images.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&images.i(0)?)
    }
}
