use std::path::PathBuf;

use clap::Parser;
use sdgate_core::{
    DeviceMap, EngineOptions, JobDefaults, PipelineConfig, Placement, RngType, SampleMethod,
    Schedule, SdVersion, WeightType,
};

// Define command line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Stable Diffusion image generation server")]
pub struct Args {
    /// Diffusers model directory, single-file safetensors checkpoint, or Hugging Face repo id
    #[arg(long, short = 'm', env = "SDGATE_MODEL")]
    pub model: String,

    /// Standalone VAE weights overriding the model's own
    #[arg(long, env = "SDGATE_VAE")]
    pub vae: Option<PathBuf>,

    /// Tiny autoencoder weights for fast latent decoding
    #[arg(long, env = "SDGATE_TAESD")]
    pub taesd: Option<PathBuf>,

    /// Control-net weights. The built-in candle backend has no control-net
    /// model and refuses to start with this set
    #[arg(long, env = "SDGATE_CONTROL_NET")]
    pub control_net: Option<PathBuf>,

    /// Directory of textual-inversion embeddings
    #[arg(long, env = "SDGATE_EMBD_DIR")]
    pub embd_dir: Option<PathBuf>,

    /// Directory of stacked-id (PhotoMaker) embeddings
    #[arg(long, env = "SDGATE_STACKED_ID_EMBD_DIR")]
    pub stacked_id_embd_dir: Option<PathBuf>,

    /// Directory of LoRA weights
    #[arg(long, env = "SDGATE_LORA_MODEL_DIR")]
    pub lora_model_dir: Option<PathBuf>,

    /// Directory conversion requests write into
    #[arg(long, env = "SDGATE_OUTPUT_DIR", default_value = "converted")]
    pub output_dir: PathBuf,

    /// Directory `input_image_path` and `control_image_path` are read from;
    /// path-form images are refused when unset
    #[arg(long, env = "SDGATE_INPUT_DIR")]
    pub input_dir: Option<PathBuf>,

    /// CPU worker threads (defaults to the number of cores)
    #[arg(long, short = 't', env = "SDGATE_THREADS")]
    pub threads: Option<usize>,

    /// Weight type for loading and conversion
    #[arg(long = "type", env = "SDGATE_TYPE")]
    pub weight_type: Option<WeightType>,

    /// Decode latents in tiles to save memory
    #[arg(long)]
    pub vae_tiling: bool,

    /// Keep the control-net on the CPU
    #[arg(long)]
    pub control_net_cpu: bool,

    /// Keep the CLIP text encoder on the CPU
    #[arg(long)]
    pub clip_on_cpu: bool,

    /// Keep the VAE on the CPU
    #[arg(long)]
    pub vae_on_cpu: bool,

    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// Model generation; detected from the model name when omitted
    #[arg(long, env = "SDGATE_SD_VERSION")]
    pub sd_version: Option<SdVersion>,

    /// Sampler used when a request does not name one
    #[arg(long, env = "SDGATE_SAMPLING_METHOD", default_value_t = SampleMethod::EulerA)]
    pub sampling_method: SampleMethod,

    /// Noise schedule
    #[arg(long, env = "SDGATE_SCHEDULE", default_value_t = Schedule::Default)]
    pub schedule: Schedule,

    /// Random number generator
    #[arg(long, env = "SDGATE_RNG", default_value_t = RngType::StdDefault)]
    pub rng: RngType,

    /// Host address to bind the server to
    #[arg(long, env = "SDGATE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "SDGATE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Largest accepted request body, in MiB
    #[arg(long, env = "SDGATE_MAX_BODY_MB", default_value_t = 64)]
    pub max_body_mb: usize,

    /// Emit logs as JSON lines
    #[arg(long, env = "SDGATE_LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            model_path: self.model.clone(),
            vae_path: self.vae.clone(),
            taesd_path: self.taesd.clone(),
            control_net_path: self.control_net.clone(),
            lora_model_dir: self.lora_model_dir.clone(),
            embeddings_path: self.embd_dir.clone(),
            stacked_id_embeddings_path: self.stacked_id_embd_dir.clone(),
            sd_version: self.sd_version,
            weight_type: self.weight_type,
            rng_type: self.rng,
            schedule: self.schedule,
            vae_tiling: self.vae_tiling,
            device_map: DeviceMap {
                placement: if self.cpu {
                    Placement::ForceCpu
                } else {
                    Placement::default()
                },
                clip_on_cpu: self.clip_on_cpu,
                vae_on_cpu: self.vae_on_cpu,
                control_net_on_cpu: self.control_net_cpu,
            },
        }
    }

    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            sample_method: self.sampling_method,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            control_net: self.control_net.is_some(),
            model_path: self.model.clone(),
            vae_path: self.vae.clone(),
            weight_type: self.weight_type,
            output_dir: self.output_dir.clone(),
            input_dir: self.input_dir.clone(),
        }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation_uses_defaults() {
        let args = Args::try_parse_from(["sdgate", "--model", "models/sd15"]).unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.host, "127.0.0.1");
        assert_eq!(args.max_body_bytes(), 64 * 1024 * 1024);

        let options = args.engine_options();
        assert_eq!(options.model_path, "models/sd15");
        assert_eq!(options.device_map.placement, Placement::Ordinal(0));
        assert_eq!(options.schedule, Schedule::Default);
        assert_eq!(args.job_defaults().sample_method, SampleMethod::EulerA);
        let config = args.pipeline_config();
        assert!(!config.control_net);
        assert_eq!(config.output_dir, PathBuf::from("converted"));
        assert_eq!(config.input_dir, None);
    }

    #[test]
    fn options_map_onto_engine_and_pipeline() {
        let args = Args::try_parse_from([
            "sdgate",
            "-m",
            "model.safetensors",
            "--vae",
            "vae.safetensors",
            "--control-net",
            "canny.safetensors",
            "--type",
            "q8_0",
            "--sd-version",
            "v2-1",
            "--sampling-method",
            "dpm++2m",
            "--schedule",
            "karras",
            "--cpu",
            "--clip-on-cpu",
            "--control-net-cpu",
            "--output-dir",
            "/srv/models",
            "--input-dir",
            "/srv/inputs",
        ])
        .unwrap();

        let options = args.engine_options();
        assert_eq!(options.weight_type, Some(WeightType::Q8_0));
        assert_eq!(options.sd_version, Some(SdVersion::V2_1));
        assert_eq!(options.schedule, Schedule::Karras);
        assert_eq!(options.device_map.placement, Placement::ForceCpu);
        assert!(options.device_map.clip_on_cpu);
        assert!(!options.device_map.vae_on_cpu);
        assert!(options.device_map.control_net_on_cpu);

        let config = args.pipeline_config();
        assert!(config.control_net);
        assert_eq!(config.vae_path, Some(PathBuf::from("vae.safetensors")));
        assert_eq!(config.output_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.input_dir, Some(PathBuf::from("/srv/inputs")));
        assert_eq!(args.job_defaults().sample_method, SampleMethod::DpmPP2M);
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        assert!(Args::try_parse_from(["sdgate", "-m", "m", "--type", "q2_k"]).is_err());
        assert!(Args::try_parse_from(["sdgate", "-m", "m", "--sampling-method", "ddim"]).is_err());
    }
}
