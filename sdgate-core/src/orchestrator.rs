//! Executes one job against the shared engine.
//!
//! The pipeline is at most three engine calls: the mode's primary call, the
//! optional canny pass over the control image, and the optional
//! control-conditioned regeneration. The regeneration discards the primary
//! result, so a request with a control image costs two full generations.
//! Every buffer has exactly one owner at a time and is dropped as soon as the
//! next step no longer needs it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::codec::{apply_canny_preprocess, RawImage};
use crate::descriptor::{JobDescriptor, Mode};
use crate::engine::{ControlImage, ConvertParams, Engine, GenerationResult, WeightType};
use crate::error::OrchestrationError;
use crate::gate::EngineGate;

/// Launch-time facts the pipeline depends on.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// A control-net model was loaded, so control images are honoured.
    pub control_net: bool,
    pub model_path: String,
    pub vae_path: Option<PathBuf>,
    pub weight_type: Option<WeightType>,
    /// Conversion targets are written below this directory.
    pub output_dir: PathBuf,
    /// Image paths in requests are read below this directory; `None` refuses them.
    pub input_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub enum Outcome {
    Image(GenerationResult),
    Converted(PathBuf),
}

pub struct Orchestrator {
    gate: Arc<EngineGate>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(gate: Arc<EngineGate>, config: PipelineConfig) -> Self {
        Self { gate, config }
    }

    pub fn run(&self, job: &JobDescriptor) -> Result<Outcome, OrchestrationError> {
        let params = job.sampling();
        let primary = match job.mode {
            Mode::ConvertModel => return self.convert(job),
            Mode::TextToImage => {
                self.generate("txt2img", |engine| engine.text_to_image(&params, None))?
            }
            Mode::ImageToImage => {
                let init = self.input_image(job)?;
                self.generate("img2img", |engine| engine.image_to_image(&init, &params))?
            }
            Mode::ImageToVideo => {
                let init = self.input_image(job)?;
                let video = job.video();
                self.generate("img2vid", |engine| engine.image_to_video(&init, &video))?
            }
        };

        let Some(control) = self.control_image(job)? else {
            return Ok(Outcome::Image(primary));
        };

        // The conditioned pass replaces the first one entirely.
        drop(primary);
        let control = ControlImage {
            image: &control,
            strength: job.control_strength,
        };
        let result = self.generate("txt2img+control", |engine| {
            engine.text_to_image(&params, Some(control))
        })?;
        Ok(Outcome::Image(result))
    }

    fn input_image(&self, job: &JobDescriptor) -> Result<RawImage, OrchestrationError> {
        let source = job
            .input_image
            .as_ref()
            .ok_or_else(|| OrchestrationError::InputImage(missing_input()))?;
        Ok(source.decode(self.config.input_dir.as_deref())?)
    }

    /// Decodes and preprocesses the control image, if this job gets one.
    ///
    /// A control image that cannot be decoded is skipped rather than failing
    /// the request; the unconditioned result is returned instead.
    fn control_image(&self, job: &JobDescriptor) -> Result<Option<RawImage>, OrchestrationError> {
        if !self.config.control_net {
            return Ok(None);
        }
        let Some(source) = job.control_image.as_ref() else {
            return Ok(None);
        };
        let image = match source.decode(self.config.input_dir.as_deref()) {
            Ok(image) => image,
            Err(err) => {
                warn!(error = %err, "ignoring undecodable control image");
                return Ok(None);
            }
        };
        if !job.canny_preprocess {
            return Ok(Some(image));
        }

        let started = Instant::now();
        let edges = self
            .gate
            .with(|engine| apply_canny_preprocess(engine, image))
            .map_err(OrchestrationError::engine)?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "canny preprocess done");
        Ok(Some(edges))
    }

    fn generate(
        &self,
        stage: &'static str,
        call: impl FnOnce(&mut dyn Engine) -> anyhow::Result<GenerationResult>,
    ) -> Result<GenerationResult, OrchestrationError> {
        let started = Instant::now();
        let result = self.gate.with(call).map_err(OrchestrationError::engine)?;
        if !result.is_well_formed() {
            return Err(OrchestrationError::EngineFailure(format!(
                "{stage} returned an empty or inconsistent image ({result:?})"
            )));
        }
        info!(
            stage,
            width = result.width,
            height = result.height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );
        Ok(result)
    }

    fn convert(&self, job: &JobDescriptor) -> Result<Outcome, OrchestrationError> {
        let target = job
            .output_path()
            .ok_or_else(|| OrchestrationError::ConversionFailed("no output path given".into()))?;
        let output_path = self.config.output_dir.join(target);
        let params = ConvertParams {
            model_path: &self.config.model_path,
            vae_path: self.config.vae_path.as_deref(),
            output_path: &output_path,
            weight_type: self.config.weight_type,
        };
        let started = Instant::now();
        self.gate
            .with(|engine| engine.convert(&params))
            .map_err(|e| OrchestrationError::ConversionFailed(format!("{e:#}")))?;
        info!(
            output = %output_path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model converted"
        );
        Ok(Outcome::Converted(output_path))
    }
}

fn missing_input() -> crate::error::DecodeError {
    crate::error::DecodeError::UnsupportedImageContent("no input image supplied".into())
}
