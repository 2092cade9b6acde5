use anyhow::Result;
use hf_hub::api::tokio::Api;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Engine, EngineOptions, Loader, StableDiffusionLoader};

/// Stable Diffusion generations the backend knows how to configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SdVersion {
    #[default]
    #[serde(rename = "v1-5")]
    V1_5,
    #[serde(rename = "v2-1")]
    V2_1,
}

serde_plain::derive_fromstr_from_deserialize!(SdVersion);
serde_plain::derive_display_from_serialize!(SdVersion);

impl SdVersion {
    /// Detect the version from a model name or path.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name = model_name.to_lowercase().replace(['_', '.'], "-");

        if name.contains("2-1") || name.contains("v2") || name.contains("sd2") {
            Some(SdVersion::V2_1)
        } else if name.contains("1-5") || name.contains("v1") || name.contains("sd1") {
            Some(SdVersion::V1_5)
        } else {
            None
        }
    }

    /// Repository holding the CLIP tokenizer when the model ships none.
    pub fn tokenizer_repo(self) -> &'static str {
        "openai/clip-vit-base-patch32"
    }
}

/// Resolve the version to use: explicit choice, then the model name, then v1.5.
pub fn resolve_version(options: &EngineOptions) -> SdVersion {
    options
        .sd_version
        .or_else(|| SdVersion::from_name(&options.model_path))
        .unwrap_or_default()
}

/// Load the engine described by `options`.
pub async fn load_engine(mut options: EngineOptions) -> Result<Box<dyn Engine>> {
    let version = resolve_version(&options);
    options.sd_version = Some(version);

    info!(model = %options.model_path, %version, "loading engine");

    let engine = StableDiffusionLoader::load(options, Api::new()?).await?;
    Ok(Box::new(engine))
}
