pub mod codec;
pub mod descriptor;
pub mod device_map;
pub mod engine;
pub mod error;
pub mod gate;
pub mod loader;
mod loader_factory;
pub mod orchestrator;
mod util;

mod sd;

pub use codec::{encode, ImageSource, OutputFormat, RawImage};
pub use descriptor::{build, JobDefaults, JobDescriptor, Mode};
pub use device_map::*;
pub use engine::{
    Engine, EngineOptions, GenerationResult, RngType, SampleMethod, Schedule, WeightType,
};
pub use error::{DecodeError, EncodeError, OrchestrationError, ValidationError};
pub use gate::EngineGate;
pub use loader::*;
pub use loader_factory::*;
pub use orchestrator::{Orchestrator, Outcome, PipelineConfig};
pub use sd::{StableDiffusionEngine, StableDiffusionLoader};
pub(crate) use util::*;
