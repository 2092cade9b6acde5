use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{Engine, EngineOptions};

pub trait Loader {
    type Engine: Engine;

    /// Resolves weights (locally or through `api`) and builds a ready engine.
    fn load(options: EngineOptions, api: Api) -> impl Future<Output = Result<Self::Engine>>
    where
        Self: Sized;
}
