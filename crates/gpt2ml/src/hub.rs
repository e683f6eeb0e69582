//! Download of the pretrained checkpoints from the Hugging Face hub.

use crate::models::gpt2::{Gpt2, Gpt2ModelType};
use crate::Gpt2Error;
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use std::path::PathBuf;
use std::time::Instant;

const MODEL_FILES: [&str; 2] = ["config.json", "model.safetensors"];

/// Downloads (or reuses the cached copy of) the checkpoint of `model_type`.
///
/// Returns the local directory containing `config.json` and `model.safetensors`,
/// suitable for [`Gpt2::load_dir`].
pub fn fetch(model_type: Gpt2ModelType) -> Result<PathBuf, Gpt2Error> {
    let api = ApiBuilder::new()
        .with_progress(true)
        .build()?
        .repo(Repo::new(model_type.hub_repo().to_string(), RepoType::Model));

    let mut dir = None;
    for filename in MODEL_FILES {
        let start_time = Instant::now();
        log::debug!("fetching {} from {}", filename, model_type.hub_repo());
        let path = api.get(filename)?;
        log::info!(
            "fetched {} in {:.2}s",
            filename,
            start_time.elapsed().as_secs_f32()
        );
        dir = path.parent().map(|p| p.to_path_buf());
    }

    dir.ok_or_else(|| {
        Gpt2Error::InvalidConfig(format!("no local snapshot for {}", model_type.hub_repo()))
    })
}

impl Gpt2 {
    /// Downloads and loads one of the standard GPT-2 checkpoints.
    pub fn from_hub(model_type: Gpt2ModelType) -> Result<Self, Gpt2Error> {
        let dir = fetch(model_type)?;
        log::info!("Loading weights from pretrained gpt: {}", model_type);
        Self::load_dir(dir)
    }
}
