mod bodypix;
mod preprocess;
pub mod types;

pub use bodypix::{BodyPix, BodyPixSegmenter};
pub use types::MaskProvider;

use crate::config::ModelConfig;
use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Lazily-initialised, load-once reference to a model
///
/// The first successful `get_or_load` stores the model; every later call
/// returns the same instance without running its loader. A failed load leaves
/// the handle empty.
pub struct ModelHandle<M> {
    cell: OnceCell<Arc<M>>,
}

impl<M> ModelHandle<M> {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<Arc<M>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<M>>,
    {
        let model = self
            .cell
            .get_or_try_init(|| async move { load().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(model))
    }

    pub fn get(&self) -> Option<Arc<M>> {
        self.cell.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

impl<M> Default for ModelHandle<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide BodyPix instance
static BODYPIX: ModelHandle<BodyPix> = ModelHandle::new();

/// Load the BodyPix model once per process
///
/// `model_path` may name the ONNX file or a directory holding the export
/// named by [`ModelConfig::model_file_name`].
pub async fn load_model(model_path: &Path, config: &ModelConfig) -> Result<Arc<BodyPix>> {
    let path = resolve_model_path(model_path, config);
    let config = config.clone();

    BODYPIX
        .get_or_load(|| async move {
            tokio::task::spawn_blocking(move || BodyPix::new(&path, config))
                .await
                .context("Model load task panicked")?
        })
        .await
}

fn resolve_model_path(model_path: &Path, config: &ModelConfig) -> PathBuf {
    if model_path.is_dir() {
        model_path.join(config.model_file_name())
    } else {
        model_path.to_path_buf()
    }
}
