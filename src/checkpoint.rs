//! Checkpoint persistence.
//!
//! Every checkpoint is a file pair sharing a basename: a `.params`
//! safetensors file holding the raw parameter tensors, and a `.checkpoint`
//! JSON manifest holding everything else needed to rebuild the model and
//! situate the run (architecture key and hyperparameters, alphabet,
//! training progress). Indexed basenames are `model_checkpoint_<5-digit>`;
//! the terminal pair is `model_final`. Indices only ever grow within a
//! run, so an existing file at a target path means two runs share an
//! output directory and the save is refused.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{FlipflopError, Result};

/// Everything but the parameter tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Iterations completed when the checkpoint was taken.
    pub iteration: usize,
    /// Learning rate in effect.
    pub learning_rate: f64,
    /// Smoothed loss at save time.
    pub smoothed_loss: f64,
    /// Base alphabet the model was trained against.
    pub alphabet: String,
    /// Architecture key and hyperparameters.
    pub model: ModelConfig,
}

/// Writes checkpoint file pairs into the output directory.
pub struct CheckpointManager {
    output_dir: PathBuf,
}

impl CheckpointManager {
    /// Create a manager rooted at the output directory.
    #[must_use]
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    /// Save an indexed checkpoint pair.
    ///
    /// # Errors
    ///
    /// Fails if either target file already exists or cannot be written.
    pub fn save_indexed(
        &self,
        index: usize,
        varmap: &VarMap,
        manifest: &CheckpointManifest,
    ) -> Result<PathBuf> {
        self.save(&format!("model_checkpoint_{index:05}"), varmap, manifest)
    }

    /// Save the terminal checkpoint pair.
    ///
    /// # Errors
    ///
    /// Fails if either target file already exists or cannot be written.
    pub fn save_final(
        &self,
        varmap: &VarMap,
        manifest: &CheckpointManifest,
    ) -> Result<PathBuf> {
        self.save("model_final", varmap, manifest)
    }

    fn save(
        &self,
        basename: &str,
        varmap: &VarMap,
        manifest: &CheckpointManifest,
    ) -> Result<PathBuf> {
        let manifest_path = self.output_dir.join(format!("{basename}.checkpoint"));
        let params_path = self.output_dir.join(format!("{basename}.params"));
        for path in [&manifest_path, &params_path] {
            if path.exists() {
                return Err(FlipflopError::Checkpoint(format!(
                    "refusing to overwrite existing checkpoint {}",
                    path.display()
                )));
            }
        }
        let json = serde_json::to_string_pretty(manifest).map_err(|e| {
            FlipflopError::Checkpoint(format!("failed to serialize manifest: {e}"))
        })?;
        std::fs::write(&manifest_path, json)?;
        varmap.save(&params_path)?;
        tracing::info!("saved checkpoint {}", manifest_path.display());
        Ok(params_path)
    }

    /// Load a manifest from a `.checkpoint` file.
    ///
    /// # Errors
    ///
    /// Fails when the file is missing or not a valid manifest.
    pub fn load_manifest(path: &Path) -> Result<CheckpointManifest> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| FlipflopError::Checkpoint(format!("failed to parse manifest: {e}")))
    }

    /// Load parameter tensors from a `.params` file into an existing
    /// variable map. The map must already hold variables of matching
    /// names and shapes, i.e. the model must have been built first.
    ///
    /// # Errors
    ///
    /// Fails when the file is missing or does not match the variables.
    pub fn load_params(path: &Path, varmap: &mut VarMap) -> Result<()> {
        varmap
            .load(path)
            .map_err(|e| FlipflopError::Checkpoint(format!("failed to load parameters: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelKind;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    fn manifest() -> CheckpointManifest {
        CheckpointManifest {
            iteration: 500,
            learning_rate: 9e-4,
            smoothed_loss: 1.25,
            alphabet: "ACGT".to_string(),
            model: ModelConfig {
                kind: ModelKind::ConvGru,
                size: 8,
                winlen: 5,
                stride: 2,
            },
        }
    }

    fn varmap_with_var() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((4, 4), "w", candle_nn::init::DEFAULT_KAIMING_NORMAL)
            .unwrap();
        varmap
    }

    #[test]
    fn test_save_and_reload_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf());
        let varmap = varmap_with_var();
        manager.save_indexed(3, &varmap, &manifest()).unwrap();

        let loaded = CheckpointManager::load_manifest(
            &dir.path().join("model_checkpoint_00003.checkpoint"),
        )
        .unwrap();
        assert_eq!(loaded.iteration, 500);
        assert_eq!(loaded.alphabet, "ACGT");
        assert!(dir.path().join("model_checkpoint_00003.params").exists());
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf());
        let varmap = varmap_with_var();
        manager.save_final(&varmap, &manifest()).unwrap();
        let err = manager.save_final(&varmap, &manifest()).unwrap_err();
        assert!(matches!(err, FlipflopError::Checkpoint(_)));
    }

    #[test]
    fn test_params_roundtrip_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf());
        let varmap = varmap_with_var();
        let params_path = manager.save_indexed(0, &varmap, &manifest()).unwrap();

        let mut restored = varmap_with_var();
        CheckpointManager::load_params(&params_path, &mut restored).unwrap();

        let original = varmap.all_vars()[0]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let reloaded = restored.all_vars()[0]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(original, reloaded);
    }
}
