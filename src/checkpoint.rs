//! Safetensors weight files

use anyhow::{bail, Context, Result};
use safetensors::tensor::SafeTensors;
use std::path::Path;
use tracing::info;

use crate::model::ParityTransformer;

/// Default weights file name
pub const DEFAULT_WEIGHTS_FILE: &str = "model_weights.safetensors";

/// Write every model parameter to `path`
pub fn save_weights(model: &ParityTransformer, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    model
        .varmap()
        .save(path)
        .with_context(|| format!("Failed to save weights to {}", path.display()))?;
    info!("Saved {} parameters to {}", model.n_parameters(), path.display());
    Ok(())
}

/// Tensor names and shapes stored in a weights file, sorted by name
pub fn list_tensors(path: impl AsRef<Path>) -> Result<Vec<(String, Vec<usize>)>> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&data)
        .with_context(|| format!("{} is not a safetensors file", path.display()))?;
    let mut entries = Vec::new();
    for name in tensors.names() {
        let view = tensors.tensor(name)?;
        entries.push((name.clone(), view.shape().to_vec()));
    }
    entries.sort();
    Ok(entries)
}

/// Load weights into `model` in place
///
/// Every parameter of the model must be present in the file with a matching
/// shape; all missing or mismatched names are reported together.
pub fn load_weights(model: &mut ParityTransformer, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let stored: std::collections::HashMap<String, Vec<usize>> =
        list_tensors(path)?.into_iter().collect();

    let mut problems = Vec::new();
    {
        let vars = model
            .varmap()
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;
        let mut names: Vec<&String> = vars.keys().collect();
        names.sort();
        for name in names {
            let expected = vars[name].as_tensor().dims();
            match stored.get(name) {
                None => problems.push(format!("missing {name}")),
                Some(shape) if shape.as_slice() != expected => {
                    problems.push(format!("{name}: file {shape:?}, model {expected:?}"));
                }
                Some(_) => {}
            }
        }
    }
    if !problems.is_empty() {
        bail!(
            "Weights file {} does not match the model: {}",
            path.display(),
            problems.join(", ")
        );
    }

    model
        .varmap_mut()
        .load(path)
        .with_context(|| format!("Failed to load weights from {}", path.display()))?;
    info!("Loaded weights from {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use candle_core::{Device, Tensor};

    /// Every parameter flattened, keyed by name
    fn parameters(model: &ParityTransformer) -> Vec<(String, Vec<f32>)> {
        let vars = model.varmap().data().lock().unwrap();
        let mut params: Vec<(String, Vec<f32>)> = vars
            .iter()
            .map(|(name, var)| {
                let values = var.as_tensor().flatten_all().unwrap().to_vec1().unwrap();
                (name.clone(), values)
            })
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    fn config(seed: u64) -> ModelConfig {
        ModelConfig {
            d_model: 8,
            d_head: 4,
            n_heads: 2,
            d_mlp: 16,
            n_layers: 2,
            n_ctx: 5,
            seed,
            ..Default::default()
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("w.safetensors");

        let source = ParityTransformer::new(&config(1), &Device::Cpu).unwrap();
        save_weights(&source, &path).unwrap();

        let mut target = ParityTransformer::new(&config(2), &Device::Cpu).unwrap();
        let tokens = Tensor::from_vec(vec![0u32, 65, 66, 65], (1, 4), &Device::Cpu).unwrap();
        let logits = |model: &ParityTransformer| -> Vec<f32> {
            model
                .forward(&tokens)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        let before = logits(&target);
        assert_ne!(parameters(&target), parameters(&source));
        load_weights(&mut target, &path).unwrap();

        let expected = logits(&source);
        assert_ne!(before, expected);
        assert_eq!(logits(&target), expected);
        // Bit-identical parameters, name by name
        assert_eq!(parameters(&target), parameters(&source));
    }

    #[test]
    fn test_list_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let model = ParityTransformer::new(&config(0), &Device::Cpu).unwrap();
        save_weights(&model, &path).unwrap();

        let entries = list_tensors(&path).unwrap();
        let total: usize = entries.iter().map(|(_, s)| s.iter().product::<usize>()).sum();
        assert_eq!(total, model.n_parameters());
        let embed = entries.iter().find(|(n, _)| n == "embed.weight").unwrap();
        assert_eq!(embed.1, vec![256, 8]);
    }

    #[test]
    fn test_mismatched_architecture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let small = ParityTransformer::new(&config(0), &Device::Cpu).unwrap();
        save_weights(&small, &path).unwrap();

        let mut deeper = ParityTransformer::new(
            &ModelConfig {
                n_layers: 3,
                ..config(0)
            },
            &Device::Cpu,
        )
        .unwrap();
        let err = load_weights(&mut deeper, &path).unwrap_err().to_string();
        assert!(err.contains("missing blocks.2"), "{err}");
    }

    #[test]
    fn test_not_a_weights_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not safetensors").unwrap();
        assert!(list_tensors(file.path()).is_err());
    }
}
