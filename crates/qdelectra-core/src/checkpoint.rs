//! SafeTensors checkpoint I/O for [`VarMap`]-backed models.
//!
//! * [`save_varmap`] writes every variable to one file.
//! * [`load_full`] restores a checkpoint written by [`save_varmap`]; every
//!   variable must be present with the same shape.
//! * [`load_partial`] copies in whatever tensors of a pretrained file match
//!   by name and shape, leaving the rest at their current values.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use candle_nn::VarMap;
use tracing::{debug, info};

use crate::electra::ElectraConfig;
use crate::error::{CoreError, CoreResult};

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
const SAFETENSORS_SINGLE: &str = "model.safetensors";

/// Outcome of a [`load_partial`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Variables overwritten from the file.
    pub loaded: usize,
    /// File tensors whose name matched but whose shape did not.
    pub shape_mismatched: Vec<String>,
    /// File tensors with no variable of that name.
    pub unused: usize,
}

pub fn save_varmap(varmap: &VarMap, path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    varmap.save(path)?;
    debug!(path = %path.display(), "Checkpoint written");
    Ok(())
}

fn read_tensors(path: &Path, varmap: &VarMap) -> CoreResult<HashMap<String, Tensor>> {
    if !path.exists() {
        return Err(CoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("checkpoint not found: {}", path.display()),
        )));
    }
    let device = {
        let data = varmap.data().lock().map_err(|_| CoreError::config("varmap", "lock poisoned"))?;
        match data.values().next() {
            Some(var) => var.device().clone(),
            None => candle_core::Device::Cpu,
        }
    };
    Ok(candle_core::safetensors::load(path, &device)?)
}

/// Restore every variable from `path`.
///
/// Fails with [`CoreError::MissingWeights`] if a variable is absent from the
/// file and [`CoreError::ShapeMismatch`] if a shape differs.
pub fn load_full(varmap: &VarMap, path: &Path) -> CoreResult<()> {
    let tensors = read_tensors(path, varmap)?;
    let data = varmap.data().lock().map_err(|_| CoreError::config("varmap", "lock poisoned"))?;

    for (name, var) in data.iter() {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| CoreError::MissingWeights(format!("{name} in {}", path.display())))?;
        if tensor.dims() != var.dims() {
            return Err(CoreError::ShapeMismatch {
                name: name.clone(),
                expected: var.dims().to_vec(),
                found: tensor.dims().to_vec(),
            });
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }

    info!(path = %path.display(), tensors = data.len(), "Checkpoint restored");
    Ok(())
}

/// Copy matching tensors from `path` into `varmap`, looking each file tensor
/// up as `{prefix}{name}`.
pub fn load_partial(varmap: &VarMap, path: &Path, prefix: &str) -> CoreResult<LoadReport> {
    let tensors = read_tensors(path, varmap)?;
    let data = varmap.data().lock().map_err(|_| CoreError::config("varmap", "lock poisoned"))?;

    let mut report = LoadReport::default();
    for (name, tensor) in &tensors {
        let key = format!("{prefix}{name}");
        match data.get(&key) {
            Some(var) if var.dims() == tensor.dims() => {
                var.set(&tensor.to_dtype(var.dtype())?)?;
                report.loaded += 1;
            }
            Some(_) => report.shape_mismatched.push(key),
            None => report.unused += 1,
        }
    }
    report.shape_mismatched.sort();

    info!(
        path = %path.display(),
        prefix,
        loaded = report.loaded,
        shape_mismatched = report.shape_mismatched.len(),
        unused = report.unused,
        "Pretrained weights loaded"
    );
    Ok(report)
}

/// Weight files of a Hugging Face model directory: the shards listed in
/// `model.safetensors.index.json`, or the single `model.safetensors`.
pub fn collect_safetensor_paths(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let index_path = dir.join(SAFETENSORS_INDEX);
    if index_path.exists() {
        let json = std::fs::read_to_string(&index_path)?;
        let index: serde_json::Value = serde_json::from_str(&json)?;
        let mut shards: Vec<String> = index["weight_map"]
            .as_object()
            .map(|m| {
                m.values()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        shards.sort();
        return Ok(shards.iter().map(|s| dir.join(s)).collect());
    }

    let single = dir.join(SAFETENSORS_SINGLE);
    if single.exists() {
        return Ok(vec![single]);
    }

    Err(CoreError::MissingWeights(dir.display().to_string()))
}

/// Parse `config.json` from a Hugging Face model directory.
pub fn read_electra_config(dir: &Path) -> CoreResult<ElectraConfig> {
    let json = std::fs::read_to_string(dir.join("config.json"))?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};
    use tempfile::TempDir;

    fn varmap_with(names: &[(&str, usize)], fill: f64) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        for (name, size) in names {
            vb.get_with_hints(*size, name, Init::Const(fill)).unwrap();
        }
        varmap
    }

    fn values(varmap: &VarMap, name: &str) -> Vec<f32> {
        let data = varmap.data().lock().unwrap();
        data[name].as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn full_round_trip_restores_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt").join("model_steps_3.safetensors");
        let saved = varmap_with(&[("a", 2), ("b", 3)], 1.5);
        save_varmap(&saved, &path).unwrap();

        let fresh = varmap_with(&[("a", 2), ("b", 3)], 0.0);
        load_full(&fresh, &path).unwrap();
        assert_eq!(values(&fresh, "b"), vec![1.5; 3]);
    }

    #[test]
    fn full_load_requires_every_variable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.safetensors");
        save_varmap(&varmap_with(&[("a", 2)], 1.0), &path).unwrap();

        let wider = varmap_with(&[("a", 2), ("extra", 1)], 0.0);
        assert!(matches!(load_full(&wider, &path), Err(CoreError::MissingWeights(_))));

        let reshaped = varmap_with(&[("a", 4)], 0.0);
        assert!(matches!(load_full(&reshaped, &path), Err(CoreError::ShapeMismatch { .. })));
    }

    #[test]
    fn partial_load_skips_mismatches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pretrained.safetensors");
        save_varmap(&varmap_with(&[("enc", 2), ("head", 3), ("gen", 1)], 2.0), &path).unwrap();

        let target = varmap_with(&[("student.enc", 2), ("student.head", 5)], 0.0);
        let report = load_partial(&target, &path, "student.").unwrap();

        assert_eq!(report.loaded, 1);
        assert_eq!(report.shape_mismatched, vec!["student.head".to_string()]);
        assert_eq!(report.unused, 1);
        assert_eq!(values(&target, "student.enc"), vec![2.0, 2.0]);
        assert_eq!(values(&target, "student.head"), vec![0.0; 5]);
    }

    #[test]
    fn missing_checkpoint_is_io_error() {
        let varmap = varmap_with(&[("a", 1)], 0.0);
        let err = load_full(&varmap, Path::new("/nonexistent/model.safetensors")).unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[test]
    fn sharded_index_lists_unique_shards() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SAFETENSORS_INDEX),
            r#"{"weight_map": {"x": "model-00002.safetensors", "y": "model-00001.safetensors", "z": "model-00001.safetensors"}}"#,
        )
        .unwrap();
        let paths = collect_safetensor_paths(dir.path()).unwrap();
        assert_eq!(
            paths,
            vec![dir.path().join("model-00001.safetensors"), dir.path().join("model-00002.safetensors")]
        );

        let empty = TempDir::new().unwrap();
        assert!(collect_safetensor_paths(empty.path()).is_err());
    }
}
