use serde::Deserialize;
use std::{fs, path::Path};

use crate::error::OracleError;
use crate::preprocess::{ImageTensor, Layout, INPUT_SIZE};

/// Tensor in, probability vector out.
pub trait Oracle: Send + Sync {
    fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>, OracleError>;

    /// Number of classes in the output vector.
    fn num_classes(&self) -> usize;
}

fn default_model_type() -> String {
    "MobileNetV2 Transfer Learning".to_string()
}

fn default_input_size() -> u32 {
    INPUT_SIZE
}

/// Optional `model_config.json` next to the model artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelMeta {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default)]
    pub channels_first: bool,
    /// Apply softmax to the raw output before argmax.
    #[serde(default)]
    pub outputs_logits: bool,
}

impl Default for ModelMeta {
    fn default() -> Self {
        Self {
            model_type: default_model_type(),
            input_size: INPUT_SIZE,
            channels_first: false,
            outputs_logits: false,
        }
    }
}

impl ModelMeta {
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        if !path.exists() {
            tracing::warn!("no {} found; using default model metadata", path.display());
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(path)
            .with_context(|| format!("failed to read model config at {}", path.display()))?;
        serde_json::from_str(&txt).with_context(|| "failed to parse model_config.json")
    }

    pub fn layout(&self) -> Layout {
        if self.channels_first {
            Layout::Nchw
        } else {
            Layout::Nhwc
        }
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(feature = "torch")]
pub use self::torch::TorchOracle;

#[cfg(feature = "torch")]
mod torch {
    use anyhow::{bail, Context, Result};
    use tch::{kind::Kind, CModule, Device, Tensor};

    use super::{softmax, ModelMeta, Oracle};
    use crate::error::OracleError;
    use crate::preprocess::ImageTensor;

    /// TorchScript classifier loaded through libtorch.
    pub struct TorchOracle {
        model: CModule,
        device: Device,
        input_shape: [i64; 4],
        n_classes: usize,
        outputs_logits: bool,
    }

    impl TorchOracle {
        pub fn load(model_path: &str, meta: &ModelMeta) -> Result<Self> {
            let device = Device::Cpu;

            let model = CModule::load_on_device(model_path, device)
                .with_context(|| format!("failed to load TorchScript {}", model_path))?;

            let size = meta.input_size as i64;
            let input_shape = if meta.channels_first {
                [1, 3, size, size]
            } else {
                [1, size, size, 3]
            };

            // Probe output shape with a dummy forward; expect [B=1, N]
            let dummy = Tensor::zeros(input_shape, (Kind::Float, device));
            let t = tch::no_grad(|| model.forward_ts(&[dummy]))?;
            let sz = t.size();
            if sz.len() != 2 || sz[0] != 1 || sz[1] < 1 {
                bail!("unexpected model output size: {:?}", sz);
            }

            Ok(Self {
                model,
                device,
                input_shape,
                n_classes: sz[1] as usize,
                outputs_logits: meta.outputs_logits,
            })
        }
    }

    impl Oracle for TorchOracle {
        fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>, OracleError> {
            let expected = self.input_shape.iter().product::<i64>() as usize;
            if input.len() != expected {
                return Err(OracleError::InputShape {
                    got: input.len(),
                    expected,
                });
            }

            let x = Tensor::from_slice(&input.data)
                .reshape(self.input_shape)
                .to_device(self.device);

            // Forward: [1, N]
            let t = tch::no_grad(|| self.model.forward_ts(&[x]))?;
            let sz = t.size();
            if sz.len() != 2 || sz[0] != 1 {
                return Err(OracleError::OutputShape(sz));
            }

            let out = t.squeeze_dim(0).to_kind(Kind::Float);
            let probs = Vec::<f32>::try_from(&out)?;
            if probs.is_empty() {
                return Err(OracleError::EmptyOutput);
            }
            Ok(if self.outputs_logits { softmax(&probs) } else { probs })
        }

        fn num_classes(&self) -> usize {
            self.n_classes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn meta_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let meta = ModelMeta::load_or_default(&dir.path().join("model_config.json")).unwrap();
        assert_eq!(meta.input_size, 224);
        assert_eq!(meta.layout(), Layout::Nhwc);
        assert_eq!(meta.model_type, "MobileNetV2 Transfer Learning");
    }

    #[test]
    fn meta_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_config.json");
        fs::write(&path, r#"{"channels_first": true, "outputs_logits": true}"#).unwrap();
        let meta = ModelMeta::load_or_default(&path).unwrap();
        assert_eq!(meta.layout(), Layout::Nchw);
        assert!(meta.outputs_logits);
        assert_eq!(meta.input_size, 224);
    }
}
