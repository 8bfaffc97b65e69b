//! Detector session
//!
//! Thin wrapper around an ONNX Runtime session holding the fixed-input
//! object detection model. The asset takes a `[1, 3, size, size]`
//! normalized RGB tensor named `images` and produces `[1, N, 6]` rows
//! (x0, y0, x1, y1, score, class-id) named `output0`.

use std::path::{Path, PathBuf};

use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};

use super::postprocess::{candidates_from_output, Candidate};
use crate::error::{AppError, Result};

/// Input tensor name of the fixed model asset
const INPUT_NAME: &str = "images";
/// Output tensor name of the fixed model asset
const OUTPUT_NAME: &str = "output0";

/// Loaded detector handle
///
/// `infer` takes `&self`; serialization of concurrent invocations is the
/// caller's responsibility (the engine routes all inference through a
/// single worker task).
#[derive(Debug)]
pub struct Detector {
    session: Session,
    model_path: PathBuf,
    input_size: u32,
}

impl Detector {
    /// Load the model from disk
    ///
    /// This is synchronous CPU-bound work; async callers should wrap it in
    /// `spawn_blocking`.
    pub fn load(path: &Path, input_size: u32) -> Result<Self> {
        if !path.exists() {
            return Err(AppError::ModelLoad(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        let session = Session::builder()
            .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|builder| builder.with_intra_threads(2))
            .and_then(|builder| builder.commit_from_file(path))
            .map_err(|e| AppError::ModelLoad(e.to_string()))?;

        tracing::info!(model = %path.display(), input_size, "Detector model loaded");

        Ok(Self {
            session,
            model_path: path.to_path_buf(),
            input_size,
        })
    }

    /// Run the detector on a prepared input tensor
    pub fn infer(&self, input: &Array4<f32>) -> Result<Vec<Candidate>> {
        let inputs = ort::inputs![INPUT_NAME => input.view()]
            .map_err(|e| AppError::Inference(e.to_string()))?;

        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| AppError::Inference(e.to_string()))?;

        let output = outputs[OUTPUT_NAME]
            .try_extract_tensor::<f32>()
            .map_err(|e| AppError::Inference(e.to_string()))?;

        candidates_from_output(&output)
    }

    /// Path the model was loaded from
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Fixed square input edge in pixels
    pub fn input_size(&self) -> u32 {
        self.input_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_model() {
        let err = Detector::load(Path::new("/nonexistent/model.onnx"), 640).unwrap_err();
        assert!(matches!(err, AppError::ModelLoad(_)));
    }
}
