pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::{anyhow, Result};

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

use crate::detect::backend::InferenceBackend;

/// Pick a backend from the configured model path.
///
/// - `stub://...` -> [`StubBackend`]
/// - `*.onnx` -> `TractBackend` (feature `backend-tract`)
pub fn open_backend(model_path: &str) -> Result<Box<dyn InferenceBackend>> {
    if model_path.starts_with("stub://") {
        return Ok(Box::new(StubBackend::from_uri(model_path)?));
    }
    if model_path.to_ascii_lowercase().ends_with(".onnx") {
        #[cfg(feature = "backend-tract")]
        {
            return Ok(Box::new(TractBackend::new(
                model_path,
                tract::DEFAULT_INPUT_SIZE,
            )?));
        }
        #[cfg(not(feature = "backend-tract"))]
        {
            return Err(anyhow!(
                "ONNX model {} requires the backend-tract feature",
                model_path
            ));
        }
    }
    Err(anyhow!(
        "unsupported model path {}; expected stub://... or an .onnx file",
        model_path
    ))
}
