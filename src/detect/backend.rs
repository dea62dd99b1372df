use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Inference backend trait.
///
/// A backend wraps the object-detection model: given a frame, it returns every
/// region it classified, with boxes in the frame's pixel coordinates. It does not
/// filter by confidence, annotate, or keep the frame past the call.
pub trait InferenceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on one frame.
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
